//! Statements prepared through pooled connections.
//!
//! A [`Statement`] forwards execution to the native statement. The owning
//! handle keeps a reference to every statement it opened so they can all be
//! closed when the connection goes back to the pool; using a statement after
//! that fails with [`PoolError::StatementClosed`].
//!
//! When audit is on, each execution is timed and logged together with the
//! datasource name, and executions slower than the configured threshold are
//! logged as warnings.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::driver::{DriverError, NativeStatement};
use crate::error::{PoolError, Result};

/// Shared slot holding a native statement until it is closed.
#[derive(Debug)]
pub(crate) struct StatementSlot {
    sql: String,
    inner: Mutex<Option<Box<dyn NativeStatement>>>,
}

impl StatementSlot {
    pub(crate) fn new(native: Box<dyn NativeStatement>) -> Self {
        Self {
            sql: native.sql().to_string(),
            inner: Mutex::new(Some(native)),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Close the native statement. Closing twice is a no-op.
    pub(crate) fn close(&self) -> std::result::Result<(), DriverError> {
        match self.inner.lock().take() {
            Some(mut native) => native.close(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Audit {
    pub(crate) datasource: String,
    pub(crate) warn_after: Duration,
}

/// A statement prepared on a pooled connection.
#[derive(Debug)]
pub struct Statement {
    slot: std::sync::Arc<StatementSlot>,
    audit: Option<Audit>,
}

impl Statement {
    pub(crate) fn new(slot: std::sync::Arc<StatementSlot>, audit: Option<Audit>) -> Self {
        Self { slot, audit }
    }

    /// The SQL text of this statement.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.slot.sql
    }

    /// Whether the statement has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    /// Whether executions of this statement are audited.
    #[must_use]
    pub fn is_audited(&self) -> bool {
        self.audit.is_some()
    }

    /// Execute the statement, returning the affected row count.
    pub fn execute(&mut self) -> Result<u64> {
        let mut guard = self.slot.inner.lock();
        let native = guard.as_mut().ok_or(PoolError::StatementClosed)?;

        let started = Instant::now();
        let result = native.execute();
        let elapsed = started.elapsed();
        drop(guard);

        if let Some(audit) = &self.audit {
            let thread = std::thread::current();
            let elapsed_ms = elapsed.as_millis() as u64;
            if elapsed > audit.warn_after {
                tracing::warn!(
                    datasource = %audit.datasource,
                    sql = %self.slot.sql,
                    elapsed_ms,
                    threshold_ms = audit.warn_after.as_millis() as u64,
                    "statement execution exceeded warning threshold"
                );
            }
            tracing::info!(
                datasource = %audit.datasource,
                thread = thread.name().unwrap_or("<unnamed>"),
                sql = %self.slot.sql,
                elapsed_ms,
                ok = result.is_ok(),
                "statement executed"
            );
        }

        Ok(result?)
    }

    /// Close the statement.
    pub fn close(self) -> Result<()> {
        Ok(self.slot.close()?)
    }
}
