//! Caller-facing pooled connection.

use std::sync::Arc;

use crate::driver::{DriverError, NativeConnection};
use crate::error::{PoolError, Result};
use crate::handle::{ConnectionHandle, current_thread_id};
use crate::pool::Pool;
use crate::session;
use crate::statement::{Audit, Statement, StatementSlot};

/// A connection leased from a [`Pool`].
///
/// Closing it (explicitly or by dropping it) closes every statement it
/// opened and then, unless it is bound to an active [`Session`] of the
/// current thread, commits or rolls back according to its auto-commit mode
/// and returns it to the pool.
///
/// Closing from a thread other than the one that leased the connection
/// closes its statements but does not return it to the pool.
///
/// [`Session`]: crate::Session
pub struct PooledConnection {
    handle: Arc<ConnectionHandle>,
    lease_id: u64,
    pool: Pool,
    released: bool,
}

impl PooledConnection {
    pub(crate) fn new(handle: Arc<ConnectionHandle>, lease_id: u64, pool: Pool) -> Self {
        Self {
            handle,
            lease_id,
            pool,
            released: false,
        }
    }

    /// Another wrapper over the same lease.
    pub(crate) fn share(&self) -> Self {
        Self::new(Arc::clone(&self.handle), self.lease_id, self.pool.clone())
    }

    pub(crate) fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// Pool-assigned connection id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Connection name, `Connection_<id>`.
    #[must_use]
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Name of the pool this connection belongs to.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    /// Whether both wrappers refer to the same underlying connection.
    #[must_use]
    pub fn same_connection(&self, other: &PooledConnection) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    /// Run `f` on the native connection while this wrapper's lease is live.
    fn native<R>(
        &self,
        f: impl FnOnce(&mut dyn NativeConnection) -> std::result::Result<R, DriverError>,
    ) -> Result<R> {
        if !self.handle.holds_lease(self.lease_id) {
            return Err(PoolError::LeaseEnded {
                connection: self.handle.name().to_string(),
            });
        }
        Ok(self.handle.with_native(f)?)
    }

    /// Execute a statement directly, returning the affected row count.
    pub fn execute(&self, sql: &str) -> Result<u64> {
        self.native(|native| native.execute(sql))
    }

    /// Prepare a statement.
    ///
    /// The statement is closed when this connection goes back to the pool.
    /// If audit is on for this connection and allowed by the pool
    /// properties, its executions are timed and logged.
    pub fn prepare(&self, sql: &str) -> Result<Statement> {
        let native = self.native(|native| native.prepare(sql))?;
        let slot = Arc::new(StatementSlot::new(native));
        self.handle.track_statement(Arc::clone(&slot));

        let properties = self.pool.properties();
        let audit = (self.handle.audit() && properties.audit_enabled()).then(|| Audit {
            datasource: self.pool.name().to_string(),
            warn_after: properties.statement_warning_threshold(),
        });
        Ok(Statement::new(slot, audit))
    }

    /// Switch statement audit on or off for this lease.
    pub fn enable_audit(&self, enabled: bool) {
        self.handle.set_audit(enabled);
    }

    /// Current auto-commit mode of the native connection.
    pub fn auto_commit(&self) -> Result<bool> {
        self.native(|native| native.auto_commit())
    }

    /// Change the auto-commit mode.
    ///
    /// Ignored while the connection is bound to an active session.
    pub fn set_auto_commit(&self, enabled: bool) -> Result<()> {
        if session::is_bound(&self.pool, &self.handle) {
            tracing::debug!(
                connection = self.handle.name(),
                "ignoring auto-commit change inside a session"
            );
            return Ok(());
        }
        self.native(|native| native.set_auto_commit(enabled))
    }

    /// Commit the current transaction.
    pub fn commit(&self) -> Result<()> {
        self.native(|native| native.commit())
    }

    /// Roll back the current transaction.
    pub fn rollback(&self) -> Result<()> {
        self.native(|native| native.rollback())
    }

    /// Whether the native connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Close the connection, returning it to the pool.
    ///
    /// A failed commit or rollback is reported, but the connection is
    /// returned to the pool regardless.
    pub fn close(mut self) -> Result<()> {
        self.release_inner().map_err(PoolError::from)
    }

    fn release_inner(&mut self) -> std::result::Result<(), DriverError> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        if !self.handle.holds_lease(self.lease_id) {
            tracing::trace!(
                connection = self.handle.name(),
                "lease already ended, nothing to release"
            );
            return Ok(());
        }

        self.handle.close_statements();

        if !self.handle.is_owned_by(self.lease_id, current_thread_id()) {
            tracing::debug!(
                connection = self.handle.name(),
                "close called from a thread that does not own the lease, ignoring"
            );
            return Ok(());
        }
        self.handle.set_audit(false);
        if session::is_bound(&self.pool, &self.handle) {
            return Ok(());
        }

        let outcome = self.handle.with_native(|native| {
            if native.is_closed() {
                return Ok(());
            }
            if native.auto_commit()? {
                native.commit()
            } else {
                native.rollback()
            }
        });
        self.pool.release(&self.handle, self.lease_id);
        outcome
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::warn!(
                connection = self.handle.name(),
                error = %e,
                "failed to finish transaction while returning connection"
            );
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("name", &self.handle.name())
            .field("pool", &self.pool.name())
            .field("lease", &self.lease_id)
            .finish()
    }
}
