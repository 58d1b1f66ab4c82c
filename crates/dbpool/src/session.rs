//! Thread-scoped sessions.
//!
//! A [`Session`] binds one pooled connection to the current thread for a
//! datasource, so that every [`Pool::acquire`] on that thread returns the
//! same connection until the session ends. Auto-commit is forced off while
//! the session is active and restored when it ends; closing the shared
//! connection inside the session does not return it to the pool.
//!
//! The registry of active sessions is thread-local, which makes `Session`
//! neither `Send` nor `Sync`. At most one session per datasource may be
//! active on a thread.
//!
//! # Example
//!
//! ```rust,ignore
//! let session = Session::new(&pool);
//! session.begin()?;
//!
//! let conn = pool.acquire()?; // the session's connection
//! conn.execute("INSERT INTO audit_log VALUES ('created')")?;
//! drop(conn); // stays bound to the session
//!
//! session.commit()?;
//! session.end()?;
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::connection::PooledConnection;
use crate::driver::DriverError;
use crate::error::{PoolError, Result};
use crate::handle::ConnectionHandle;
use crate::pool::Pool;

thread_local! {
    static SESSIONS: RefCell<HashMap<String, Rc<SessionInner>>> = RefCell::new(HashMap::new());
}

struct Bound {
    conn: PooledConnection,
    prior_auto_commit: bool,
}

struct SessionInner {
    datasource: String,
    pool: Pool,
    bound: RefCell<Option<Bound>>,
}

impl SessionInner {
    fn not_active(&self) -> PoolError {
        PoolError::SessionNotActive {
            datasource: self.datasource.clone(),
        }
    }

    fn end(self: &Rc<Self>) -> Result<()> {
        let bound = self
            .bound
            .borrow_mut()
            .take()
            .ok_or_else(|| self.not_active())?;

        // Unregister before closing so the connection's own close sees no
        // active session and returns it to the pool.
        let removed = SESSIONS.with(|sessions| {
            let mut sessions = sessions.borrow_mut();
            match sessions.get(&self.datasource) {
                Some(entry) if Rc::ptr_eq(entry, self) => sessions.remove(&self.datasource),
                _ => None,
            }
        });
        drop(removed);

        let Bound {
            conn,
            prior_auto_commit,
        } = bound;
        let mut failure: Option<DriverError> = None;

        if let Err(e) = conn.rollback() {
            record(&mut failure, e);
        }
        if let Err(e) = conn.set_auto_commit(prior_auto_commit) {
            record(&mut failure, e);
        }
        if let Err(e) = conn.close() {
            record(&mut failure, e);
        }

        tracing::info!(datasource = %self.datasource, "session ended");

        match failure {
            None => Ok(()),
            Some(source) => Err(PoolError::SessionEnd {
                datasource: self.datasource.clone(),
                source,
            }),
        }
    }
}

fn record(failure: &mut Option<DriverError>, error: PoolError) {
    if failure.is_some() {
        tracing::debug!(error = %error, "additional failure while ending session");
        return;
    }
    *failure = Some(match error {
        PoolError::Driver(e) => e,
        other => DriverError::with_source("session cleanup failed", other),
    });
}

/// A thread-scoped unit of work on one datasource.
pub struct Session {
    inner: Rc<SessionInner>,
}

impl Session {
    /// Create an inactive session for `pool`.
    #[must_use]
    pub fn new(pool: &Pool) -> Self {
        Self {
            inner: Rc::new(SessionInner {
                datasource: pool.name().to_string(),
                pool: pool.clone(),
                bound: RefCell::new(None),
            }),
        }
    }

    /// Name of the datasource this session targets.
    #[must_use]
    pub fn datasource(&self) -> &str {
        &self.inner.datasource
    }

    /// Whether `begin` has succeeded and `end` has not yet been called.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.bound.borrow().is_some()
    }

    /// Acquire a connection and bind it to the current thread.
    ///
    /// Fails with [`PoolError::NestedSession`] if a session for the same
    /// datasource is already active on this thread.
    pub fn begin(&self) -> Result<()> {
        let datasource = &self.inner.datasource;
        let nested = self.is_active()
            || SESSIONS.with(|sessions| sessions.borrow().contains_key(datasource));
        if nested {
            return Err(PoolError::NestedSession {
                datasource: datasource.clone(),
            });
        }

        let conn = self.inner.pool.acquire()?;
        let prior_auto_commit = conn.auto_commit()?;
        conn.set_auto_commit(false)?;

        *self.inner.bound.borrow_mut() = Some(Bound {
            conn,
            prior_auto_commit,
        });
        SESSIONS.with(|sessions| {
            sessions
                .borrow_mut()
                .insert(datasource.clone(), Rc::clone(&self.inner));
        });

        tracing::info!(datasource = %datasource, "session started");
        Ok(())
    }

    /// Commit the session's transaction.
    pub fn commit(&self) -> Result<()> {
        let bound = self.inner.bound.borrow();
        let bound = bound.as_ref().ok_or_else(|| self.inner.not_active())?;
        bound.conn.commit()?;
        tracing::info!(datasource = %self.inner.datasource, "session committed");
        Ok(())
    }

    /// Roll back the session's transaction.
    pub fn rollback(&self) -> Result<()> {
        let bound = self.inner.bound.borrow();
        let bound = bound.as_ref().ok_or_else(|| self.inner.not_active())?;
        bound.conn.rollback()?;
        tracing::info!(datasource = %self.inner.datasource, "session rolled back");
        Ok(())
    }

    /// The connection bound to this session.
    pub fn connection(&self) -> Result<PooledConnection> {
        let bound = self.inner.bound.borrow();
        let bound = bound.as_ref().ok_or_else(|| self.inner.not_active())?;
        Ok(bound.conn.share())
    }

    /// End the session: roll back uncommitted work, restore the original
    /// auto-commit mode and return the connection to the pool.
    ///
    /// A cleanup failure is reported as [`PoolError::SessionEnd`]; the
    /// session is ended either way.
    pub fn end(&self) -> Result<()> {
        self.inner.end()
    }

    /// End the session, logging instead of returning any failure.
    pub fn end_quietly(&self) {
        if let Err(e) = self.inner.end() {
            tracing::warn!(
                datasource = %self.inner.datasource,
                error = %e,
                "failed to end session"
            );
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("datasource", &self.inner.datasource)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Force-end every session still active on the current thread.
///
/// Each leaked session is rolled back and its connection returned to the
/// pool. If any were found, fails with
/// [`PoolError::ConnectionLeakDetected`] naming their datasources.
pub fn check_connection_leak() -> Result<()> {
    let leaked: Vec<Rc<SessionInner>> =
        SESSIONS.with(|sessions| sessions.borrow().values().cloned().collect());
    if leaked.is_empty() {
        return Ok(());
    }

    let mut datasources = Vec::with_capacity(leaked.len());
    for session in leaked {
        tracing::error!(
            datasource = %session.datasource,
            "connection leak detected, forcing session end"
        );
        if let Err(e) = session.end() {
            tracing::warn!(datasource = %session.datasource, error = %e, "failed to end leaked session");
        }
        datasources.push(session.datasource.clone());
    }
    datasources.sort();

    Err(PoolError::ConnectionLeakDetected { datasources })
}

/// Datasource names with an active session on the current thread, sorted.
#[must_use]
pub fn open_sessions() -> Vec<String> {
    let mut names = SESSIONS
        .try_with(|sessions| {
            sessions
                .try_borrow()
                .map(|sessions| sessions.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        })
        .unwrap_or_default();
    names.sort();
    names
}

fn with_bound<R>(pool: &Pool, f: impl FnOnce(&Bound) -> R) -> Option<R> {
    SESSIONS
        .try_with(|sessions| {
            let sessions = sessions.try_borrow().ok()?;
            let session = sessions.get(pool.name())?;
            if !session.pool.ptr_eq(pool) {
                return None;
            }
            let bound = session.bound.try_borrow().ok()?;
            bound.as_ref().map(f)
        })
        .ok()
        .flatten()
}

/// The connection of this thread's active session on `pool`, if any.
pub(crate) fn bound_connection(pool: &Pool) -> Option<PooledConnection> {
    with_bound(pool, |bound| bound.conn.share())
}

/// Whether `handle` is the connection of this thread's active session on
/// `pool`.
pub(crate) fn is_bound(pool: &Pool, handle: &Arc<ConnectionHandle>) -> bool {
    with_bound(pool, |bound| Arc::ptr_eq(bound.conn.handle(), handle)).unwrap_or(false)
}
