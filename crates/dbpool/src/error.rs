//! Pool error types.

use std::time::Duration;

use thiserror::Error;

use crate::driver::DriverError;

/// Errors that can occur when using the connection pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No connection became available within the wait timeout.
    #[error("no connection available for pool {pool} after waiting {waited:?}")]
    PoolExhausted {
        /// Pool name.
        pool: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The validation query failed on a connection.
    #[error("connection {connection} failed validation")]
    ConnectionInvalid {
        /// Connection name.
        connection: String,
    },

    /// The connection wrapper outlived its lease, for example after a
    /// pool reset or once its session ended.
    #[error("connection {connection} is no longer leased")]
    LeaseEnded {
        /// Connection name.
        connection: String,
    },

    /// A session was begun while another one is active for the same
    /// thread and datasource.
    #[error(
        "nested session is not allowed, end the current session before beginning a new one: {datasource}"
    )]
    NestedSession {
        /// Datasource name.
        datasource: String,
    },

    /// A session operation was called without a prior successful `begin`.
    #[error("session not active: {datasource}")]
    SessionNotActive {
        /// Datasource name.
        datasource: String,
    },

    /// The leak check found sessions that were never ended.
    #[error("database connection leak detected for datasource names: {datasources:?}")]
    ConnectionLeakDetected {
        /// Datasources whose sessions were forcibly ended.
        datasources: Vec<String>,
    },

    /// Ending a session failed while rolling back, restoring auto-commit
    /// or returning the connection. The session is ended regardless.
    #[error("failed to end session for {datasource}: {source}")]
    SessionEnd {
        /// Datasource name.
        datasource: String,
        /// Underlying driver error.
        #[source]
        source: DriverError,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The pool has been closed.
    #[error("pool {pool} is closed")]
    PoolClosed {
        /// Pool name.
        pool: String,
    },

    /// No pool is registered under the requested datasource name.
    #[error("unknown datasource: {0}")]
    UnknownDataSource(String),

    /// The statement was closed, usually because its connection was
    /// returned to the pool.
    #[error("statement is closed")]
    StatementClosed,

    /// The background sweeper thread could not be started.
    #[error("failed to start sweeper thread: {0}")]
    SweeperSpawn(#[source] std::io::Error),

    /// Error reported by the native driver.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Check if this error is a timeout waiting for a connection.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Check if this error is a session state violation.
    #[must_use]
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            Self::NestedSession { .. } | Self::SessionNotActive { .. }
        )
    }
}
