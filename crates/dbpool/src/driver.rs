//! Capabilities the pool requires from a native database driver.
//!
//! The pool never talks to a database itself. It manages boxed
//! [`NativeConnection`]s produced by a [`Connector`] and forwards the few
//! calls it needs for lifecycle management: validation, auto-commit,
//! commit/rollback and close. Statement execution is a pass-through.

use std::fmt;

use thiserror::Error;

use crate::config::Credentials;

/// Error reported by a native driver.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl DriverError {
    /// Create a driver error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a driver error wrapping an underlying cause.
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A live connection owned by a native database driver.
///
/// Implementations are only ever used by one thread at a time; the pool
/// serializes access through the owning handle.
pub trait NativeConnection: Send + fmt::Debug {
    /// Execute a statement directly, returning the affected row count.
    fn execute(&mut self, sql: &str) -> Result<u64, DriverError>;

    /// Prepare a statement for later execution.
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn NativeStatement>, DriverError>;

    /// Whether the connection has been closed, by us or by the server.
    fn is_closed(&self) -> bool;

    /// Current auto-commit mode.
    fn auto_commit(&self) -> Result<bool, DriverError>;

    /// Change the auto-commit mode.
    fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError>;

    /// Commit the current transaction.
    fn commit(&mut self) -> Result<(), DriverError>;

    /// Roll back the current transaction.
    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Close the connection.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// A statement prepared on a [`NativeConnection`].
pub trait NativeStatement: Send + fmt::Debug {
    /// The SQL text this statement was prepared from.
    fn sql(&self) -> &str;

    /// Execute the statement, returning the affected row count.
    fn execute(&mut self) -> Result<u64, DriverError>;

    /// Close the statement and release its driver resources.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Opens new native connections for a pool.
pub trait Connector: Send + Sync {
    /// Establish a new connection to `url` with the given credentials.
    fn connect(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn NativeConnection>, DriverError>;
}

impl<T: Connector + ?Sized> Connector for std::sync::Arc<T> {
    fn connect(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn NativeConnection>, DriverError> {
        (**self).connect(url, credentials)
    }
}

impl<T: Connector + ?Sized> Connector for Box<T> {
    fn connect(
        &self,
        url: &str,
        credentials: &Credentials,
    ) -> Result<Box<dyn NativeConnection>, DriverError> {
        (**self).connect(url, credentials)
    }
}
