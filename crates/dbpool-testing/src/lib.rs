//! # dbpool-testing
//!
//! Test infrastructure for the `dbpool` connection pool.
//!
//! Provides an in-memory native driver whose connections can be inspected
//! and faulted from tests:
//!
//! - [`MockConnector`] opens [`MockConnection`]s and keeps the server side
//!   ([`MockRemote`]) of each one it opened
//! - a remote flips failure switches (refuse validation, simulate a server-side
//!   disconnect) and read back commits, rollbacks and executed SQL
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbpool::{Pool, PoolConfig};
//! use dbpool_testing::{MockConnector, test_config};
//!
//! let driver = MockConnector::new();
//! let pool = Pool::new(test_config("orders").max_size(2), driver.clone())?;
//!
//! let conn = pool.acquire()?;
//! drop(conn);
//!
//! assert_eq!(driver.connect_count(), 1);
//! assert_eq!(driver.remote(0).unwrap().rollbacks(), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use dbpool::{Connector, Credentials, DriverError, NativeConnection, NativeStatement, PoolConfig};
use parking_lot::Mutex;
use thiserror::Error;

/// Failures produced by the mock driver.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MockError {
    /// The connector was told to refuse new connections.
    #[error("connection refused by mock server at {url}")]
    ConnectRefused {
        /// URL the pool tried to connect to.
        url: String,
    },

    /// The connection was closed.
    #[error("connection is closed")]
    Closed,

    /// The connection was told to fail every query.
    #[error("query failed: {sql}")]
    QueryFailed {
        /// Statement text.
        sql: String,
    },

    /// The connection was told to fail transaction control.
    #[error("{operation} failed")]
    TransactionFailed {
        /// `commit` or `rollback`.
        operation: &'static str,
    },
}

impl From<MockError> for DriverError {
    fn from(e: MockError) -> Self {
        DriverError::with_source("mock driver error", e)
    }
}

/// Build a pool configuration suited to tests: no minimum, a short wait
/// timeout and a sweep interval long enough that tests drive sweeps by
/// hand.
#[must_use]
pub fn test_config(name: &str) -> PoolConfig {
    PoolConfig::new()
        .name(name)
        .url(format!("mock://localhost/{name}"))
        .credentials(Credentials::new("tester", "secret"))
        .wait_timeout(Duration::from_millis(100))
        .sweep_interval(Duration::from_secs(3600))
}

#[derive(Debug, Default)]
struct ConnectionState {
    closed: bool,
    auto_commit: bool,
    fail_queries: bool,
    fail_close: bool,
    fail_rollback: bool,
    commits: usize,
    rollbacks: usize,
    closes: usize,
    statements_closed: usize,
    statement_delay: Duration,
    executed: Vec<String>,
}

/// Inspection and fault-injection handle for one mock connection.
#[derive(Debug, Clone)]
pub struct MockRemote {
    id: usize,
    state: Arc<Mutex<ConnectionState>>,
}

impl MockRemote {
    /// Order in which the connector opened this connection, from 0.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Whether the connection is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Simulate the server dropping the connection.
    pub fn disconnect(&self) {
        self.state.lock().closed = true;
    }

    /// Make every query (including validation) fail or succeed.
    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().fail_queries = fail;
    }

    /// Make `close` fail. The connection still counts as closed.
    pub fn fail_close(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    /// Make `rollback` fail.
    pub fn fail_rollback(&self, fail: bool) {
        self.state.lock().fail_rollback = fail;
    }

    /// Delay added to every prepared statement execution.
    pub fn set_statement_delay(&self, delay: Duration) {
        self.state.lock().statement_delay = delay;
    }

    /// Current auto-commit mode.
    #[must_use]
    pub fn auto_commit(&self) -> bool {
        self.state.lock().auto_commit
    }

    /// Number of commits.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    /// Number of rollbacks.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.state.lock().rollbacks
    }

    /// Number of `close` calls.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    /// Number of prepared statements closed.
    #[must_use]
    pub fn statements_closed(&self) -> usize {
        self.state.lock().statements_closed
    }

    /// SQL executed on this connection, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    refuse: bool,
    connect_delay: Duration,
    remotes: Vec<MockRemote>,
}

/// Connector that opens in-memory connections.
///
/// Clones share state, so a test can keep one clone while the pool owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MockConnector {
    /// Create a connector that accepts every connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse = refuse;
    }

    /// Delay each successful connect.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.lock().remotes.len()
    }

    /// Server side of the `index`-th connection opened.
    #[must_use]
    pub fn remote(&self, index: usize) -> Option<MockRemote> {
        self.state.lock().remotes.get(index).cloned()
    }

    /// Server sides of every connection opened, in order.
    #[must_use]
    pub fn remotes(&self) -> Vec<MockRemote> {
        self.state.lock().remotes.clone()
    }

    /// Number of opened connections that are not closed.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.state
            .lock()
            .remotes
            .iter()
            .filter(|remote| !remote.is_closed())
            .count()
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        url: &str,
        _credentials: &Credentials,
    ) -> Result<Box<dyn NativeConnection>, DriverError> {
        let delay = {
            let state = self.state.lock();
            if state.refuse {
                return Err(MockError::ConnectRefused {
                    url: url.to_string(),
                }
                .into());
            }
            state.connect_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut state = self.state.lock();
        let remote = MockRemote {
            id: state.remotes.len(),
            state: Arc::new(Mutex::new(ConnectionState {
                auto_commit: true,
                ..ConnectionState::default()
            })),
        };
        state.remotes.push(remote.clone());
        tracing::trace!(id = remote.id, "mock connection opened");
        Ok(Box::new(MockConnection { remote }))
    }
}

/// An in-memory native connection.
#[derive(Debug)]
pub struct MockConnection {
    remote: MockRemote,
}

impl MockConnection {
    fn check_open(state: &ConnectionState) -> Result<(), MockError> {
        if state.closed {
            Err(MockError::Closed)
        } else {
            Ok(())
        }
    }
}

impl NativeConnection for MockConnection {
    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        let mut state = self.remote.state.lock();
        Self::check_open(&state)?;
        if state.fail_queries {
            return Err(MockError::QueryFailed {
                sql: sql.to_string(),
            }
            .into());
        }
        state.executed.push(sql.to_string());
        Ok(1)
    }

    fn prepare(&mut self, sql: &str) -> Result<Box<dyn NativeStatement>, DriverError> {
        Self::check_open(&self.remote.state.lock())?;
        Ok(Box::new(MockStatement {
            sql: sql.to_string(),
            remote: self.remote.clone(),
        }))
    }

    fn is_closed(&self) -> bool {
        self.remote.is_closed()
    }

    fn auto_commit(&self) -> Result<bool, DriverError> {
        let state = self.remote.state.lock();
        Self::check_open(&state)?;
        Ok(state.auto_commit)
    }

    fn set_auto_commit(&mut self, enabled: bool) -> Result<(), DriverError> {
        let mut state = self.remote.state.lock();
        Self::check_open(&state)?;
        state.auto_commit = enabled;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        let mut state = self.remote.state.lock();
        Self::check_open(&state)?;
        state.commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        let mut state = self.remote.state.lock();
        Self::check_open(&state)?;
        if state.fail_rollback {
            return Err(MockError::TransactionFailed {
                operation: "rollback",
            }
            .into());
        }
        state.rollbacks += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        let mut state = self.remote.state.lock();
        state.closes += 1;
        state.closed = true;
        if state.fail_close {
            return Err(MockError::Closed.into());
        }
        Ok(())
    }
}

/// A statement prepared on a [`MockConnection`].
#[derive(Debug)]
pub struct MockStatement {
    sql: String,
    remote: MockRemote,
}

impl NativeStatement for MockStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn execute(&mut self) -> Result<u64, DriverError> {
        let delay = self.remote.state.lock().statement_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = self.remote.state.lock();
        MockConnection::check_open(&state)?;
        if state.fail_queries {
            return Err(MockError::QueryFailed {
                sql: self.sql.clone(),
            }
            .into());
        }
        state.executed.push(self.sql.clone());
        Ok(1)
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.remote.state.lock().statements_closed += 1;
        Ok(())
    }
}
