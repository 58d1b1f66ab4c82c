//! Registry of named pools.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::PooledConnection;
use crate::error::{PoolError, Result};
use crate::pool::Pool;
use crate::session::Session;

/// Maps datasource names to pools.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct DataSources {
    pools: Arc<RwLock<HashMap<String, Pool>>>,
}

impl DataSources {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pool` under its own name, returning any pool it replaces.
    pub fn register(&self, pool: Pool) -> Option<Pool> {
        let name = pool.name().to_string();
        tracing::debug!(datasource = %name, "registering datasource");
        self.pools.write().insert(name, pool)
    }

    /// Look up a pool by datasource name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Pool> {
        self.pools.read().get(name).cloned()
    }

    /// Remove a pool from the registry without closing it.
    pub fn remove(&self, name: &str) -> Option<Pool> {
        self.pools.write().remove(name)
    }

    /// Registered datasource names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn pool(&self, name: &str) -> Result<Pool> {
        self.get(name)
            .ok_or_else(|| PoolError::UnknownDataSource(name.to_string()))
    }

    /// Acquire a connection from the named pool.
    pub fn connection(&self, name: &str) -> Result<PooledConnection> {
        self.pool(name)?.acquire()
    }

    /// Acquire a connection with statement audit switched on or off.
    pub fn connection_with_audit(&self, name: &str, audit: bool) -> Result<PooledConnection> {
        let conn = self.connection(name)?;
        conn.enable_audit(audit);
        Ok(conn)
    }

    /// Create an inactive session on the named pool.
    pub fn session(&self, name: &str) -> Result<Session> {
        Ok(Session::new(&self.pool(name)?))
    }

    /// Close and unregister every pool.
    pub fn close_all(&self) {
        let pools: Vec<Pool> = self.pools.write().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            pool.close();
        }
    }
}
