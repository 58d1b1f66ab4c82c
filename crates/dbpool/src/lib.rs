//! # dbpool
//!
//! Bounded, thread-safe connection pool for relational database drivers.
//!
//! The pool manages native connections supplied by a [`Connector`] and hands
//! them out under a lease discipline: each connection has at most one lease
//! holder at a time, and callers block up to a configurable wait timeout
//! when the pool is at capacity.
//!
//! ## Features
//!
//! - Capacity-bounded acquisition with a wait timeout
//! - Background sweeper that validates idle connections, evicts stale ones
//!   and restores the minimum pool size
//! - Load alerts at configurable warning/error percentages
//! - Thread-scoped [`Session`]s that share one transactional connection
//!   across call sites, with leak detection
//! - Optional statement audit logging with a slow-statement threshold
//! - Pool status, metrics and a report of outstanding leases
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbpool::{DataSources, Pool, PoolConfig};
//! use std::time::Duration;
//!
//! let config = PoolConfig::new()
//!     .name("orders")
//!     .url("db://localhost/orders")
//!     .min_size(2)
//!     .max_size(10)
//!     .validation_query("SELECT 1")
//!     .idle_timeout(Duration::from_secs(300));
//!
//! let pool = Pool::new(config, driver)?;
//!
//! let registry = DataSources::new();
//! registry.register(pool.clone());
//!
//! let conn = registry.connection("orders")?;
//! conn.execute("DELETE FROM carts WHERE expired = 1")?;
//! // Connection returned to the pool on drop
//! drop(conn);
//!
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod datasource;
pub mod driver;
pub mod error;
mod handle;
pub mod pool;
pub mod properties;
pub mod session;
pub mod statement;
pub mod sweeper;

// Configuration
pub use config::{AlertLevel, AlertThresholds, Credentials, PoolConfig};
pub use properties::PoolProperties;

// Driver capabilities
pub use driver::{Connector, DriverError, NativeConnection, NativeStatement};

// Error types
pub use error::{PoolError, Result};

// Pool types
pub use connection::PooledConnection;
pub use datasource::DataSources;
pub use handle::LeaseInfo;
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus};
pub use statement::Statement;
pub use sweeper::SweepReport;

// Sessions
pub use session::{Session, check_connection_leak, open_sessions};
