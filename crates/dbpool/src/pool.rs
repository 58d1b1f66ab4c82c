//! Connection pool implementation.
//!
//! The pool owns a small collection of [`ConnectionHandle`]s behind one
//! mutex. Acquisition scans for the first free handle in insertion order,
//! opens a new connection while below the maximum size, and otherwise waits
//! on a condition variable until a handle is released or the wait timeout
//! elapses.
//!
//! Native calls (connect, validate, close and the closed check on a freshly
//! leased handle) are made outside the pool mutex. Connections being opened
//! are counted as pending so that `total + pending` never exceeds the
//! maximum size.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::{AlertLevel, AlertThresholds, PoolConfig};
use crate::connection::PooledConnection;
use crate::driver::{Connector, NativeConnection};
use crate::error::{PoolError, Result};
use crate::handle::{ConnectionHandle, HandleState, LeaseInfo, Owner};
use crate::properties::PoolProperties;
use crate::session;
use crate::sweeper::{SweepReport, Sweeper};

/// A bounded pool of database connections.
///
/// Cloning a `Pool` is cheap and yields another reference to the same pool.
///
/// # Example
///
/// ```rust,ignore
/// use dbpool::{Pool, PoolConfig};
///
/// let pool = Pool::builder()
///     .name("orders")
///     .url("db://localhost/orders")
///     .min_size(1)
///     .max_size(3)
///     .validation_query("SELECT 1")
///     .connector(driver)
///     .build()?;
///
/// let conn = pool.acquire()?;
/// conn.execute("UPDATE orders SET state = 'shipped' WHERE id = 7")?;
/// conn.close()?;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    connector: Box<dyn Connector>,
    pub(crate) properties: PoolProperties,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) available: Condvar,
    next_connection_id: AtomicU64,
    created_at: Instant,
    pub(crate) metrics: Mutex<PoolMetricsInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

/// State guarded by the pool mutex.
pub(crate) struct PoolState {
    pub(crate) handles: Vec<Arc<ConnectionHandle>>,
    pub(crate) pending: usize,
    pub(crate) waiting: usize,
    pub(crate) peak: usize,
    pub(crate) closed: bool,
    pub(crate) thresholds: AlertThresholds,
}

impl PoolState {
    fn new(thresholds: AlertThresholds) -> Self {
        Self {
            handles: Vec::new(),
            pending: 0,
            waiting: 0,
            peak: 0,
            closed: false,
            thresholds,
        }
    }

    pub(crate) fn push(&mut self, handle: Arc<ConnectionHandle>) {
        self.handles.push(handle);
        self.peak = self.peak.max(self.handles.len());
    }

    pub(crate) fn contains(&self, handle: &Arc<ConnectionHandle>) -> bool {
        self.handles.iter().any(|h| Arc::ptr_eq(h, handle))
    }

    /// Remove and retire a handle. Returns `false` if it was not pooled.
    pub(crate) fn remove(&mut self, handle: &Arc<ConnectionHandle>) -> bool {
        match self.handles.iter().position(|h| Arc::ptr_eq(h, handle)) {
            Some(index) => {
                self.handles.remove(index).retire();
                true
            }
            None => false,
        }
    }

    pub(crate) fn in_use(&self) -> usize {
        self.handles
            .iter()
            .filter(|h| h.state() == HandleState::Leased)
            .count()
    }

    fn free(&self) -> usize {
        self.handles
            .iter()
            .filter(|h| h.state() == HandleState::Free)
            .count()
    }

    /// Lease the first free handle in insertion order.
    ///
    /// Only handle metadata is touched here. Whether the native connection
    /// is still open is checked by the caller once the pool lock is released.
    fn lease_free(&mut self, owner: &Owner) -> Option<(Arc<ConnectionHandle>, u64)> {
        self.handles.iter().find_map(|handle| {
            handle
                .lease(owner)
                .map(|lease_id| (Arc::clone(handle), lease_id))
        })
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
pub(crate) struct PoolMetricsInner {
    pub(crate) connections_created: u64,
    pub(crate) connections_closed: u64,
    pub(crate) checkouts_successful: u64,
    pub(crate) checkouts_failed: u64,
    pub(crate) validations_performed: u64,
    pub(crate) validations_failed: u64,
    pub(crate) sweeps_performed: u64,
    pub(crate) resets_performed: u64,
}

impl PoolInner {
    fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Open a native connection with the pool's auto-commit mode applied.
    fn connect(&self) -> Result<Box<dyn NativeConnection>> {
        tracing::debug!(pool = %self.config.name, "creating a new connection");
        let mut native = self
            .connector
            .connect(&self.config.url, &self.config.credentials)?;
        if let Err(e) = native.set_auto_commit(self.config.auto_commit) {
            let _ = native.close();
            return Err(e.into());
        }
        self.metrics.lock().connections_created += 1;
        Ok(native)
    }

    /// Close a handle that has already been removed from the collection.
    ///
    /// Failures are logged, never propagated.
    pub(crate) fn discard(&self, handle: &ConnectionHandle, reason: &str) {
        tracing::debug!(
            pool = %self.config.name,
            connection = handle.name(),
            age_ms = handle.age().as_millis() as u64,
            reason,
            "removing connection from the pool"
        );
        if let Err(e) = handle.hard_close() {
            tracing::warn!(
                pool = %self.config.name,
                connection = handle.name(),
                error = %e,
                "failed to close connection"
            );
        }
        self.metrics.lock().connections_closed += 1;
    }

    /// Open free connections until the pool holds at least `min_size`.
    ///
    /// Stops at the first connect failure. Returns the number created.
    pub(crate) fn fill_to_minimum(&self) -> usize {
        let mut created = 0;
        loop {
            let mut state = self.state.lock();
            if state.closed || state.handles.len() + state.pending >= self.config.min_size {
                break;
            }
            state.pending += 1;
            let result = MutexGuard::unlocked(&mut state, || self.connect());
            state.pending -= 1;

            match result {
                Ok(native) if !state.closed => {
                    let handle = Arc::new(ConnectionHandle::new(self.next_connection_id(), native));
                    state.push(handle);
                    created += 1;
                    drop(state);
                    self.available.notify_one();
                }
                Ok(mut native) => {
                    drop(state);
                    let _ = native.close();
                    self.metrics.lock().connections_closed += 1;
                    break;
                }
                Err(e) => {
                    drop(state);
                    self.available.notify_one();
                    tracing::warn!(
                        pool = %self.config.name,
                        error = %e,
                        "unable to restore minimum number of connections"
                    );
                    break;
                }
            }
        }
        created
    }

    fn check_load(&self, in_use: usize, thresholds: AlertThresholds) {
        let max = self.config.max_size;
        match thresholds.evaluate(in_use, max) {
            Some(AlertLevel::Error) => tracing::error!(
                pool = %self.config.name,
                level = thresholds.error,
                in_use,
                max,
                "pool reached error alert level"
            ),
            Some(AlertLevel::Warning) => tracing::warn!(
                pool = %self.config.name,
                level = thresholds.warning,
                in_use,
                max,
                "pool reached warning alert level"
            ),
            None => {}
        }
    }

    fn stop_sweeper(&self) -> Option<Sweeper> {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = &sweeper {
            sweeper.stop();
        }
        sweeper
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // May run on the sweeper thread itself, so signal without joining.
        drop(self.stop_sweeper());
        let handles = std::mem::take(&mut self.state.get_mut().handles);
        for handle in handles {
            handle.retire();
            self.discard(&handle, "pool dropped");
        }
    }
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a pool, eagerly opening `min_size` connections and starting
    /// the background sweeper.
    pub fn new(config: PoolConfig, connector: impl Connector + 'static) -> Result<Self> {
        Self::with_properties(config, connector, PoolProperties::new())
    }

    /// Create a pool that reads runtime overrides from `properties`.
    pub fn with_properties(
        config: PoolConfig,
        connector: impl Connector + 'static,
        properties: PoolProperties,
    ) -> Result<Self> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState::new(config.alert_thresholds)),
            config,
            connector: Box::new(connector),
            properties,
            available: Condvar::new(),
            next_connection_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
            sweeper: Mutex::new(None),
        });

        let created = inner.fill_to_minimum();
        if created < inner.config.min_size {
            tracing::error!(
                pool = %inner.config.name,
                min = inner.config.min_size,
                created,
                "minimum connections in pool cannot be created"
            );
        }

        let sweeper = Sweeper::spawn(
            Arc::downgrade(&inner),
            &inner.config.name,
            inner.config.sweep_interval,
        )
        .map_err(PoolError::SweeperSpawn)?;
        *inner.sweeper.lock() = Some(sweeper);

        tracing::info!(
            pool = %inner.config.name,
            min = inner.config.min_size,
            max = inner.config.max_size,
            created,
            "connection pool created"
        );

        Ok(Self { inner })
    }

    /// Whether two values refer to the same pool.
    #[must_use]
    pub fn ptr_eq(&self, other: &Pool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The logical pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Runtime properties read by this pool.
    #[must_use]
    pub fn properties(&self) -> &PoolProperties {
        &self.inner.properties
    }

    /// Get a connection.
    ///
    /// If the calling thread has an active [`Session`](crate::Session) for
    /// this pool, the session's connection is returned. Otherwise a free
    /// connection is leased, a new one is opened while below the maximum
    /// size, or the call waits up to the wait timeout and then fails with
    /// [`PoolError::PoolExhausted`].
    pub fn acquire(&self) -> Result<PooledConnection> {
        if let Some(conn) = session::bound_connection(self) {
            return Ok(conn);
        }
        self.acquire_within(self.wait_timeout())
    }

    /// Get a connection without waiting.
    ///
    /// Returns `None` if the pool is at capacity with no free connection.
    pub fn try_acquire(&self) -> Result<Option<PooledConnection>> {
        if let Some(conn) = session::bound_connection(self) {
            return Ok(Some(conn));
        }
        match self.acquire_within(Duration::ZERO) {
            Ok(conn) => Ok(Some(conn)),
            Err(PoolError::PoolExhausted { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn wait_timeout(&self) -> Duration {
        self.inner
            .properties
            .wait_time()
            .unwrap_or(self.inner.config.wait_timeout)
    }

    fn acquire_within(&self, wait: Duration) -> Result<PooledConnection> {
        let inner = &*self.inner;
        let owner = Owner::current(
            inner.config.track_owner_trace || inner.properties.tracker_enabled(),
        );
        let started = Instant::now();
        let deadline = started + wait;
        let mut dead = Vec::new();
        let mut orphan = None;
        let mut waited = false;

        let mut state = inner.state.lock();
        let outcome = loop {
            if state.closed {
                break Err(PoolError::PoolClosed {
                    pool: inner.config.name.clone(),
                });
            }

            if let Some((handle, lease_id)) = state.lease_free(&owner) {
                let closed = MutexGuard::unlocked(&mut state, || handle.is_closed());
                if state.closed {
                    continue;
                }
                if !closed && handle.holds_lease(lease_id) {
                    break Ok((handle, lease_id));
                }
                if closed && state.remove(&handle) {
                    dead.push(handle);
                }
                continue;
            }

            if state.handles.len() + state.pending < inner.config.max_size {
                state.pending += 1;
                let result = MutexGuard::unlocked(&mut state, || inner.connect());
                state.pending -= 1;
                match result {
                    Ok(native) if state.closed => {
                        orphan = Some(native);
                        break Err(PoolError::PoolClosed {
                            pool: inner.config.name.clone(),
                        });
                    }
                    Ok(native) => {
                        let (handle, lease_id) = ConnectionHandle::new_leased(
                            inner.next_connection_id(),
                            native,
                            &owner,
                        );
                        let handle = Arc::new(handle);
                        state.push(Arc::clone(&handle));
                        break Ok((handle, lease_id));
                    }
                    Err(e) => {
                        inner.available.notify_one();
                        break Err(e);
                    }
                }
            }

            if Instant::now() >= deadline {
                break Err(PoolError::PoolExhausted {
                    pool: inner.config.name.clone(),
                    waited: started.elapsed(),
                });
            }

            waited = true;
            state.waiting += 1;
            inner.available.wait_until(&mut state, deadline);
            state.waiting -= 1;
        };
        let in_use = state.in_use();
        let thresholds = state.thresholds;
        drop(state);

        for handle in &dead {
            inner.discard(handle, "closed while idle");
        }
        if let Some(mut native) = orphan {
            tracing::debug!(
                pool = %inner.config.name,
                "pool closed while connecting, dropping new connection"
            );
            if let Err(e) = native.close() {
                tracing::warn!(
                    pool = %inner.config.name,
                    error = %e,
                    "failed to close connection"
                );
            }
            inner.metrics.lock().connections_closed += 1;
        }
        if waited {
            tracing::warn!(
                pool = %inner.config.name,
                waited_ms = started.elapsed().as_millis() as u64,
                "acquire was made to wait"
            );
        }
        inner.check_load(in_use, thresholds);

        let (handle, lease_id) = match outcome {
            Ok(leased) => leased,
            Err(e) => {
                inner.metrics.lock().checkouts_failed += 1;
                return Err(e);
            }
        };

        let auto_commit = inner.config.auto_commit;
        if let Err(e) = handle.with_native(|native| native.set_auto_commit(auto_commit)) {
            inner.metrics.lock().checkouts_failed += 1;
            self.release(&handle, lease_id);
            return Err(e.into());
        }

        inner.metrics.lock().checkouts_successful += 1;
        tracing::trace!(
            pool = %inner.config.name,
            connection = handle.name(),
            "returning connection from the pool for lease"
        );
        Ok(PooledConnection::new(handle, lease_id, self.clone()))
    }

    /// Return a leased handle to the pool.
    ///
    /// A handle whose native connection reports itself closed is removed
    /// instead. Stale lease ids are ignored.
    pub(crate) fn release(&self, handle: &Arc<ConnectionHandle>, lease_id: u64) {
        let inner = &*self.inner;
        let dead = handle.is_closed();

        let mut state = inner.state.lock();
        if !handle.holds_lease(lease_id) {
            return;
        }
        if dead {
            state.remove(handle);
            drop(state);
            inner.available.notify_one();
            inner.discard(handle, "closed while leased");
            return;
        }
        handle.expire(lease_id);
        drop(state);
        inner.available.notify_one();
    }

    /// Close every connection, including leased ones, then reopen up to
    /// the minimum size.
    ///
    /// Close failures are logged and do not stop the reset.
    pub fn reset(&self) {
        let inner = &*self.inner;
        let drained = {
            let mut state = inner.state.lock();
            let drained = std::mem::take(&mut state.handles);
            for handle in &drained {
                handle.retire();
            }
            drained
        };

        let removed = drained.len();
        for handle in drained {
            inner.discard(&handle, "pool reset");
        }
        let created = inner.fill_to_minimum();

        inner.metrics.lock().resets_performed += 1;
        inner.available.notify_all();
        tracing::info!(
            pool = %inner.config.name,
            removed,
            created,
            "connection pool reset"
        );
    }

    /// Run one sweeper cycle now.
    pub fn sweep(&self) -> SweepReport {
        crate::sweeper::sweep(&self.inner)
    }

    /// Current load alert thresholds.
    #[must_use]
    pub fn thresholds(&self) -> AlertThresholds {
        self.inner.state.lock().thresholds
    }

    /// Replace the load alert thresholds.
    pub fn set_thresholds(&self, thresholds: AlertThresholds) {
        self.inner.state.lock().thresholds = thresholds;
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: state.free(),
            in_use: state.in_use(),
            total: state.handles.len(),
            waiting: state.waiting,
            peak: state.peak,
            min: self.inner.config.min_size,
            max: self.inner.config.max_size,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            validations_performed: inner.validations_performed,
            validations_failed: inner.validations_failed,
            sweeps_performed: inner.sweeps_performed,
            resets_performed: inner.resets_performed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Describe every outstanding lease: who holds it and for how long.
    #[must_use]
    pub fn lease_report(&self) -> Vec<LeaseInfo> {
        let state = self.inner.state.lock();
        state
            .handles
            .iter()
            .filter_map(|handle| handle.lease_info())
            .collect()
    }

    /// Close the pool.
    ///
    /// Stops the sweeper, wakes waiting callers with
    /// [`PoolError::PoolClosed`] and closes every connection.
    pub fn close(&self) {
        let inner = &*self.inner;
        let drained = {
            let mut state = inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained = std::mem::take(&mut state.handles);
            for handle in &drained {
                handle.retire();
            }
            drained
        };
        inner.available.notify_all();

        if let Some(sweeper) = inner.stop_sweeper() {
            sweeper.join();
        }
        for handle in drained {
            inner.discard(&handle, "pool closed");
        }
        tracing::info!(pool = %inner.config.name, "connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.config.name)
            .field("min", &self.inner.config.min_size)
            .field("max", &self.inner.config.max_size)
            .finish()
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .pool_config(config)
///     .connector(driver)
///     .build()?;
/// ```
pub struct PoolBuilder {
    pool_config: PoolConfig,
    properties: PoolProperties,
    connector: Option<Box<dyn Connector>>,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            properties: PoolProperties::new(),
            connector: None,
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the connector used to open native connections.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Box::new(connector));
        self
    }

    /// Set the runtime properties.
    #[must_use]
    pub fn properties(mut self, properties: PoolProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Set the logical pool name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.pool_config.name = name.into();
        self
    }

    /// Set the native connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.pool_config.url = url.into();
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_size(mut self, count: usize) -> Self {
        self.pool_config.min_size = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_size(mut self, count: usize) -> Self {
        self.pool_config.max_size = count;
        self
    }

    /// Set the validation query.
    #[must_use]
    pub fn validation_query(mut self, sql: impl Into<String>) -> Self {
        self.pool_config.validation_query = Some(sql.into());
        self
    }

    /// Set the acquisition wait timeout.
    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.wait_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<Pool> {
        let connector = self.connector.ok_or_else(|| {
            PoolError::Configuration("a connector is required to build a pool".into())
        })?;
        Pool::with_properties(self.pool_config, connector, self.properties)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: usize,
    /// Number of connections currently leased.
    pub in_use: usize,
    /// Total number of connections.
    pub total: usize,
    /// Number of callers waiting for a connection.
    pub waiting: usize,
    /// Largest total ever reached.
    pub peak: usize,
    /// Configured minimum size.
    pub min: usize,
    /// Configured maximum size.
    pub max: usize,
}

impl PoolStatus {
    /// Leased connections as a percentage of `max`, the same figure the
    /// load alerts compare against. Zero for a pool with no capacity.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        share(self.in_use as u64, self.max as u64).map_or(0.0, |share| share * 100.0)
    }

    /// `true` once the pool can no longer open a connection for a caller
    /// that finds nothing free.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.max.saturating_sub(self.total) == 0
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, pool closed, connect errors).
    pub checkouts_failed: u64,
    /// Validation queries run by the sweeper.
    pub validations_performed: u64,
    /// Validation queries that failed.
    pub validations_failed: u64,
    /// Sweeper cycles completed.
    pub sweeps_performed: u64,
    /// Administrative resets performed.
    pub resets_performed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Fraction of acquires that handed out a connection. A pool that has
    /// not been asked yet reports 1.0.
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let attempts = self.checkouts_successful + self.checkouts_failed;
        share(self.checkouts_successful, attempts).unwrap_or(1.0)
    }

    /// Fraction of sweeper validations that passed, 1.0 before the first.
    #[must_use]
    pub fn validation_success_rate(&self) -> f64 {
        let passed = self.validations_performed.saturating_sub(self.validations_failed);
        share(passed, self.validations_performed).unwrap_or(1.0)
    }
}

fn share(part: u64, whole: u64) -> Option<f64> {
    (whole > 0).then(|| part as f64 / whole as f64)
}
