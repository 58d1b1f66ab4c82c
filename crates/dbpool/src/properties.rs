//! Runtime pool properties.
//!
//! Some settings are re-read while the pool runs instead of being fixed at
//! construction: the sweeper refreshes alert thresholds each cycle, and
//! acquisition honours a wait-time override. [`PoolProperties`] is a shared
//! key/value set the host application may update at any time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

/// Alert thresholds in `Warning=NN%,Error=NN%` form.
pub const DATA_SOURCE_ALARM: &str = "DataSourceAlarm";
/// Acquisition wait timeout in milliseconds.
pub const DB_CONNECTION_WAIT_TIME: &str = "DBConnectionWaitTime";
/// `"true"` records a backtrace of the acquiring call site.
pub const ENABLE_DB_CONNECTION_TRACKER: &str = "EnableDBConnectionTracker";
/// `"true"` permits statement audit logging.
pub const ENABLE_AUDIT: &str = "EnableAudit";
/// Statement execution time in milliseconds above which audit logs a warning.
pub const DB_STATEMENT_WARNING_THRESHOLD: &str = "DBStatementWarningThreshold";

const DEFAULT_STATEMENT_WARNING_THRESHOLD: Duration = Duration::from_millis(10_000);

/// Shared, runtime-mutable pool properties.
///
/// Cloning is cheap; clones observe each other's updates.
#[derive(Debug, Clone, Default)]
pub struct PoolProperties {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl PoolProperties {
    /// Create an empty property set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, returning the previous value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.values.write().insert(key.into(), value.into())
    }

    /// Remove a property, returning its value.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.values.write().remove(key)
    }

    /// Get a property value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    /// Get a property parsed as an integer, if present and well-formed.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.values.read().get(key)?.trim().parse().ok()
    }

    /// Whether a property is set to `"true"`.
    #[must_use]
    pub fn is_enabled(&self, key: &str) -> bool {
        self.values
            .read()
            .get(key)
            .is_some_and(|value| value.trim() == "true")
    }

    /// The non-blank alarm configuration string, if set.
    #[must_use]
    pub fn alarm(&self) -> Option<String> {
        self.get(DATA_SOURCE_ALARM)
            .filter(|value| !value.trim().is_empty())
    }

    /// Wait-time override, if set to a valid number of milliseconds.
    #[must_use]
    pub fn wait_time(&self) -> Option<Duration> {
        self.get_u64(DB_CONNECTION_WAIT_TIME)
            .map(Duration::from_millis)
    }

    /// Whether owner call-site tracking is switched on.
    #[must_use]
    pub fn tracker_enabled(&self) -> bool {
        self.is_enabled(ENABLE_DB_CONNECTION_TRACKER)
    }

    /// Whether statement audit is permitted.
    #[must_use]
    pub fn audit_enabled(&self) -> bool {
        self.is_enabled(ENABLE_AUDIT)
    }

    /// Slow statement threshold for audit warnings.
    #[must_use]
    pub fn statement_warning_threshold(&self) -> Duration {
        self.get_u64(DB_STATEMENT_WARNING_THRESHOLD)
            .map_or(DEFAULT_STATEMENT_WARNING_THRESHOLD, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_values() {
        let props = PoolProperties::new();
        let other = props.clone();
        props.set(ENABLE_AUDIT, "true");
        assert!(other.audit_enabled());
        other.remove(ENABLE_AUDIT);
        assert!(!props.audit_enabled());
    }

    #[test]
    fn test_wait_time_ignores_garbage() {
        let props = PoolProperties::new();
        props.set(DB_CONNECTION_WAIT_TIME, "soon");
        assert_eq!(props.wait_time(), None);
        props.set(DB_CONNECTION_WAIT_TIME, " 1500 ");
        assert_eq!(props.wait_time(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_blank_alarm_is_unset() {
        let props = PoolProperties::new();
        props.set(DATA_SOURCE_ALARM, "   ");
        assert_eq!(props.alarm(), None);
    }

    #[test]
    fn test_statement_threshold_default() {
        let props = PoolProperties::new();
        assert_eq!(
            props.statement_warning_threshold(),
            Duration::from_millis(10_000)
        );
        props.set(DB_STATEMENT_WARNING_THRESHOLD, "25");
        assert_eq!(props.statement_warning_threshold(), Duration::from_millis(25));
    }

    #[test]
    fn test_enabled_requires_exact_true() {
        let props = PoolProperties::new();
        props.set(ENABLE_DB_CONNECTION_TRACKER, "yes");
        assert!(!props.tracker_enabled());
        props.set(ENABLE_DB_CONNECTION_TRACKER, "true");
        assert!(props.tracker_enabled());
    }
}
