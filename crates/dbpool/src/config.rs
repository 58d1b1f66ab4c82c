//! Pool configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::PoolError;

/// Credentials used by the connector to open native connections.
///
/// A pool holds a single credential set; every connection it opens uses it.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Database user.
    pub user: String,
    /// Database password.
    pub password: String,
}

impl Credentials {
    /// Create a credential set.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Load alert levels, as percentages of the maximum pool size in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertThresholds {
    /// In-use percentage at which a warning is logged.
    pub warning: u32,
    /// In-use percentage at which an error is logged.
    pub error: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning: 60,
            error: 80,
        }
    }
}

/// Severity of a load alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    /// Load reached the warning threshold.
    Warning,
    /// Load reached the error threshold.
    Error,
}

impl AlertThresholds {
    /// Create thresholds from warning and error percentages.
    #[must_use]
    pub fn new(warning: u32, error: u32) -> Self {
        Self { warning, error }
    }

    /// Classify a load of `in_use` out of `max` connections.
    ///
    /// The error level takes precedence over the warning level.
    #[must_use]
    pub fn evaluate(&self, in_use: usize, max: usize) -> Option<AlertLevel> {
        if max == 0 {
            return None;
        }
        let percent = (in_use as f64 / max as f64) * 100.0;
        if percent >= f64::from(self.error) {
            Some(AlertLevel::Error)
        } else if percent >= f64::from(self.warning) {
            Some(AlertLevel::Warning)
        } else {
            None
        }
    }
}

impl fmt::Display for AlertThresholds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Warning={}%,Error={}%", self.warning, self.error)
    }
}

impl FromStr for AlertThresholds {
    type Err = PoolError;

    /// Parse a `Warning=NN%,Error=NN%` string, case-insensitively.
    ///
    /// The pattern may appear anywhere in the input.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static ALARM_RE: Lazy<Regex> = Lazy::new(|| {
            #[allow(clippy::unwrap_used)]
            Regex::new(r"(?is)Warning=(\d+)%,Error=(\d+)%").unwrap()
        });

        let invalid = || {
            PoolError::Configuration(format!(
                "invalid alarm configuration [{s}], expected format is Warning=xx%,Error=xx%"
            ))
        };

        let caps = ALARM_RE.captures(s).ok_or_else(invalid)?;
        let warning = caps[1].parse().map_err(|_| invalid())?;
        let error = caps[2].parse().map_err(|_| invalid())?;
        Ok(Self { warning, error })
    }
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Logical pool name. Sessions and the datasource registry look pools
    /// up by this name.
    pub name: String,

    /// URL handed to the connector when opening native connections.
    pub url: String,

    /// Credentials for every connection in the pool.
    pub credentials: Credentials,

    /// Minimum number of connections kept open.
    pub min_size: usize,

    /// Maximum number of connections allowed.
    pub max_size: usize,

    /// Query used to validate idle connections. `None` skips validation.
    pub validation_query: Option<String>,

    /// Auto-commit mode applied to connections on checkout.
    pub auto_commit: bool,

    /// Time a free connection may stay unused before the sweeper may
    /// close it (only while the pool is above its minimum size).
    pub idle_timeout: Duration,

    /// Time `acquire` waits for a connection when the pool is exhausted.
    pub wait_timeout: Duration,

    /// Interval between sweeper cycles.
    pub sweep_interval: Duration,

    /// Initial load alert thresholds.
    pub alert_thresholds: AlertThresholds,

    /// Whether to capture a backtrace of the acquiring call site as the
    /// owner diagnostic trace.
    pub track_owner_trace: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            url: String::new(),
            credentials: Credentials::default(),
            min_size: 0,
            max_size: 10,
            validation_query: None,
            auto_commit: false,
            idle_timeout: Duration::from_secs(300),
            wait_timeout: Duration::from_millis(5000),
            sweep_interval: Duration::from_secs(180),
            alert_thresholds: AlertThresholds::default(),
            track_owner_trace: false,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `Key=Value;` configuration string.
    ///
    /// ```text
    /// Name=orders;Url=db://localhost/orders;User=app;Password=secret;MinSize=1;MaxSize=5;
    /// ValidationQuery=SELECT 1;WaitTimeout=2000;Alarm=Warning=70%,Error=90%
    /// ```
    ///
    /// Timeouts and intervals are given in milliseconds.
    pub fn from_connection_string(conn_str: &str) -> Result<Self, PoolError> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Configuration(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "name" | "pool url" | "poolurl" | "datasource" => {
                    config.name = value.to_string();
                }
                "url" => {
                    config.url = value.to_string();
                }
                "user" | "user id" | "uid" => {
                    config.credentials.user = value.to_string();
                }
                "password" | "pwd" => {
                    config.credentials.password = value.to_string();
                }
                "minsize" | "min size" => {
                    config.min_size = parse_number(&key, value)?;
                }
                "maxsize" | "max size" => {
                    config.max_size = parse_number(&key, value)?;
                }
                "validationquery" | "testsql" => {
                    config.validation_query = (!value.is_empty()).then(|| value.to_string());
                }
                "autocommit" => {
                    config.auto_commit = parse_bool(value);
                }
                "idletimeout" => {
                    config.idle_timeout = Duration::from_millis(parse_number(&key, value)?);
                }
                "waittimeout" | "dbconnectionwaittime" => {
                    config.wait_timeout = Duration::from_millis(parse_number(&key, value)?);
                }
                "sweepinterval" => {
                    config.sweep_interval = Duration::from_millis(parse_number(&key, value)?);
                }
                "alarm" | "datasourcealarm" => {
                    config.alert_thresholds = value.parse()?;
                }
                "trackowner" | "enabledbconnectiontracker" => {
                    config.track_owner_trace = parse_bool(value);
                }
                _ => {
                    // Ignore unknown options for forward compatibility
                    tracing::debug!(key = key, "ignoring unknown pool configuration option");
                }
            }
        }

        Ok(config)
    }

    /// Set the logical pool name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the native connection URL.
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_size(mut self, count: usize) -> Self {
        self.min_size = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_size(mut self, count: usize) -> Self {
        self.max_size = count;
        self
    }

    /// Set the validation query.
    #[must_use]
    pub fn validation_query(mut self, sql: impl Into<String>) -> Self {
        self.validation_query = Some(sql.into());
        self
    }

    /// Set the auto-commit mode applied on checkout.
    #[must_use]
    pub fn auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the acquisition wait timeout.
    #[must_use]
    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set the sweeper interval.
    #[must_use]
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the initial load alert thresholds.
    #[must_use]
    pub fn alert_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.alert_thresholds = thresholds;
        self
    }

    /// Enable or disable capturing the acquiring call site.
    #[must_use]
    pub fn track_owner_trace(mut self, enabled: bool) -> Self {
        self.track_owner_trace = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.name.trim().is_empty() {
            return Err(PoolError::Configuration("pool name cannot be empty".into()));
        }
        if self.max_size == 0 {
            return Err(PoolError::Configuration(
                "max_size must be greater than 0".into(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::Configuration(
                "min_size cannot be greater than max_size".into(),
            ));
        }
        if self.alert_thresholds.warning > self.alert_thresholds.error {
            return Err(PoolError::Configuration(
                "warning alert level cannot be greater than error alert level".into(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::Configuration(format!("invalid {key}: {value}")))
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1"
}
