//! Pool configuration options

use crate::errors::{PoolError, PoolResult};

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

static POOL_NUMBER: AtomicUsize = AtomicUsize::new(1);

/// Configuration for connection pool behavior
///
/// # Examples
///
/// ```
/// use esox_connectionpool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_max_size(20)
///     .with_min_idle(5)
///     .with_acquire_timeout(Duration::from_secs(5))
///     .with_max_lifetime(Duration::from_secs(1800));
///
/// assert_eq!(config.max_size, 20);
/// assert_eq!(config.min_idle, 5);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    /// Name used in log events and metrics labels
    pub pool_name: String,

    /// Maximum number of resources, idle and in use together
    pub max_size: usize,

    /// Number of idle resources the pool tries to keep around
    pub min_idle: usize,

    /// How long `acquire` waits before giving up
    pub acquire_timeout: Duration,

    /// Idle resources unused for longer than this are retired
    pub idle_timeout: Option<Duration>,

    /// Resources older than this are retired regardless of use
    pub max_lifetime: Option<Duration>,

    /// Borrows held longer than this are reported as leaks
    pub leak_threshold: Option<Duration>,

    /// Upper bound for a single validation check
    pub validation_timeout: Duration,

    /// Interval between housekeeping runs
    pub housekeeping_period: Duration,

    /// Resources used more recently than this are handed out without validation
    pub alive_bypass_window: Duration,

    /// Statement run to validate a resource instead of the native aliveness check
    pub test_query: Option<String>,

    /// Statement run once on every freshly created resource
    pub init_query: Option<String>,

    /// If set, construction fails when no resource can be created within this time
    pub initialization_fail_timeout: Option<Duration>,

    /// Whether `suspend`/`resume` may be used
    pub allow_suspension: bool,

    /// How long shutdown keeps evicting and aborting before it gives up
    pub shutdown_grace: Duration,

    /// Maximum number of resources being created concurrently
    pub creation_workers: usize,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            pool_name: format!("pool-{}", POOL_NUMBER.fetch_add(1, Ordering::Relaxed)),
            max_size: 10,
            min_idle: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            leak_threshold: None,
            validation_timeout: Duration::from_secs(5),
            housekeeping_period: Duration::from_secs(30),
            alive_bypass_window: Duration::from_millis(500),
            test_query: None,
            init_query: None,
            initialization_fail_timeout: Some(Duration::from_millis(1)),
            allow_suspension: false,
            shutdown_grace: Duration::from_secs(10),
            creation_workers: 2,
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = name.into();
        self
    }

    /// Set the maximum pool size
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_max_size(50);
    ///
    /// assert_eq!(config.max_size, 50);
    /// ```
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set the minimum number of idle resources
    pub fn with_min_idle(mut self, count: usize) -> Self {
        self.min_idle = count;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set idle timeout, `None` disables idle retirement
    pub fn with_idle_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.idle_timeout = timeout.into();
        self
    }

    /// Set maximum lifetime, `None` keeps resources forever
    pub fn with_max_lifetime(mut self, lifetime: impl Into<Option<Duration>>) -> Self {
        self.max_lifetime = lifetime.into();
        self
    }

    /// Enable leak detection
    pub fn with_leak_threshold(mut self, threshold: Duration) -> Self {
        self.leak_threshold = Some(threshold);
        self
    }

    /// Set validation timeout
    pub fn with_validation_timeout(mut self, timeout: Duration) -> Self {
        self.validation_timeout = timeout;
        self
    }

    /// Set housekeeping interval
    pub fn with_housekeeping_period(mut self, period: Duration) -> Self {
        self.housekeeping_period = period;
        self
    }

    /// Set the window during which recently used resources skip validation
    pub fn with_alive_bypass_window(mut self, window: Duration) -> Self {
        self.alive_bypass_window = window;
        self
    }

    /// Validate resources with a test statement
    pub fn with_test_query(mut self, query: impl Into<String>) -> Self {
        self.test_query = Some(query.into());
        self
    }

    /// Run a statement on every new resource
    pub fn with_init_query(mut self, query: impl Into<String>) -> Self {
        self.init_query = Some(query.into());
        self
    }

    /// Set fail-fast initialization timeout, `None` fills asynchronously only
    pub fn with_initialization_fail_timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.initialization_fail_timeout = timeout.into();
        self
    }

    /// Allow the pool to be suspended
    pub fn with_suspension(mut self) -> Self {
        self.allow_suspension = true;
        self
    }

    /// Set shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set how many resources may be created concurrently
    pub fn with_creation_workers(mut self, workers: usize) -> Self {
        self.creation_workers = workers;
        self
    }

    /// Check bounds and reconcile conflicting settings.
    ///
    /// Hard errors are returned for values the pool cannot work with. Settings
    /// that merely contradict each other are adjusted and logged.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connectionpool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new()
    ///     .with_max_size(4)
    ///     .with_min_idle(8)
    ///     .validate()
    ///     .unwrap();
    ///
    /// assert_eq!(config.min_idle, 4);
    /// assert!(PoolConfiguration::new().with_max_size(0).validate().is_err());
    /// ```
    pub fn validate(mut self) -> PoolResult<Self> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfiguration("max_size must be at least 1".into()));
        }
        if self.housekeeping_period.is_zero() {
            return Err(PoolError::InvalidConfiguration(
                "housekeeping_period must be greater than zero".into(),
            ));
        }
        if self.creation_workers == 0 {
            return Err(PoolError::InvalidConfiguration(
                "creation_workers must be at least 1".into(),
            ));
        }
        if self.acquire_timeout.is_zero() {
            return Err(PoolError::InvalidConfiguration(
                "acquire_timeout must be greater than zero".into(),
            ));
        }

        if self.min_idle > self.max_size {
            warn!(pool = %self.pool_name, min_idle = self.min_idle, max_size = self.max_size,
                "min_idle exceeds max_size, clamping");
            self.min_idle = self.max_size;
        }

        if self.validation_timeout > self.acquire_timeout {
            warn!(pool = %self.pool_name, "validation_timeout exceeds acquire_timeout, clamping");
            self.validation_timeout = self.acquire_timeout;
        }

        if let (Some(idle), Some(lifetime)) = (self.idle_timeout, self.max_lifetime)
            && idle >= lifetime
            && self.min_idle < self.max_size
        {
            warn!(pool = %self.pool_name, "idle_timeout is not below max_lifetime, disabling it");
            self.idle_timeout = None;
        }

        if let (Some(threshold), Some(lifetime)) = (self.leak_threshold, self.max_lifetime)
            && threshold >= lifetime
        {
            warn!(pool = %self.pool_name, "leak_threshold is not below max_lifetime, disabling it");
            self.leak_threshold = None;
        }

        Ok(self)
    }
}

/// Settings that may change while the pool is running.
///
/// Stored as nanoseconds, zero means disabled for the optional values.
pub(crate) struct LiveSettings {
    acquire_timeout: AtomicU64,
    idle_timeout: AtomicU64,
    leak_threshold: AtomicU64,
}

impl LiveSettings {
    pub fn new(config: &PoolConfiguration) -> Self {
        Self {
            acquire_timeout: AtomicU64::new(to_nanos(Some(config.acquire_timeout))),
            idle_timeout: AtomicU64::new(to_nanos(config.idle_timeout)),
            leak_threshold: AtomicU64::new(to_nanos(config.leak_threshold)),
        }
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_nanos(self.acquire_timeout.load(Ordering::Relaxed))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        from_nanos(self.idle_timeout.load(Ordering::Relaxed))
    }

    pub fn leak_threshold(&self) -> Option<Duration> {
        from_nanos(self.leak_threshold.load(Ordering::Relaxed))
    }

    pub fn set_acquire_timeout(&self, timeout: Duration) {
        self.acquire_timeout.store(to_nanos(Some(timeout)).max(1), Ordering::Relaxed);
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.idle_timeout.store(to_nanos(timeout), Ordering::Relaxed);
    }

    pub fn set_leak_threshold(&self, threshold: Option<Duration>) {
        self.leak_threshold.store(to_nanos(threshold), Ordering::Relaxed);
    }
}

fn to_nanos(duration: Option<Duration>) -> u64 {
    duration.map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

fn from_nanos(nanos: u64) -> Option<Duration> {
    (nanos > 0).then(|| Duration::from_nanos(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_names_are_unique() {
        let a = PoolConfiguration::default();
        let b = PoolConfiguration::default();
        assert_ne!(a.pool_name, b.pool_name);
        assert!(a.pool_name.starts_with("pool-"));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        assert!(PoolConfiguration::new().with_max_size(0).validate().is_err());
        assert!(PoolConfiguration::new().with_creation_workers(0).validate().is_err());
        assert!(
            PoolConfiguration::new()
                .with_housekeeping_period(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_validate_clamps_conflicts() {
        let config = PoolConfiguration::new()
            .with_max_size(5)
            .with_min_idle(1)
            .with_acquire_timeout(Duration::from_secs(1))
            .with_validation_timeout(Duration::from_secs(3))
            .with_idle_timeout(Duration::from_secs(60))
            .with_max_lifetime(Duration::from_secs(30))
            .with_leak_threshold(Duration::from_secs(45))
            .validate()
            .unwrap();

        assert_eq!(config.validation_timeout, Duration::from_secs(1));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.leak_threshold, None);
    }

    #[test]
    fn test_idle_timeout_kept_for_fixed_size_pool() {
        let config = PoolConfiguration::new()
            .with_max_size(2)
            .with_min_idle(2)
            .with_idle_timeout(Duration::from_secs(60))
            .with_max_lifetime(Duration::from_secs(30))
            .validate()
            .unwrap();

        assert_eq!(config.idle_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_live_settings_roundtrip() {
        let config = PoolConfiguration::new().with_idle_timeout(None);
        let live = LiveSettings::new(&config);

        assert_eq!(live.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(live.idle_timeout(), None);

        live.set_idle_timeout(Some(Duration::from_millis(250)));
        live.set_leak_threshold(Some(Duration::from_millis(50)));
        live.set_acquire_timeout(Duration::from_millis(100));

        assert_eq!(live.idle_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(live.leak_threshold(), Some(Duration::from_millis(50)));
        assert_eq!(live.acquire_timeout(), Duration::from_millis(100));
    }
}
