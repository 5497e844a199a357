//! Metrics collection and export for connection pools

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Point-in-time view of the pool's population.
///
/// `active + idle + reserved == total` whenever no entry is mid-transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolState {
    /// Resources currently tracked by the pool
    pub total: usize,

    /// Resources lent out to callers
    pub active: usize,

    /// Resources available for borrowing
    pub idle: usize,

    /// Idle resources claimed by housekeeping
    pub reserved: usize,

    /// Callers blocked waiting for a resource
    pub waiting: usize,

    /// Background creations queued or running
    pub pending_creations: usize,
}

/// Metrics data for a pool
///
/// # Examples
///
/// ```no_run
/// use esox_connectionpool::{ManageResource, Pool, PoolConfiguration};
/// # use std::time::Duration;
/// # struct Db;
/// # impl ManageResource for Db {
/// #     type Resource = ();
/// #     type Error = std::io::Error;
/// #     fn create(&self) -> Result<(), std::io::Error> { Ok(()) }
/// #     fn is_alive(&self, _: &mut (), _: Duration) -> Result<(), std::io::Error> { Ok(()) }
/// # }
///
/// let pool = Pool::new(Db, PoolConfiguration::new().with_max_size(2)).unwrap();
/// {
///     let _conn = pool.acquire().unwrap();
///     let metrics = pool.get_metrics();
///     assert_eq!(metrics.total_acquired, 1);
///     assert_eq!(metrics.active, 1);
/// }
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PoolMetrics {
    /// Successful acquisitions
    pub total_acquired: usize,

    /// Releases back to the pool, including broken ones
    pub total_released: usize,

    /// Resources created
    pub total_created: usize,

    /// Resources destroyed
    pub total_destroyed: usize,

    /// Acquisitions that timed out
    pub acquire_timeouts: usize,

    /// Failed creation attempts
    pub creation_failures: usize,

    /// Resources that failed validation on acquire
    pub validation_failures: usize,

    /// Leak reports issued
    pub leaks_detected: usize,

    /// Current active resources
    pub active: usize,

    /// Current idle resources
    pub idle: usize,

    /// Current total resources
    pub total: usize,

    /// Current waiting callers
    pub waiting: usize,

    /// Pool utilization ratio (0.0 to 1.0)
    pub utilization: f64,

    /// Maximum pool size
    pub max_size: usize,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("total_acquired".to_string(), self.total_acquired.to_string());
        metrics.insert("total_released".to_string(), self.total_released.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_destroyed".to_string(), self.total_destroyed.to_string());
        metrics.insert("acquire_timeouts".to_string(), self.acquire_timeouts.to_string());
        metrics.insert("creation_failures".to_string(), self.creation_failures.to_string());
        metrics.insert("validation_failures".to_string(), self.validation_failures.to_string());
        metrics.insert("leaks_detected".to_string(), self.leaks_detected.to_string());
        metrics.insert("active".to_string(), self.active.to_string());
        metrics.insert("idle".to_string(), self.idle.to_string());
        metrics.insert("total".to_string(), self.total.to_string());
        metrics.insert("waiting".to_string(), self.waiting.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert("max_size".to_string(), self.max_size.to_string());
        metrics
    }
}

/// Metrics exporter for Prometheus format
pub struct MetricsExporter;

impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        let mut output = String::new();
        let labels = Self::format_labels(pool_name, tags);

        let gauges = [
            ("connpool_resources_active", "Resources lent out", metrics.active as f64),
            ("connpool_resources_idle", "Idle resources", metrics.idle as f64),
            ("connpool_resources_total", "Resources tracked by the pool", metrics.total as f64),
            ("connpool_waiters", "Callers waiting for a resource", metrics.waiting as f64),
            ("connpool_utilization", "Pool utilization ratio", metrics.utilization),
        ];
        for (name, help, value) in gauges {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
        }

        let counters = [
            ("connpool_acquired_total", "Successful acquisitions", metrics.total_acquired),
            ("connpool_released_total", "Releases", metrics.total_released),
            ("connpool_created_total", "Resources created", metrics.total_created),
            ("connpool_destroyed_total", "Resources destroyed", metrics.total_destroyed),
            ("connpool_acquire_timeouts_total", "Acquisition timeouts", metrics.acquire_timeouts),
            ("connpool_creation_failures_total", "Failed creations", metrics.creation_failures),
            ("connpool_validation_failures_total", "Failed validations", metrics.validation_failures),
            ("connpool_leaks_total", "Leak reports", metrics.leaks_detected),
        ];
        for (name, help, value) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{}{{{}}} {}\n", name, labels, value));
        }

        output
    }

    fn format_labels(pool_name: &str, tags: Option<&HashMap<String, String>>) -> String {
        let mut labels = vec![format!("pool=\"{}\"", pool_name)];

        if let Some(tags) = tags {
            let mut sorted: Vec<_> = tags.iter().collect();
            sorted.sort();
            for (key, value) in sorted {
                labels.push(format!("{}=\"{}\"", key, value));
            }
        }

        labels.join(",")
    }
}

/// Observer for pool events, for wiring into an external metrics system.
///
/// Every method has a no-op default, implement only what you need.
pub trait MetricsRecorder: Send + Sync {
    /// A caller obtained a resource after waiting `wait`.
    fn record_acquire(&self, _wait: Duration) {}

    /// A caller gave up after `wait`.
    fn record_acquire_timeout(&self, _wait: Duration) {}

    /// A resource was returned after being held for `held`.
    fn record_usage(&self, _held: Duration) {}

    /// A resource was created in `elapsed`.
    fn record_creation(&self, _elapsed: Duration) {}

    fn record_creation_failure(&self) {}

    fn record_destroyed(&self) {}

    fn record_leak(&self) {}

    /// Called after every housekeeping run.
    fn record_state(&self, _state: &PoolState) {}
}

/// Recorder that ignores everything.
pub(crate) struct NopRecorder;

impl MetricsRecorder for NopRecorder {}

/// Internal metrics tracker
#[derive(Default)]
pub(crate) struct MetricsTracker {
    pub total_acquired: AtomicUsize,
    pub total_released: AtomicUsize,
    pub total_created: AtomicUsize,
    pub total_destroyed: AtomicUsize,
    pub acquire_timeouts: AtomicUsize,
    pub creation_failures: AtomicUsize,
    pub validation_failures: AtomicUsize,
    pub leaks_detected: AtomicUsize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_metrics(&self, state: &PoolState, max_size: usize) -> PoolMetrics {
        let utilization = if max_size > 0 {
            state.active as f64 / max_size as f64
        } else {
            0.0
        };

        PoolMetrics {
            total_acquired: self.total_acquired.load(Ordering::Relaxed),
            total_released: self.total_released.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_destroyed: self.total_destroyed.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            leaks_detected: self.leaks_detected.load(Ordering::Relaxed),
            active: state.active,
            idle: state.idle,
            total: state.total,
            waiting: state.waiting,
            utilization,
            max_size,
        }
    }
}

#[cfg(feature = "metrics")]
pub use self::prometheus_recorder::PrometheusRecorder;

#[cfg(feature = "metrics")]
mod prometheus_recorder {
    use super::{MetricsRecorder, PoolState};

    use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
    use std::time::Duration;

    /// [`MetricsRecorder`] backed by a `prometheus` registry.
    pub struct PrometheusRecorder {
        acquire_wait: Histogram,
        usage: Histogram,
        creation: Histogram,
        timeouts: IntCounter,
        creation_failures: IntCounter,
        destroyed: IntCounter,
        leaks: IntCounter,
        total: IntGauge,
        active: IntGauge,
        idle: IntGauge,
        waiting: IntGauge,
    }

    impl PrometheusRecorder {
        /// Create the collectors, labelled with `pool_name`, and register them.
        pub fn new(pool_name: &str, registry: &Registry) -> prometheus::Result<Self> {
            let histogram = |name: &str, help: &str| {
                Histogram::with_opts(
                    HistogramOpts::new(name, help).const_label("pool", pool_name),
                )
            };
            let counter =
                |name: &str, help: &str| IntCounter::with_opts(Opts::new(name, help).const_label("pool", pool_name));
            let gauge =
                |name: &str, help: &str| IntGauge::with_opts(Opts::new(name, help).const_label("pool", pool_name));

            let recorder = Self {
                acquire_wait: histogram("connpool_acquire_seconds", "Time spent waiting for a resource")?,
                usage: histogram("connpool_usage_seconds", "Time resources were held")?,
                creation: histogram("connpool_creation_seconds", "Time spent creating resources")?,
                timeouts: counter("connpool_acquire_timeouts_total", "Acquisition timeouts")?,
                creation_failures: counter("connpool_creation_failures_total", "Failed creations")?,
                destroyed: counter("connpool_destroyed_total", "Resources destroyed")?,
                leaks: counter("connpool_leaks_total", "Leak reports")?,
                total: gauge("connpool_resources_total", "Resources tracked by the pool")?,
                active: gauge("connpool_resources_active", "Resources lent out")?,
                idle: gauge("connpool_resources_idle", "Idle resources")?,
                waiting: gauge("connpool_waiters", "Callers waiting for a resource")?,
            };

            registry.register(Box::new(recorder.acquire_wait.clone()))?;
            registry.register(Box::new(recorder.usage.clone()))?;
            registry.register(Box::new(recorder.creation.clone()))?;
            registry.register(Box::new(recorder.timeouts.clone()))?;
            registry.register(Box::new(recorder.creation_failures.clone()))?;
            registry.register(Box::new(recorder.destroyed.clone()))?;
            registry.register(Box::new(recorder.leaks.clone()))?;
            registry.register(Box::new(recorder.total.clone()))?;
            registry.register(Box::new(recorder.active.clone()))?;
            registry.register(Box::new(recorder.idle.clone()))?;
            registry.register(Box::new(recorder.waiting.clone()))?;

            Ok(recorder)
        }
    }

    impl MetricsRecorder for PrometheusRecorder {
        fn record_acquire(&self, wait: Duration) {
            self.acquire_wait.observe(wait.as_secs_f64());
        }

        fn record_acquire_timeout(&self, _wait: Duration) {
            self.timeouts.inc();
        }

        fn record_usage(&self, held: Duration) {
            self.usage.observe(held.as_secs_f64());
        }

        fn record_creation(&self, elapsed: Duration) {
            self.creation.observe(elapsed.as_secs_f64());
        }

        fn record_creation_failure(&self) {
            self.creation_failures.inc();
        }

        fn record_destroyed(&self) {
            self.destroyed.inc();
        }

        fn record_leak(&self) {
            self.leaks.inc();
        }

        fn record_state(&self, state: &PoolState) {
            self.total.set(state.total as i64);
            self.active.set(state.active as i64);
            self.idle.set(state.idle as i64);
            self.waiting.set(state.waiting as i64);
        }
    }

}
