//! Leak detection for borrowed resources

use crate::metrics::{MetricsRecorder, MetricsTracker};

use std::backtrace::Backtrace;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{info, warn};

/// Where a resource was borrowed.
struct BorrowSite {
    thread: String,
    backtrace: Backtrace,
}

impl BorrowSite {
    fn capture() -> Self {
        let current = std::thread::current();
        Self {
            thread: current.name().unwrap_or("<unnamed>").to_string(),
            backtrace: Backtrace::capture(),
        }
    }
}

/// Schedules one-shot leak timers on the pool's scheduler.
pub(crate) struct LeakDetector {
    handle: Handle,
    pool_name: Arc<str>,
    metrics: Arc<MetricsTracker>,
    recorder: Arc<dyn MetricsRecorder>,
}

impl LeakDetector {
    pub fn new(
        handle: Handle,
        pool_name: Arc<str>,
        metrics: Arc<MetricsTracker>,
        recorder: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            handle,
            pool_name,
            metrics,
            recorder,
        }
    }

    /// Arm a timer that reports `resource_id` unless cancelled within `threshold`.
    pub fn schedule(&self, resource_id: u64, threshold: Duration) -> LeakTask {
        let site = BorrowSite::capture();
        let reported = Arc::new(AtomicBool::new(false));

        let timer = {
            let reported = Arc::clone(&reported);
            let pool_name = Arc::clone(&self.pool_name);
            let metrics = Arc::clone(&self.metrics);
            let recorder = Arc::clone(&self.recorder);
            async move {
                tokio::time::sleep(threshold).await;
                reported.store(true, Ordering::Release);
                MetricsTracker::increment(&metrics.leaks_detected);
                recorder.record_leak();
                warn!(
                    pool = %pool_name,
                    resource = resource_id,
                    thread = %site.thread,
                    threshold = ?threshold,
                    "Leak detection triggered, resource was borrowed at:\n{}",
                    site.backtrace
                );
            }
        };

        LeakTask {
            resource_id,
            pool_name: Arc::clone(&self.pool_name),
            abort: self.handle.spawn(timer).abort_handle(),
            reported,
        }
    }
}

/// Pending leak timer for one borrow. Dropping it disarms the timer.
pub(crate) struct LeakTask {
    resource_id: u64,
    pool_name: Arc<str>,
    abort: AbortHandle,
    reported: Arc<AtomicBool>,
}

impl LeakTask {
    /// Disarm the timer on release.
    pub fn cancel(self) {
        self.abort.abort();
        if self.reported.load(Ordering::Acquire) {
            info!(
                pool = %self.pool_name,
                resource = self.resource_id,
                "Previously reported leaked resource was returned"
            );
        }
    }
}

impl Drop for LeakTask {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NopRecorder;
    use std::sync::atomic::AtomicUsize;

    struct LeakCounter(AtomicUsize);

    impl MetricsRecorder for LeakCounter {
        fn record_leak(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn detector(recorder: Arc<dyn MetricsRecorder>) -> (LeakDetector, Arc<MetricsTracker>) {
        let metrics = Arc::new(MetricsTracker::new());
        let detector = LeakDetector::new(
            Handle::current(),
            Arc::from("leaky"),
            Arc::clone(&metrics),
            recorder,
        );
        (detector, metrics)
    }

    #[tokio::test]
    async fn test_fires_after_threshold() {
        let recorder = Arc::new(LeakCounter(AtomicUsize::new(0)));
        let (detector, metrics) = detector(recorder.clone());

        let task = detector.schedule(1, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(metrics.leaks_detected.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.0.load(Ordering::SeqCst), 1);
        task.cancel();
    }

    #[tokio::test]
    async fn test_cancel_before_threshold() {
        let (detector, metrics) = detector(Arc::new(NopRecorder));

        let task = detector.schedule(1, Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(5)).await;
        task.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(metrics.leaks_detected.load(Ordering::SeqCst), 0);
    }
}
