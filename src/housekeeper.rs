//! Background scheduling: periodic housekeeping, leak timers and creation workers
//!
//! Each pool owns a small tokio runtime with a single worker thread for timers
//! and a bounded blocking pool for anything that talks to the resource factory.

use crate::errors::{PoolError, PoolResult};

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

const INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Periodic maintenance driven by the scheduler.
pub(crate) trait Maintain: Send + Sync + 'static {
    fn run_housekeeping(&self);
}

pub(crate) struct Scheduler {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    cancelled: AtomicBool,
}

impl Scheduler {
    /// Start the runtime; `blocking_threads` bounds concurrent factory calls.
    pub fn new(pool_name: &str, blocking_threads: usize) -> PoolResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(blocking_threads.max(1))
            .thread_name(format!("{pool_name}-housekeeper"))
            .enable_time()
            .build()
            .map_err(|err| PoolError::Scheduler(Arc::new(err)))?;

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a task unless the scheduler has been shut down.
    pub fn spawn<F>(&self, task: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_cancelled() {
            return None;
        }
        Some(self.handle.spawn(task).abort_handle())
    }

    /// Run `pool.run_housekeeping()` every `period` until the pool is gone.
    pub fn start_housekeeping<P: Maintain>(&self, pool: Weak<P>, period: Duration) {
        let first_tick = tokio::time::Instant::now() + INITIAL_DELAY.min(period);
        self.spawn(async move {
            let mut ticker = tokio::time::interval_at(first_tick, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                if tokio::task::spawn_blocking(move || pool.run_housekeeping())
                    .await
                    .is_err()
                {
                    break;
                }
            }
            debug!("Housekeeping stopped");
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancel every scheduled task. Safe to call more than once.
    pub fn shutdown(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    struct Ticks(AtomicUsize);

    impl Maintain for Ticks {
        fn run_housekeeping(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_housekeeping_runs_periodically() {
        let scheduler = Scheduler::new("test", 1).unwrap();
        let ticks = Arc::new(Ticks(AtomicUsize::new(0)));
        scheduler.start_housekeeping(Arc::downgrade(&ticks), Duration::from_millis(20));

        thread::sleep(Duration::from_millis(250));
        assert!(ticks.0.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_stops_tasks() {
        let scheduler = Scheduler::new("test", 1).unwrap();
        let ticks = Arc::new(Ticks(AtomicUsize::new(0)));
        scheduler.start_housekeeping(Arc::downgrade(&ticks), Duration::from_millis(10));

        scheduler.shutdown();
        scheduler.shutdown();
        let seen = ticks.0.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));

        assert!(ticks.0.load(Ordering::SeqCst) <= seen + 1);
        assert!(scheduler.is_cancelled());
        assert!(scheduler.spawn(async {}).is_none());
    }

    #[tokio::test]
    async fn test_drop_inside_async_context() {
        let scheduler = Scheduler::new("nested", 1).unwrap();
        assert!(scheduler.spawn(async {}).is_some());
        drop(scheduler);
    }
}
