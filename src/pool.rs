//! Pool orchestration: admission, resource lifecycle, eviction and shutdown

use crate::bag::{BagItem, BagStateListener, ConcurrentBag};
use crate::config::{LiveSettings, PoolConfiguration};
use crate::entry::{EntryState, PoolEntry};
use crate::errors::{BoxError, PoolError, PoolResult};
use crate::health::HealthStatus;
use crate::housekeeper::{Maintain, Scheduler};
use crate::leak::LeakDetector;
use crate::manager::ManageResource;
use crate::metrics::{
    MetricsExporter, MetricsRecorder, MetricsTracker, NopRecorder, PoolMetrics, PoolState,
};
use crate::resource::PooledResource;
use crate::suspend::SuspendResumeLock;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

pub(crate) type Entry<M> = PoolEntry<<M as ManageResource>::Resource>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Lifecycle {
    Normal = 0,
    Suspended = 1,
    ShutDown = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Normal,
            1 => Lifecycle::Suspended,
            _ => Lifecycle::ShutDown,
        }
    }
}

pub(crate) enum CreateOutcome {
    Created,
    AtCapacity,
    Failed(PoolError),
}

/// A pool of reusable resources shared by many threads.
///
/// Cloning a `Pool` is cheap and yields another handle to the same pool.
///
/// # Examples
///
/// ```no_run
/// use esox_connectionpool::{ManageResource, Pool, PoolConfiguration};
/// use std::time::Duration;
///
/// struct Db;
///
/// impl ManageResource for Db {
///     type Resource = Vec<u8>;
///     type Error = std::io::Error;
///
///     fn create(&self) -> Result<Vec<u8>, std::io::Error> {
///         Ok(Vec::new())
///     }
///
///     fn is_alive(&self, _conn: &mut Vec<u8>, _timeout: Duration) -> Result<(), std::io::Error> {
///         Ok(())
///     }
/// }
///
/// let pool = Pool::new(Db, PoolConfiguration::new().with_max_size(4)).unwrap();
/// {
///     let mut conn = pool.acquire().unwrap();
///     conn.push(1);
///     // returned to the pool when `conn` goes out of scope
/// }
/// pool.shutdown();
/// ```
pub struct Pool<M: ManageResource> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ManageResource> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ManageResource> Pool<M> {
    /// Create a new pool
    pub fn new(manager: M, config: PoolConfiguration) -> PoolResult<Self> {
        Self::with_recorder(manager, config, Arc::new(NopRecorder))
    }

    /// Create a new pool that reports events to `recorder`
    pub fn with_recorder(
        manager: M,
        config: PoolConfiguration,
        recorder: Arc<dyn MetricsRecorder>,
    ) -> PoolResult<Self> {
        let config = config.validate()?;
        let name: Arc<str> = Arc::from(config.pool_name.as_str());
        let scheduler = Scheduler::new(&name, config.creation_workers + 1)?;
        let metrics = Arc::new(MetricsTracker::new());
        let leak_detector = LeakDetector::new(
            scheduler.handle().clone(),
            Arc::clone(&name),
            Arc::clone(&metrics),
            Arc::clone(&recorder),
        );

        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner<M>>| PoolInner {
            name: Arc::clone(&name),
            live: LiveSettings::new(&config),
            suspend_lock: SuspendResumeLock::new(config.allow_suspension),
            bag: ConcurrentBag::new(weak.clone() as Weak<dyn BagStateListener>),
            config,
            manager,
            total: AtomicUsize::new(0),
            pending_creations: Arc::new(AtomicUsize::new(0)),
            lifecycle: AtomicU8::new(Lifecycle::Normal as u8),
            last_failure: Mutex::new(None),
            scheduler,
            leak_detector,
            metrics,
            recorder,
            self_ref: weak.clone(),
        });

        info!(
            pool = %name,
            max_size = inner.config.max_size,
            min_idle = inner.config.min_idle,
            "Starting pool"
        );

        if let Some(timeout) = inner.config.initialization_fail_timeout
            && let Err(err) = inner.check_fail_fast(timeout)
        {
            error!(pool = %name, error = %err, "Pool initialization failed");
            inner.shutdown();
            return Err(err);
        }

        let weak: Weak<PoolInner<M>> = Arc::downgrade(&inner);
        inner
            .scheduler
            .start_housekeeping(weak, inner.config.housekeeping_period);
        inner.fill_pool();

        info!(pool = %name, "Start completed");
        Ok(Self { inner })
    }

    /// Get a resource, waiting up to the configured acquire timeout
    pub fn acquire(&self) -> PoolResult<PooledResource<M>> {
        self.inner.acquire(self.inner.live.acquire_timeout())
    }

    /// Get a resource, waiting up to `timeout`
    pub fn acquire_timeout(&self, timeout: Duration) -> PoolResult<PooledResource<M>> {
        self.inner.acquire(timeout)
    }

    /// Get a resource without blocking the async executor
    pub async fn acquire_async(&self) -> PoolResult<PooledResource<M>> {
        let inner = Arc::clone(&self.inner);
        let timeout = inner.live.acquire_timeout();

        tokio::task::spawn_blocking(move || inner.acquire(timeout))
            .await
            .map_err(|_| PoolError::Cancelled)?
    }

    /// Name of this pool
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current population of the pool
    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Resources created and not yet destroyed
    pub fn total_count(&self) -> usize {
        self.inner.total.load(Ordering::SeqCst)
    }

    /// Get idle count
    pub fn idle_count(&self) -> usize {
        self.inner.bag.counts().not_in_use
    }

    /// Get active count
    pub fn active_count(&self) -> usize {
        self.inner.bag.counts().in_use
    }

    /// Callers currently waiting for a resource
    pub fn waiting_count(&self) -> usize {
        self.inner.bag.waiting()
    }

    /// Get pool metrics
    pub fn get_metrics(&self) -> PoolMetrics {
        self.inner
            .metrics
            .get_metrics(&self.inner.state(), self.inner.config.max_size)
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.get_metrics().export()
    }

    /// Export metrics in Prometheus format
    pub fn export_metrics_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> String {
        MetricsExporter::export_prometheus(&self.get_metrics(), pool_name, tags)
    }

    /// Get health status
    pub fn get_health_status(&self) -> HealthStatus {
        let last_failure = self.inner.last_failure.lock().as_ref().map(|err| err.to_string());
        HealthStatus::new(
            &self.inner.state(),
            self.inner.config.max_size,
            self.inner.config.min_idle,
            last_failure,
        )
    }

    /// Retire every resource: idle ones now, borrowed ones when they come back
    pub fn soft_evict_all(&self) {
        info!(pool = %self.inner.name, "Soft-evicting all resources");
        self.inner.soft_evict_all();
    }

    /// Run one eviction and refill pass now instead of waiting for the scheduler
    pub fn run_housekeeping(&self) {
        self.inner.run_housekeeping();
    }

    /// Stop handing out resources until [`resume`](Self::resume) is called.
    ///
    /// Blocks until callers already inside `acquire` have left.
    pub fn suspend(&self) -> PoolResult<()> {
        self.inner.suspend()
    }

    /// Resume a suspended pool
    pub fn resume(&self) -> PoolResult<()> {
        self.inner.resume()
    }

    /// Close every resource and stop background work.
    ///
    /// Borrowed resources that are not returned within the shutdown grace
    /// period are aborted. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Whether `shutdown` has been called
    pub fn is_shutdown(&self) -> bool {
        self.inner.lifecycle() == Lifecycle::ShutDown
    }

    /// Whether acquisition is currently suspended
    pub fn is_suspended(&self) -> bool {
        self.inner.lifecycle() == Lifecycle::Suspended
    }

    /// Change the acquire timeout of a running pool
    pub fn set_acquire_timeout(&self, timeout: Duration) {
        self.inner.live.set_acquire_timeout(timeout);
    }

    /// Change the idle timeout of a running pool
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        self.inner.live.set_idle_timeout(timeout);
    }

    /// Change the leak detection threshold of a running pool
    pub fn set_leak_threshold(&self, threshold: Option<Duration>) {
        self.inner.live.set_leak_threshold(threshold);
    }
}

pub(crate) struct PoolInner<M: ManageResource> {
    name: Arc<str>,
    config: PoolConfiguration,
    live: LiveSettings,
    manager: M,
    bag: ConcurrentBag<Entry<M>>,
    // created and not yet destroyed, bumped before the factory is called
    total: AtomicUsize,
    pending_creations: Arc<AtomicUsize>,
    lifecycle: AtomicU8,
    last_failure: Mutex<Option<BoxError>>,
    suspend_lock: SuspendResumeLock,
    scheduler: Scheduler,
    leak_detector: LeakDetector,
    metrics: Arc<MetricsTracker>,
    recorder: Arc<dyn MetricsRecorder>,
    self_ref: Weak<PoolInner<M>>,
}

impl<M: ManageResource> PoolInner<M> {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    fn state(&self) -> PoolState {
        let counts = self.bag.counts();
        PoolState {
            total: counts.not_in_use + counts.in_use + counts.reserved,
            active: counts.in_use,
            idle: counts.not_in_use,
            reserved: counts.reserved,
            waiting: self.bag.waiting(),
            pending_creations: self.pending_creations.load(Ordering::SeqCst),
        }
    }

    fn acquire(self: &Arc<Self>, timeout: Duration) -> PoolResult<PooledResource<M>> {
        let started = Instant::now();
        let deadline = started + timeout;

        if self.lifecycle() == Lifecycle::ShutDown {
            return Err(PoolError::ShutdownInProgress);
        }
        let Some(_permit) = self.suspend_lock.acquire(deadline) else {
            return Err(self.timeout_error(started));
        };

        loop {
            let Some(entry) = self.bag.borrow(deadline)? else {
                break;
            };

            let now = Instant::now();
            let Some(mut resource) = entry.take_resource() else {
                error!(pool = %self.name, resource = entry.id(), "Borrowed entry holds no resource");
                self.destroy(&entry, None, "entry holds no resource");
                continue;
            };

            let retire = if entry.is_marked_evicted() {
                Some("resource was evicted")
            } else if entry.is_expired(now) {
                Some("resource passed its max lifetime")
            } else {
                None
            };
            if let Some(reason) = retire {
                self.destroy(&entry, Some(resource), reason);
                if Instant::now() >= deadline {
                    break;
                }
                continue;
            }

            if entry.idle_for(now) > self.config.alive_bypass_window {
                let remaining = deadline.saturating_duration_since(now);
                if remaining.is_zero() {
                    entry.put_resource(resource);
                    self.bag.requite(&entry);
                    break;
                }

                if let Err(err) = self.validate(&mut resource, remaining) {
                    warn!(
                        pool = %self.name,
                        resource = entry.id(),
                        error = %err,
                        "Failed to validate resource, consider a shorter max lifetime"
                    );
                    MetricsTracker::increment(&self.metrics.validation_failures);
                    *self.last_failure.lock() = Some(Arc::new(err) as BoxError);
                    self.destroy(&entry, Some(resource), "resource failed validation");
                    if Instant::now() >= deadline {
                        break;
                    }
                    continue;
                }
            }

            // shutdown may have aborted the entry while it was being validated
            if entry.state().get() != EntryState::InUse {
                debug!(pool = %self.name, resource = entry.id(), "Closing resource aborted during validation");
                self.manager.close(resource);
                return Err(PoolError::ShutdownInProgress);
            }
            if self.lifecycle() == Lifecycle::ShutDown {
                self.destroy(&entry, Some(resource), "pool is shutting down");
                return Err(PoolError::ShutdownInProgress);
            }

            let now = Instant::now();
            entry.touch(now);
            let leak = self
                .live
                .leak_threshold()
                .map(|threshold| self.leak_detector.schedule(entry.id(), threshold));

            MetricsTracker::increment(&self.metrics.total_acquired);
            self.recorder.record_acquire(now.duration_since(started));
            return Ok(PooledResource::new(Arc::clone(self), entry, resource, leak));
        }

        Err(self.timeout_error(started))
    }

    fn validate(&self, resource: &mut M::Resource, remaining: Duration) -> PoolResult<()> {
        let timeout = self.config.validation_timeout.min(remaining);
        let started = Instant::now();

        let result = match &self.config.test_query {
            Some(query) => self.manager.execute(resource, query, timeout),
            None => self.manager.is_alive(resource, timeout),
        };

        match result {
            Err(err) => Err(PoolError::ValidationFailed(PoolError::boxed(err))),
            Ok(()) if started.elapsed() > timeout => Err(PoolError::ValidationTimeout(timeout)),
            Ok(()) => Ok(()),
        }
    }

    fn timeout_error(&self, started: Instant) -> PoolError {
        let waited = started.elapsed();
        let state = self.state();
        MetricsTracker::increment(&self.metrics.acquire_timeouts);
        self.recorder.record_acquire_timeout(waited);

        debug!(
            pool = %self.name,
            waited = ?waited,
            total = state.total,
            active = state.active,
            idle = state.idle,
            waiting = state.waiting,
            "Timed out waiting for a resource"
        );

        PoolError::AcquisitionTimeout {
            pool: self.name.to_string(),
            waited,
            total: state.total,
            active: state.active,
            idle: state.idle,
            waiting: state.waiting,
            cause: self.last_failure.lock().clone(),
        }
    }

    /// Return a borrowed resource, or destroy it if it must not be reused.
    pub(crate) fn release(
        &self,
        entry: &Arc<Entry<M>>,
        resource: M::Resource,
        broken: bool,
        held: Duration,
    ) {
        MetricsTracker::increment(&self.metrics.total_released);
        self.recorder.record_usage(held);

        if entry.state().get() == EntryState::Removed {
            debug!(pool = %self.name, resource = entry.id(), "Closing resource aborted while borrowed");
            self.manager.close(resource);
            return;
        }

        let now = Instant::now();
        let retire = if broken {
            Some("resource was marked broken")
        } else if entry.is_marked_evicted() {
            Some("resource was evicted")
        } else if entry.is_expired(now) {
            Some("resource passed its max lifetime")
        } else if self.lifecycle() == Lifecycle::ShutDown {
            Some("pool is shutting down")
        } else {
            None
        };
        if let Some(reason) = retire {
            self.destroy(entry, Some(resource), reason);
            return;
        }

        entry.touch(now);
        entry.put_resource(resource);
        if !self.bag.requite(entry)
            && let Some(resource) = entry.take_resource()
        {
            self.manager.close(resource);
        }
    }

    /// Take a borrowed entry out of the pool for good, leaving its resource with the caller.
    pub(crate) fn detach(&self, entry: &Arc<Entry<M>>) {
        if self.bag.remove(entry).is_ok() {
            self.decrement_total();
            debug!(pool = %self.name, resource = entry.id(), "Detached resource");
            self.fill_pool();
        }
    }

    /// Create one resource and add it to the bag.
    pub(crate) fn create_one(&self) -> CreateOutcome {
        let previous = self.total.fetch_add(1, Ordering::SeqCst);
        if previous >= self.config.max_size || self.lifecycle() != Lifecycle::Normal {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return CreateOutcome::AtCapacity;
        }

        let started = Instant::now();
        match self.new_entry() {
            Ok(entry) => {
                let id = entry.id();
                if let Err(err) = self.bag.add(Arc::clone(&entry)) {
                    if let Some(resource) = entry.take_resource() {
                        self.manager.close(resource);
                    }
                    self.decrement_total();
                    return CreateOutcome::Failed(err);
                }

                *self.last_failure.lock() = None;
                MetricsTracker::increment(&self.metrics.total_created);
                self.recorder.record_creation(started.elapsed());
                debug!(pool = %self.name, resource = id, "Added resource");
                CreateOutcome::Created
            }
            Err(err) => {
                self.decrement_total();
                MetricsTracker::increment(&self.metrics.creation_failures);
                self.recorder.record_creation_failure();
                debug!(pool = %self.name, error = %err, "Cannot create resource");

                let cause = PoolError::boxed(err);
                *self.last_failure.lock() = Some(Arc::clone(&cause));
                CreateOutcome::Failed(PoolError::CreationFailed(cause))
            }
        }
    }

    fn new_entry(&self) -> Result<Arc<Entry<M>>, M::Error> {
        let mut resource = self.manager.create()?;
        if let Err(err) = self.setup(&mut resource) {
            self.manager.close(resource);
            return Err(err);
        }
        Ok(Arc::new(PoolEntry::new(resource, self.config.max_lifetime)))
    }

    fn setup(&self, resource: &mut M::Resource) -> Result<(), M::Error> {
        self.manager.initialize(resource)?;
        if let Some(query) = &self.config.init_query {
            self.manager
                .execute(resource, query, self.config.validation_timeout)?;
        }
        Ok(())
    }

    fn check_fail_fast(&self, timeout: Duration) -> PoolResult<()> {
        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match self.create_one() {
                CreateOutcome::Created | CreateOutcome::AtCapacity => return Ok(()),
                CreateOutcome::Failed(err) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let cause = match err {
                            PoolError::CreationFailed(cause) => cause,
                            other => Arc::new(other) as BoxError,
                        };
                        return Err(PoolError::InitializationFailed(cause));
                    }
                    std::thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    fn should_continue_creating(&self) -> bool {
        if self.lifecycle() != Lifecycle::Normal {
            return false;
        }
        let idle = self.bag.counts().not_in_use;
        self.total.load(Ordering::SeqCst) < self.config.max_size
            && (idle < self.config.min_idle || self.bag.waiting() > idle)
    }

    /// Queue enough creators to bring idle resources up to `min_idle`.
    fn fill_pool(&self) {
        if self.lifecycle() != Lifecycle::Normal {
            return;
        }

        let idle = self.bag.counts().not_in_use;
        let total = self.total.load(Ordering::SeqCst);
        if total >= self.config.max_size || idle >= self.config.min_idle {
            return;
        }

        let wanted = (self.config.min_idle - idle)
            .min(self.config.max_size - total)
            .saturating_sub(self.pending_creations.load(Ordering::SeqCst));
        for _ in 0..wanted {
            self.spawn_creator();
        }
    }

    /// Start a background creator that retries with capped exponential backoff.
    fn spawn_creator(&self) {
        let pending = PendingCreation::new(Arc::clone(&self.pending_creations));
        let pool = self.self_ref.clone();

        self.scheduler.spawn(async move {
            let _pending = pending;
            let mut backoff = INITIAL_BACKOFF;

            loop {
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                if !inner.should_continue_creating() {
                    break;
                }

                match tokio::task::spawn_blocking(move || inner.create_one()).await {
                    Ok(CreateOutcome::Failed(_)) => {}
                    Ok(CreateOutcome::Created | CreateOutcome::AtCapacity) | Err(_) => break,
                }

                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        });
    }

    /// Destroy an entry this thread has claimed (borrowed or reserved).
    fn destroy(&self, entry: &Arc<Entry<M>>, resource: Option<M::Resource>, reason: &str) {
        let removed = match self.bag.remove(entry) {
            Ok(()) => true,
            Err(err) => {
                if entry.state().get() != EntryState::Removed {
                    error!(pool = %self.name, resource = entry.id(), error = %err, "Failed to remove resource");
                }
                false
            }
        };

        if let Some(resource) = resource.or_else(|| entry.take_resource()) {
            self.manager.close(resource);
        }

        if removed {
            self.decrement_total();
            MetricsTracker::increment(&self.metrics.total_destroyed);
            self.recorder.record_destroyed();
            debug!(pool = %self.name, resource = entry.id(), reason, "Closed resource");
            self.fill_pool();
        }
    }

    fn decrement_total(&self) {
        let result = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| total.checked_sub(1));
        if result.is_err() {
            let err = PoolError::AccountingInconsistency("total resource count would go negative".into());
            error!(pool = %self.name, error = %err, "Accounting error");
        }
    }

    /// Retire idle entries past their max lifetime, and idle-timed-out ones down to `min_idle`.
    fn evict_idle_and_expired(&self) {
        let now = Instant::now();
        let idle_timeout = if self.config.min_idle < self.config.max_size {
            self.live.idle_timeout()
        } else {
            None
        };

        let idle = self.bag.snapshot(EntryState::NotInUse);
        let mut removable = idle.len().saturating_sub(self.config.min_idle);

        for entry in idle {
            if !self.bag.reserve(&entry) {
                continue;
            }

            if entry.is_expired(now) || entry.is_marked_evicted() {
                self.destroy(&entry, None, "resource passed its max lifetime");
                removable = removable.saturating_sub(1);
            } else if removable > 0 && idle_timeout.is_some_and(|timeout| entry.idle_for(now) > timeout) {
                self.destroy(&entry, None, "resource passed its idle timeout");
                removable -= 1;
            } else {
                self.bag.unreserve(&entry);
            }
        }
    }

    fn soft_evict_all(&self) {
        for entry in self.bag.values() {
            entry.mark_evicted();
            if self.bag.reserve(&entry) {
                self.destroy(&entry, None, "resource was soft-evicted");
            }
        }
    }

    /// Remove borrowed entries from the pool; their borrowers close them on release.
    fn abort_active(&self) {
        for entry in self.bag.snapshot(EntryState::InUse) {
            entry.mark_evicted();
            if self.bag.remove(&entry).is_ok() {
                if let Some(resource) = entry.take_resource() {
                    self.manager.close(resource);
                }
                self.decrement_total();
                MetricsTracker::increment(&self.metrics.total_destroyed);
                self.recorder.record_destroyed();
                warn!(pool = %self.name, resource = entry.id(), "Aborted borrowed resource during shutdown");
            }
        }
    }

    fn suspend(&self) -> PoolResult<()> {
        if !self.config.allow_suspension {
            return Err(PoolError::SuspensionNotAllowed);
        }

        let mut result = Ok(());
        let suspended = self.suspend_lock.suspend(|| {
            match self.lifecycle.compare_exchange(
                Lifecycle::Normal as u8,
                Lifecycle::Suspended as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => true,
                Err(current) => {
                    if Lifecycle::from_u8(current) == Lifecycle::ShutDown {
                        result = Err(PoolError::ShutdownInProgress);
                    }
                    false
                }
            }
        });

        if suspended {
            info!(pool = %self.name, "Pool suspended");
        }
        result
    }

    fn resume(&self) -> PoolResult<()> {
        if !self.config.allow_suspension {
            return Err(PoolError::SuspensionNotAllowed);
        }

        let resumed = self.suspend_lock.resume(|| {
            self.lifecycle
                .compare_exchange(
                    Lifecycle::Suspended as u8,
                    Lifecycle::Normal as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
        });

        if resumed {
            info!(pool = %self.name, "Pool resumed");
            self.fill_pool();
        }
        Ok(())
    }

    fn shutdown(&self) {
        let previous = self
            .lifecycle
            .swap(Lifecycle::ShutDown as u8, Ordering::SeqCst);
        if Lifecycle::from_u8(previous) == Lifecycle::ShutDown {
            return;
        }

        let state = self.state();
        info!(
            pool = %self.name,
            total = state.total,
            active = state.active,
            idle = state.idle,
            "Shutdown initiated"
        );

        self.scheduler.shutdown();
        self.suspend_lock.resume(|| true);
        self.bag.close();

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            self.abort_active();
            self.soft_evict_all();
            if self.total.load(Ordering::SeqCst) == 0 || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(SHUTDOWN_POLL);
        }

        let remaining = self.total.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(pool = %self.name, remaining, "Shutdown grace period elapsed with resources still open");
        }
        info!(pool = %self.name, "Shutdown completed");
    }
}

impl<M: ManageResource> BagStateListener for PoolInner<M> {
    fn add_bag_item(&self, waiting: usize) {
        if waiting > self.pending_creations.load(Ordering::SeqCst) {
            self.spawn_creator();
        }
    }
}

impl<M: ManageResource> Maintain for PoolInner<M> {
    fn run_housekeeping(&self) {
        if self.lifecycle() == Lifecycle::ShutDown {
            return;
        }

        let before = self.state();
        debug!(pool = %self.name, total = before.total, active = before.active,
            idle = before.idle, waiting = before.waiting, "Before cleanup");

        self.evict_idle_and_expired();

        let after = self.state();
        debug!(pool = %self.name, total = after.total, active = after.active,
            idle = after.idle, waiting = after.waiting, "After cleanup");
        self.recorder.record_state(&after);

        self.fill_pool();
    }
}

impl<M: ManageResource> Drop for PoolInner<M> {
    fn drop(&mut self) {
        self.scheduler.shutdown();
        self.bag.close();
        for entry in self.bag.values() {
            if let Some(resource) = entry.take_resource() {
                self.manager.close(resource);
            }
        }
    }
}

/// Counts a queued creator for as long as it exists.
struct PendingCreation(Arc<AtomicUsize>);

impl PendingCreation {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingCreation {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
