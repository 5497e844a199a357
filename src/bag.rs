//! Concurrent hand-off bag
//!
//! The bag lends entries to callers with as little cross-thread coordination as
//! possible. A borrow first looks at the calling thread's cache of entries it
//! recently returned, then scans the shared map trying to flip an idle entry to
//! in use, and only then parks on a zero-capacity hand-off channel until an
//! entry is returned, added, or the deadline passes.
//!
//! Fairness is relaxed on purpose: a thread returning an entry may pick it up
//! again before an older waiter does. Waiters are never held past their own
//! deadline.

use crate::entry::{EntryState, StateCell};
use crate::errors::{PoolError, PoolResult};

use crossbeam::channel::{self, Receiver, Sender, select};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::warn;

const LOCAL_CACHE_CAPACITY: usize = 16;

static NEXT_BAG_ID: AtomicU64 = AtomicU64::new(1);

/// Something that can be tracked by a [`ConcurrentBag`].
pub(crate) trait BagItem: Send + Sync + 'static {
    fn id(&self) -> u64;
    fn state(&self) -> &StateCell;
}

/// Notified when borrowers are waiting and more items are wanted.
pub(crate) trait BagStateListener: Send + Sync {
    fn add_bag_item(&self, waiting: usize);
}

struct LocalSlot {
    bag_id: u64,
    item_id: u64,
    item: Weak<dyn Any + Send + Sync>,
}

thread_local! {
    static LOCAL_CACHE: RefCell<Vec<LocalSlot>> = const { RefCell::new(Vec::new()) };
}

pub(crate) struct ConcurrentBag<T: BagItem> {
    id: u64,
    shared: DashMap<u64, Arc<T>>,
    waiters: AtomicUsize,
    closed: AtomicBool,
    handoff_tx: Sender<Arc<T>>,
    handoff_rx: Receiver<Arc<T>>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    listener: Weak<dyn BagStateListener>,
}

impl<T: BagItem> ConcurrentBag<T> {
    pub fn new(listener: Weak<dyn BagStateListener>) -> Self {
        let (handoff_tx, handoff_rx) = channel::bounded(0);
        let (close_tx, close_rx) = channel::bounded(0);
        Self {
            id: NEXT_BAG_ID.fetch_add(1, Ordering::Relaxed),
            shared: DashMap::new(),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            handoff_tx,
            handoff_rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            listener,
        }
    }

    /// Borrow an idle item, waiting until `deadline` if none is available.
    ///
    /// Returns `Ok(None)` when the deadline passes and
    /// `Err(ShutdownInProgress)` once the bag is closed.
    pub fn borrow(&self, deadline: Instant) -> PoolResult<Option<Arc<T>>> {
        if self.is_closed() {
            return Err(PoolError::ShutdownInProgress);
        }

        if let Some(item) = self.borrow_local() {
            return Ok(Some(item));
        }

        let waiting = self.waiters.fetch_add(1, Ordering::SeqCst) + 1;
        let _waiter = WaiterGuard(&self.waiters);

        if let Some(item) = self.scan() {
            if waiting > 1 {
                self.notify_listener(waiting - 1);
            }
            return Ok(Some(item));
        }

        self.notify_listener(waiting);

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(self.scan());
            }

            select! {
                recv(self.handoff_rx) -> msg => {
                    if let Ok(item) = msg {
                        if item.state().compare_and_set(EntryState::NotInUse, EntryState::InUse) {
                            return Ok(Some(item));
                        }
                        // lost the hand-off, another item may have come back meanwhile
                        if let Some(item) = self.scan() {
                            return Ok(Some(item));
                        }
                    }
                }
                recv(self.close_rx) -> _ => return Err(PoolError::ShutdownInProgress),
                default(deadline - now) => {}
            }
        }
    }

    /// Return a borrowed item to availability.
    ///
    /// False if the item was concurrently removed and could not be requited.
    pub fn requite(&self, item: &Arc<T>) -> bool {
        if !item.state().compare_and_set(EntryState::InUse, EntryState::NotInUse) {
            warn!(item = item.id(), state = ?item.state().get(), "Requite of an item that is not in use");
            return false;
        }

        if self.offer_to_waiters(item) {
            return true;
        }

        self.cache_locally(item);
        true
    }

    /// Insert a new item as idle and wake one waiter.
    pub fn add(&self, item: Arc<T>) -> PoolResult<()> {
        if self.is_closed() {
            return Err(PoolError::ShutdownInProgress);
        }

        self.shared.insert(item.id(), Arc::clone(&item));
        self.offer_to_waiters(&item);
        Ok(())
    }

    /// Claim an idle item so no borrower can take it.
    pub fn reserve(&self, item: &Arc<T>) -> bool {
        item.state().compare_and_set(EntryState::NotInUse, EntryState::Reserved)
    }

    /// Release a reservation, making the item borrowable again.
    pub fn unreserve(&self, item: &Arc<T>) -> bool {
        if item.state().compare_and_set(EntryState::Reserved, EntryState::NotInUse) {
            self.offer_to_waiters(item);
            true
        } else {
            warn!(item = item.id(), state = ?item.state().get(), "Unreserve of an item that is not reserved");
            false
        }
    }

    /// Permanently take a borrowed or reserved item out of the bag.
    pub fn remove(&self, item: &Arc<T>) -> PoolResult<()> {
        let cell = item.state();
        if !cell.compare_and_set(EntryState::InUse, EntryState::Removed)
            && !cell.compare_and_set(EntryState::Reserved, EntryState::Removed)
        {
            return Err(PoolError::AccountingInconsistency(format!(
                "attempt to remove item {} in state {:?}",
                item.id(),
                cell.get()
            )));
        }

        if self.shared.remove(&item.id()).is_none() {
            return Err(PoolError::AccountingInconsistency(format!(
                "removed item {} was not in the bag",
                item.id()
            )));
        }

        let (bag_id, item_id) = (self.id, item.id());
        let _ = LOCAL_CACHE.try_with(|cache| {
            cache
                .borrow_mut()
                .retain(|slot| !(slot.bag_id == bag_id && slot.item_id == item_id));
        });
        Ok(())
    }

    /// Point-in-time list of items in `state`.
    pub fn snapshot(&self, state: EntryState) -> Vec<Arc<T>> {
        self.shared
            .iter()
            .filter(|item| item.value().state().get() == state)
            .map(|item| Arc::clone(item.value()))
            .collect()
    }

    /// Point-in-time list of every item.
    pub fn values(&self) -> Vec<Arc<T>> {
        self.shared.iter().map(|item| Arc::clone(item.value())).collect()
    }

    /// Counts of items per state, in one pass.
    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for item in self.shared.iter() {
            match item.value().state().get() {
                EntryState::NotInUse => counts.not_in_use += 1,
                EntryState::InUse => counts.in_use += 1,
                EntryState::Reserved => counts.reserved += 1,
                EntryState::Removed => {}
            }
        }
        counts
    }

    pub fn waiting(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Refuse further additions and wake every parked borrower.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_tx.lock().take();
    }

    fn borrow_local(&self) -> Option<Arc<T>> {
        LOCAL_CACHE
            .try_with(|cache| {
                let mut cache = cache.borrow_mut();
                let mut index = cache.len();
                while index > 0 {
                    index -= 1;
                    if cache[index].bag_id != self.id {
                        continue;
                    }

                    let slot = cache.remove(index);
                    let item = slot
                        .item
                        .upgrade()
                        .and_then(|item| item.downcast::<T>().ok());
                    if let Some(item) = item
                        && item.state().compare_and_set(EntryState::NotInUse, EntryState::InUse)
                    {
                        return Some(item);
                    }
                }
                None
            })
            .ok()
            .flatten()
    }

    fn cache_locally(&self, item: &Arc<T>) {
        let any: Arc<dyn Any + Send + Sync> = Arc::clone(item) as Arc<dyn Any + Send + Sync>;
        let slot = LocalSlot {
            bag_id: self.id,
            item_id: item.id(),
            item: Arc::downgrade(&any),
        };

        let _ = LOCAL_CACHE.try_with(|cache| {
            let mut cache = cache.borrow_mut();
            cache.retain(|slot| slot.item.strong_count() > 0);
            if cache.len() >= LOCAL_CACHE_CAPACITY {
                cache.remove(0);
            }
            cache.push(slot);
        });
    }

    fn scan(&self) -> Option<Arc<T>> {
        self.shared.iter().find_map(|item| {
            item.value()
                .state()
                .compare_and_set(EntryState::NotInUse, EntryState::InUse)
                .then(|| Arc::clone(item.value()))
        })
    }

    /// Hand an idle item to a parked borrower, if there is one.
    ///
    /// Spins while borrowers are registered and the item is still idle, so a
    /// borrower that is between its scan and parking is not missed.
    fn offer_to_waiters(&self, item: &Arc<T>) -> bool {
        let mut attempt = 0u32;
        while self.waiters.load(Ordering::SeqCst) > 0 && !self.is_closed() {
            if item.state().get() != EntryState::NotInUse {
                return true;
            }
            if self.handoff_tx.try_send(Arc::clone(item)).is_ok() {
                return true;
            }

            attempt = attempt.wrapping_add(1);
            if attempt & 0xff == 0xff {
                std::thread::sleep(std::time::Duration::from_micros(10));
            } else {
                std::thread::yield_now();
            }
        }
        false
    }

    fn notify_listener(&self, waiting: usize) {
        if let Some(listener) = self.listener.upgrade() {
            listener.add_bag_item(waiting);
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateCounts {
    pub not_in_use: usize,
    pub in_use: usize,
    pub reserved: usize,
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    struct Item {
        id: u64,
        state: StateCell,
    }

    impl Item {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                state: StateCell::new(EntryState::NotInUse),
            })
        }
    }

    impl BagItem for Item {
        fn id(&self) -> u64 {
            self.id
        }

        fn state(&self) -> &StateCell {
            &self.state
        }
    }

    #[derive(Default)]
    struct CountingListener {
        calls: AtomicUsize,
    }

    impl BagStateListener for CountingListener {
        fn add_bag_item(&self, _waiting: usize) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn bag() -> (ConcurrentBag<Item>, Arc<CountingListener>) {
        let listener = Arc::new(CountingListener::default());
        let weak: Weak<dyn BagStateListener> = Arc::downgrade(&listener) as Weak<dyn BagStateListener>;
        (ConcurrentBag::new(weak), listener)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn test_borrow_and_requite() {
        let (bag, _) = bag();
        bag.add(Item::new(1)).unwrap();

        let item = bag.borrow(soon()).unwrap().unwrap();
        assert_eq!(item.state().get(), EntryState::InUse);
        assert!(bag.borrow(soon()).unwrap().is_none());

        assert!(bag.requite(&item));
        assert_eq!(item.state().get(), EntryState::NotInUse);
        assert_eq!(bag.counts().not_in_use, 1);
    }

    #[test]
    fn test_local_cache_returns_same_item() {
        let (bag, _) = bag();
        for id in 1..=4 {
            bag.add(Item::new(id)).unwrap();
        }

        let item = bag.borrow(soon()).unwrap().unwrap();
        let id = item.id();
        bag.requite(&item);

        let again = bag.borrow(soon()).unwrap().unwrap();
        assert_eq!(again.id(), id);
    }

    #[test]
    fn test_empty_borrow_notifies_listener_and_times_out() {
        let (bag, listener) = bag();
        let started = Instant::now();

        assert!(bag.borrow(started + Duration::from_millis(30)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bag.waiting(), 0);
    }

    #[test]
    fn test_handoff_to_parked_waiter() {
        let (bag, _) = bag();
        let bag = Arc::new(bag);
        bag.add(Item::new(1)).unwrap();
        let held = bag.borrow(soon()).unwrap().unwrap();

        let waiter = {
            let bag = Arc::clone(&bag);
            thread::spawn(move || bag.borrow(Instant::now() + Duration::from_secs(2)))
        };

        while bag.waiting() == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        bag.requite(&held);

        let received = waiter.join().unwrap().unwrap().unwrap();
        assert_eq!(received.id(), 1);
        assert_eq!(received.state().get(), EntryState::InUse);
    }

    #[test]
    fn test_lost_handoff_falls_back_to_scan() {
        let (bag, _) = bag();
        let bag = Arc::new(bag);
        let taken = Item::new(1);
        assert!(taken.state().compare_and_set(EntryState::NotInUse, EntryState::InUse));

        let waiter = {
            let bag = Arc::clone(&bag);
            thread::spawn(move || {
                let started = Instant::now();
                let item = bag.borrow(started + Duration::from_secs(5));
                (item, started.elapsed())
            })
        };

        while bag.waiting() == 0 {
            thread::yield_now();
        }
        thread::sleep(Duration::from_millis(10));
        bag.shared.insert(2, Item::new(2));
        bag.handoff_tx.send_timeout(taken, Duration::from_secs(1)).unwrap();

        let (received, waited) = waiter.join().unwrap();
        assert_eq!(received.unwrap().unwrap().id(), 2);
        assert!(waited < Duration::from_secs(1));
    }

    #[test]
    fn test_add_wakes_waiter() {
        let (bag, _) = bag();
        let bag = Arc::new(bag);

        let waiter = {
            let bag = Arc::clone(&bag);
            thread::spawn(move || bag.borrow(Instant::now() + Duration::from_secs(2)))
        };

        while bag.waiting() == 0 {
            thread::yield_now();
        }
        bag.add(Item::new(9)).unwrap();

        let received = waiter.join().unwrap().unwrap().unwrap();
        assert_eq!(received.id(), 9);
    }

    #[test]
    fn test_reserved_item_is_not_borrowable() {
        let (bag, _) = bag();
        let item = Item::new(1);
        bag.add(Arc::clone(&item)).unwrap();

        assert!(bag.reserve(&item));
        assert!(bag.borrow(soon()).unwrap().is_none());
        assert!(bag.unreserve(&item));
        assert!(bag.borrow(soon()).unwrap().is_some());
    }

    #[test]
    fn test_remove_requires_claim() {
        let (bag, _) = bag();
        let item = Item::new(1);
        bag.add(Arc::clone(&item)).unwrap();

        assert!(matches!(
            bag.remove(&item),
            Err(PoolError::AccountingInconsistency(_))
        ));

        assert!(bag.reserve(&item));
        bag.remove(&item).unwrap();
        assert_eq!(item.state().get(), EntryState::Removed);
        assert!(bag.values().is_empty());
        assert!(bag.remove(&item).is_err());
    }

    #[test]
    fn test_removed_item_leaves_local_cache() {
        let (bag, _) = bag();
        let item = Item::new(1);
        bag.add(Arc::clone(&item)).unwrap();

        let borrowed = bag.borrow(soon()).unwrap().unwrap();
        bag.requite(&borrowed);
        assert!(bag.reserve(&item));
        bag.remove(&item).unwrap();

        assert!(bag.borrow(soon()).unwrap().is_none());
    }

    #[test]
    fn test_snapshot_filters_by_state() {
        let (bag, _) = bag();
        for id in 1..=3 {
            bag.add(Item::new(id)).unwrap();
        }
        let _held = bag.borrow(soon()).unwrap().unwrap();

        assert_eq!(bag.snapshot(EntryState::NotInUse).len(), 2);
        assert_eq!(bag.snapshot(EntryState::InUse).len(), 1);
        assert_eq!(bag.values().len(), 3);
    }

    #[test]
    fn test_close_wakes_waiters_and_rejects_add() {
        let (bag, _) = bag();
        let bag = Arc::new(bag);

        let waiter = {
            let bag = Arc::clone(&bag);
            thread::spawn(move || bag.borrow(Instant::now() + Duration::from_secs(10)))
        };

        while bag.waiting() == 0 {
            thread::yield_now();
        }
        let started = Instant::now();
        bag.close();

        assert!(matches!(waiter.join().unwrap(), Err(PoolError::ShutdownInProgress)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(bag.add(Item::new(1)).is_err());
    }

    #[test]
    fn test_concurrent_borrowers_never_share() {
        let (bag, _) = bag();
        let bag = Arc::new(bag);
        for id in 1..=4 {
            bag.add(Item::new(id)).unwrap();
        }
        let in_use = Arc::new(DashMap::<u64, ()>::new());

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let bag = Arc::clone(&bag);
                let in_use = Arc::clone(&in_use);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if let Some(item) = bag.borrow(Instant::now() + Duration::from_secs(1)).unwrap() {
                            assert!(in_use.insert(item.id(), ()).is_none());
                            thread::yield_now();
                            in_use.remove(&item.id());
                            assert!(bag.requite(&item));
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(bag.counts().not_in_use, 4);
    }
}
