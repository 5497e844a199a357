//! Pool entries and their lifecycle state word

use crate::bag::BagItem;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a pooled entry.
///
/// ```text
/// NotInUse -> InUse -> NotInUse
/// NotInUse -> Reserved -> NotInUse | Removed
/// InUse -> Removed
/// ```
///
/// `Removed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    NotInUse = 0,
    InUse = 1,
    Reserved = 2,
    Removed = 3,
}

impl EntryState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EntryState::NotInUse,
            1 => EntryState::InUse,
            2 => EntryState::Reserved,
            _ => EntryState::Removed,
        }
    }
}

/// Atomic state word. Every transition is a single compare-and-set.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: EntryState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> EntryState {
        EntryState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move from `current` to `new`; false if another thread got there first.
    pub fn compare_and_set(&self, current: EntryState, new: EntryState) -> bool {
        if current == EntryState::Removed {
            return false;
        }
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// One pooled resource plus its lifecycle metadata.
///
/// The resource lives in `slot` while the entry is idle and is moved out to
/// the borrower while the entry is in use.
pub(crate) struct PoolEntry<R> {
    id: u64,
    state: StateCell,
    slot: Mutex<Option<R>>,
    created_at: Instant,
    // nanoseconds after `created_at`
    last_access: AtomicU64,
    expires_at: Option<Instant>,
    evicted: AtomicBool,
}

impl<R: Send + 'static> PoolEntry<R> {
    pub fn new(resource: R, max_lifetime: Option<Duration>) -> Self {
        let created_at = Instant::now();
        Self {
            id: NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed),
            state: StateCell::new(EntryState::NotInUse),
            slot: Mutex::new(Some(resource)),
            created_at,
            last_access: AtomicU64::new(0),
            expires_at: max_lifetime.and_then(|lifetime| created_at.checked_add(lifetime)),
            evicted: AtomicBool::new(false),
        }
    }

    /// When the resource was created
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the resource passes its max lifetime, if it has one
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// When the resource was last borrowed or returned
    pub fn last_access_at(&self) -> Instant {
        self.created_at + Duration::from_nanos(self.last_access.load(Ordering::Relaxed))
    }

    /// Record an access at `now`
    pub fn touch(&self, now: Instant) {
        let offset = now.saturating_duration_since(self.created_at).as_nanos();
        self.last_access
            .store(u64::try_from(offset).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Time since the last access
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access_at())
    }

    /// Whether the max lifetime has passed at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Flag the entry for destruction the next time it is seen by the pool.
    pub fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    /// Whether `mark_evicted` has been called
    pub fn is_marked_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Move the resource out of the entry, leaving it empty
    pub fn take_resource(&self) -> Option<R> {
        self.slot.lock().take()
    }

    /// Park a resource back in the entry
    pub fn put_resource(&self, resource: R) {
        *self.slot.lock() = Some(resource);
    }
}

impl<R: Send + 'static> BagItem for PoolEntry<R> {
    fn id(&self) -> u64 {
        self.id
    }

    fn state(&self) -> &StateCell {
        &self.state
    }
}

impl<R> std::fmt::Debug for PoolEntry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("created_at", &self.created_at)
            .field("evicted", &self.evicted.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_removed_is_terminal() {
        let cell = StateCell::new(EntryState::NotInUse);
        assert!(cell.compare_and_set(EntryState::NotInUse, EntryState::Reserved));
        assert!(cell.compare_and_set(EntryState::Reserved, EntryState::Removed));

        for next in [EntryState::NotInUse, EntryState::InUse, EntryState::Reserved] {
            assert!(!cell.compare_and_set(EntryState::Removed, next));
        }
        assert_eq!(cell.get(), EntryState::Removed);
    }

    #[test]
    fn test_cas_requires_expected_state() {
        let cell = StateCell::new(EntryState::NotInUse);
        assert!(!cell.compare_and_set(EntryState::InUse, EntryState::NotInUse));
        assert!(cell.compare_and_set(EntryState::NotInUse, EntryState::InUse));
        assert!(!cell.compare_and_set(EntryState::NotInUse, EntryState::InUse));
    }

    #[test]
    fn test_expiry_is_fixed_at_creation() {
        let entry = PoolEntry::new(7u32, Some(Duration::from_millis(20)));
        let expires_at = entry.expires_at().unwrap();

        entry.touch(Instant::now() + Duration::from_secs(1));
        assert_eq!(entry.expires_at(), Some(expires_at));
        assert!(!entry.is_expired(entry.created_at()));
        assert!(entry.is_expired(expires_at + Duration::from_millis(1)));
    }

    #[test]
    fn test_touch_updates_last_access() {
        let entry = PoolEntry::new((), None);
        let later = entry.created_at() + Duration::from_millis(40);
        entry.touch(later);

        assert_eq!(entry.last_access_at(), later);
        assert_eq!(entry.idle_for(later + Duration::from_millis(10)), Duration::from_millis(10));
        assert!(!entry.is_expired(later));
    }

    #[test]
    fn test_slot_moves_resource() {
        let entry = PoolEntry::new(String::from("conn"), None);
        let resource = entry.take_resource().unwrap();
        assert!(entry.take_resource().is_none());

        entry.put_resource(resource);
        assert_eq!(entry.take_resource().as_deref(), Some("conn"));
    }
}
