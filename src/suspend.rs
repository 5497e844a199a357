//! Suspend/resume gate in front of acquisition
//!
//! Every acquisition holds a permit for its duration. Suspending stops new
//! permits from being issued and waits until the outstanding ones drain, so
//! once `suspend` returns no caller is inside the pool. Blocked callers keep
//! their own deadline and proceed as soon as the pool is resumed. Callers pass
//! their lifecycle transition in, so it flips together with the gate.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

struct Gate {
    in_flight: usize,
    suspended: bool,
}

pub(crate) struct SuspendResumeLock {
    enabled: bool,
    gate: Mutex<Gate>,
    changed: Condvar,
}

/// Held for the duration of one acquisition.
pub(crate) struct Permit<'a> {
    lock: Option<&'a SuspendResumeLock>,
}

impl SuspendResumeLock {
    /// A disabled lock never blocks and hands out no-op permits.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            gate: Mutex::new(Gate {
                in_flight: 0,
                suspended: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Wait for a permit until `deadline`; `None` if the pool stayed suspended.
    pub fn acquire(&self, deadline: Instant) -> Option<Permit<'_>> {
        if !self.enabled {
            return Some(Permit { lock: None });
        }

        let mut gate = self.gate.lock();
        while gate.suspended {
            if self.changed.wait_until(&mut gate, deadline).timed_out() && gate.suspended {
                return None;
            }
        }
        gate.in_flight += 1;
        Some(Permit { lock: Some(self) })
    }

    /// Run `transition` under the gate and, if it succeeds, block new permits
    /// and wait until outstanding ones are returned.
    ///
    /// A `resume` that lands while draining ends the wait early; the result
    /// is then false since the gate is open again.
    pub fn suspend(&self, transition: impl FnOnce() -> bool) -> bool {
        if !self.enabled {
            return false;
        }

        let mut gate = self.gate.lock();
        if !transition() {
            return false;
        }
        gate.suspended = true;
        while gate.suspended && gate.in_flight > 0 {
            self.changed.wait(&mut gate);
        }
        gate.suspended
    }

    /// Run `transition` under the gate and, if it succeeds, let permits through again.
    pub fn resume(&self, transition: impl FnOnce() -> bool) -> bool {
        if !self.enabled {
            return false;
        }

        let mut gate = self.gate.lock();
        if !transition() {
            return false;
        }
        gate.suspended = false;
        drop(gate);
        self.changed.notify_all();
        true
    }

    fn release(&self) {
        let mut gate = self.gate.lock();
        gate.in_flight -= 1;
        if gate.in_flight == 0 {
            self.changed.notify_all();
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock {
            lock.release();
        }
    }
}
