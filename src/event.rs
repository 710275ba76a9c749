// Waitable event module
// An auto-reset event: `set` wakes one pending or future `wait`, which consumes the signal.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
pub(crate) struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking every thread currently blocked in `wait`.
    pub(crate) fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Drop a pending signal without waking anyone.
    pub(crate) fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Block until the event is signaled or `timeout` elapses.
    /// Returns true if the event was signaled; the signal is consumed.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                break;
            }
        }
        let was_signaled = *signaled;
        *signaled = false;
        was_signaled
    }
}
