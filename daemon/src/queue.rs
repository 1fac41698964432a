/// Notification hand-off between the listener and the dispatcher.
///
/// A single `Mutex<Vec<_>>` plus a `Condvar` signalled whenever values are
/// appended. The consumer always takes the whole buffer in one lock
/// acquisition, so it never sees a partially drained queue and nothing
/// appended between its wake-up and the drain can be lost.
///
/// The queue is unbounded; the dispatcher keeps it short by draining
/// everything each time.
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::state::DashcamState;

struct Shared {
    pending: Mutex<Vec<DashcamState>>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<DashcamState>> {
        // The buffer holds plain values; a panic elsewhere cannot leave it
        // half-updated.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Producer handle, held by the listener.
#[derive(Clone)]
pub struct NotificationSender {
    shared: Arc<Shared>,
}

/// Consumer handle, held by the dispatcher.
pub struct NotificationReceiver {
    shared: Arc<Shared>,
}

/// Creates a connected sender/receiver pair over an empty queue.
pub fn channel() -> (NotificationSender, NotificationReceiver) {
    let shared = Arc::new(Shared {
        pending: Mutex::new(Vec::new()),
        available: Condvar::new(),
    });
    (
        NotificationSender {
            shared: Arc::clone(&shared),
        },
        NotificationReceiver { shared },
    )
}

impl NotificationSender {
    /// Appends `states` in order under one lock and wakes the consumer once.
    pub fn append(&self, states: &[DashcamState]) {
        if states.is_empty() {
            return;
        }
        self.shared.lock().extend_from_slice(states);
        self.shared.available.notify_all();
    }

    pub fn push(&self, state: DashcamState) {
        self.append(&[state]);
    }
}

impl NotificationReceiver {
    /// Blocks until at least one value is queued, then takes all of them.
    pub fn drain_all(&self) -> Vec<DashcamState> {
        let guard = self.shared.lock();
        let mut guard = self
            .shared
            .available
            .wait_while(guard, |pending| pending.is_empty())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        mem::take(&mut *guard)
    }
}

#[cfg(test)]
impl NotificationReceiver {
    /// Like [`drain_all`](Self::drain_all) but gives up after `timeout`.
    /// Returns `None` if nothing arrived in time.
    pub fn drain_timeout(&self, timeout: std::time::Duration) -> Option<Vec<DashcamState>> {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.shared.lock();
        while guard.is_empty() {
            let remaining = deadline.checked_duration_since(std::time::Instant::now())?;
            let (next, result) = self
                .shared
                .available
                .wait_timeout(guard, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard = next;
            if result.timed_out() && guard.is_empty() {
                return None;
            }
        }
        Some(mem::take(&mut *guard))
    }

    /// Number of values waiting right now.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }
}
