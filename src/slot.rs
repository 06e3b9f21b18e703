//! Single-slot freshest-wins buffer.
//!
//! Live frames lose value the moment a newer one exists, so the hand-off
//! between producers and a consumer is one slot deep: a put replaces
//! whatever is waiting, and a take drains the slot. A slow consumer sees
//! only the newest frame instead of a growing queue of stale ones.

use parking_lot::Mutex;

struct Inner<T> {
    pending: Option<T>,
    dropped: u64,
}

/// One-deep buffer where a new value displaces the unconsumed one.
pub struct FreshestSlot<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> FreshestSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: None,
                dropped: 0,
            }),
        }
    }

    /// Store `value`, displacing any unconsumed predecessor.
    ///
    /// Returns true when a pending value was displaced.
    pub fn put(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        let displaced = inner.pending.is_some();
        if displaced {
            inner.dropped += 1;
        }
        inner.pending = Some(value);
        displaced
    }

    /// Take the pending value, leaving the slot empty.
    pub fn take(&self) -> Option<T> {
        self.inner.lock().pending.take()
    }

    /// Number of values displaced before they were taken.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

impl<T> Default for FreshestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
