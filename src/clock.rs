//! Lamport logical clock used to order distributed mutex requests.

use std::sync::atomic::{AtomicU64, Ordering};

/// A Lamport counter safe to share between concurrent message handlers.
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local event. Returns the new timestamp.
    pub fn increment(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merge a timestamp carried by an inbound message: `max(local, received) + 1`.
    pub fn update(&self, received: u64) -> u64 {
        let previous = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| {
                Some(local.max(received) + 1)
            })
            .unwrap_or_else(|current| current);
        previous.max(received) + 1
    }

    /// Current value without advancing the clock.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}
