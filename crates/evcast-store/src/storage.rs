use std::sync::atomic::{AtomicUsize, Ordering};

use evcast_core::Event;
use parking_lot::Mutex;

use crate::error::StoreError;

/// Durable home of the event collection.
///
/// `persist` must not return until the write is complete (or has failed);
/// `load` returns whatever the last successful `persist` wrote.
pub trait Storage: Send + Sync {
    /// Read the stored collection. A resource that does not exist yet is empty.
    fn load(&self) -> Result<Vec<Event>, StoreError>;

    /// Replace the stored collection.
    fn persist(&self, events: &[Event]) -> Result<(), StoreError>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// In-process storage with write-failure injection.
#[derive(Default)]
pub struct MemoryStorage {
    events: Mutex<Vec<Event>>,
    writes: AtomicUsize,
    fail_writes: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
            ..Self::default()
        }
    }

    /// Make the next `n` calls to `persist` fail.
    pub fn fail_next_writes(&self, n: usize) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// What was last successfully persisted.
    pub fn persisted(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Storage for MemoryStorage {
    fn load(&self) -> Result<Vec<Event>, StoreError> {
        Ok(self.events.lock().clone())
    }

    fn persist(&self, events: &[Event]) -> Result<(), StoreError> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Io("injected write failure".into()));
        }
        *self.events.lock() = events.to_vec();
        let _ = self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}
