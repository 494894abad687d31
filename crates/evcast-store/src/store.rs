use std::collections::HashSet;
use std::sync::Arc;

use evcast_core::{Event, EventFields, EventId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::storage::Storage;

const DEFAULT_PERSIST_RETRIES: u32 = 2;

/// Authoritative, ordered event collection backed by a [`Storage`].
///
/// Mutations are serialized by `mutation`. Each one builds the candidate
/// collection, persists it, and only then swaps it in. The `events` lock is
/// held just for the copy and the swap, so readers never wait on storage I/O
/// and a failed persist leaves the in-memory collection exactly as it was.
pub struct EventStore {
    events: RwLock<Vec<Event>>,
    mutation: Mutex<()>,
    storage: Arc<dyn Storage>,
    persist_retries: u32,
}

impl EventStore {
    /// Load the collection from `storage`. Fails on unreadable storage or on
    /// a collection that repeats an id.
    pub fn open(storage: Arc<dyn Storage>) -> Result<Self, StoreError> {
        let events = storage.load()?;

        let mut seen = HashSet::with_capacity(events.len());
        for event in &events {
            if !seen.insert(event.id.as_str()) {
                return Err(StoreError::Corrupt(format!(
                    "{}: duplicate event id {}",
                    storage.describe(),
                    event.id
                )));
            }
        }

        info!(storage = %storage.describe(), events = events.len(), "event store opened");

        Ok(Self {
            events: RwLock::new(events),
            mutation: Mutex::new(()),
            storage,
            persist_retries: DEFAULT_PERSIST_RETRIES,
        })
    }

    /// Extra persist attempts before a write surfaces as an error.
    pub fn with_persist_retries(mut self, retries: u32) -> Self {
        self.persist_retries = retries;
        self
    }

    /// Consistent copy of the whole collection.
    pub fn read_all(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Number of stored events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a new event under a freshly minted id.
    #[instrument(skip(self, fields))]
    pub fn append(&self, fields: EventFields) -> Result<Event, StoreError> {
        let _guard = self.mutation.lock();

        let mut candidate = self.read_all();
        let event = Event::new(EventId::generate(), fields);
        candidate.push(event.clone());

        self.commit(candidate)?;
        info!(event_id = %event.id, "event appended");
        Ok(event)
    }

    /// Replace the event with the same id, keeping its position.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub fn replace(&self, event: Event) -> Result<Event, StoreError> {
        let _guard = self.mutation.lock();

        let mut candidate = self.read_all();
        let Some(index) = candidate.iter().position(|e| e.id == event.id) else {
            return Err(StoreError::NotFound(event.id));
        };
        candidate[index] = event.clone();

        self.commit(candidate)?;
        info!(event_id = %event.id, index, "event replaced");
        Ok(event)
    }

    /// Remove the event with `id`. Returns whether anything was removed;
    /// removing an absent id is not an error.
    #[instrument(skip(self), fields(event_id = %id))]
    pub fn delete(&self, id: &EventId) -> Result<bool, StoreError> {
        let _guard = self.mutation.lock();

        let mut candidate = self.read_all();
        let before = candidate.len();
        candidate.retain(|e| &e.id != id);
        if candidate.len() == before {
            return Ok(false);
        }

        self.commit(candidate)?;
        info!(event_id = %id, "event deleted");
        Ok(true)
    }

    /// Persist `candidate`, then make it the live collection.
    fn commit(&self, candidate: Vec<Event>) -> Result<(), StoreError> {
        self.persist(&candidate)?;
        let total = candidate.len();
        *self.events.write() = candidate;
        debug!(total, "collection committed");
        Ok(())
    }

    fn persist(&self, events: &[Event]) -> Result<(), StoreError> {
        let attempts = self.persist_retries + 1;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.storage.persist(events) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "persist failed");
                    last_error = Some(e);
                }
            }
        }
        Err(StoreError::PersistFailed {
            attempts,
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}
