use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::EventId;

/// Opaque payload fields of an event (title, start, end, ...).
pub type EventFields = Map<String, Value>;

/// A calendar event: a server-issued `id` plus fields the server never interprets.
///
/// On the wire the id sits alongside the payload fields:
/// `{"id":"evt_1","title":"Standup"}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(flatten)]
    pub fields: EventFields,
}

impl Event {
    /// Build an event, dropping any `id` key hiding in `fields`.
    pub fn new(id: EventId, mut fields: EventFields) -> Self {
        let _ = fields.remove("id");
        Self { id, fields }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}
