use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ActionError;
use crate::event::{Event, EventFields};
use crate::ids::EventId;

/// Raw client request: `{"action": "...", "payload": {...}}`.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub action: String,
    pub payload: Option<Value>,
}

/// Server push message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Full snapshot of the event collection.
    Update { events: Vec<Event> },
    /// Rejection of one action, sent only to its originator.
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn update(events: Vec<Event>) -> Self {
        Self::Update { events }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    AddEvent,
    UpdateEvent,
    DeleteEvent,
}

impl ActionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "addEvent" => Some(Self::AddEvent),
            "updateEvent" => Some(Self::UpdateEvent),
            "deleteEvent" => Some(Self::DeleteEvent),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddEvent => "addEvent",
            Self::UpdateEvent => "updateEvent",
            Self::DeleteEvent => "deleteEvent",
        }
    }
}

/// A validated client request.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Fields of a new event; the store assigns the id.
    AddEvent(EventFields),
    /// Full replacement for an existing event.
    UpdateEvent(Event),
    DeleteEvent(EventId),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::AddEvent(_) => ActionKind::AddEvent,
            Self::UpdateEvent(_) => ActionKind::UpdateEvent,
            Self::DeleteEvent(_) => ActionKind::DeleteEvent,
        }
    }

    /// Decode and validate one inbound text frame.
    ///
    /// Structural failures (not JSON, no `action` string) are `Decode`;
    /// unknown kinds and bad payloads are `InvalidAction`.
    pub fn decode(raw: &str) -> Result<Self, ActionError> {
        let message: ClientMessage =
            serde_json::from_str(raw).map_err(|e| ActionError::Decode(e.to_string()))?;
        Self::from_message(message)
    }

    pub fn from_message(message: ClientMessage) -> Result<Self, ActionError> {
        let kind = ActionKind::parse(&message.action).ok_or_else(|| {
            ActionError::InvalidAction(format!("unknown action: {}", message.action))
        })?;

        let mut payload = match message.payload {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(ActionError::InvalidAction(format!(
                    "{}: payload must be an object",
                    kind.as_str()
                )))
            }
            None => {
                return Err(ActionError::InvalidAction(format!(
                    "{}: missing payload",
                    kind.as_str()
                )))
            }
        };

        match kind {
            ActionKind::AddEvent => {
                // Ids are never trusted from clients.
                let _ = payload.remove("id");
                Ok(Self::AddEvent(payload))
            }
            ActionKind::UpdateEvent => {
                let id = require_id(&payload, kind)?;
                Ok(Self::UpdateEvent(Event::new(id, payload)))
            }
            ActionKind::DeleteEvent => Ok(Self::DeleteEvent(require_id(&payload, kind)?)),
        }
    }
}

fn require_id(payload: &EventFields, kind: ActionKind) -> Result<EventId, ActionError> {
    payload
        .get("id")
        .and_then(|v| v.as_str())
        .map(EventId::from_raw)
        .ok_or_else(|| {
            ActionError::InvalidAction(format!("{}: payload.id must be a string", kind.as_str()))
        })
}
