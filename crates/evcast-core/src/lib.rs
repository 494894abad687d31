//! Shared types for evcast: event ids, events, the client/server wire
//! protocol, and the action error taxonomy.

pub mod errors;
pub mod event;
pub mod ids;
pub mod protocol;

pub use errors::ActionError;
pub use event::{Event, EventFields};
pub use ids::{ConnectionId, EventId};
pub use protocol::{Action, ActionKind, ClientMessage, ServerMessage};
