use crate::ids::EventId;
use crate::protocol::ServerMessage;

/// Why a client action was rejected. Every variant is recoverable: the
/// originating connection gets an error reply and stays open.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("malformed message: {0}")]
    Decode(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("event not found: {0}")]
    NotFound(EventId),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl ActionError {
    /// Stable code carried in the error reply.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "DECODE_ERROR",
            Self::InvalidAction(_) => "INVALID_ACTION",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}
