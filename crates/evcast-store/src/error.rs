use evcast_core::{ActionError, EventId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt storage: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(EventId),

    #[error("persist failed after {attempts} attempts: {reason}")]
    PersistFailed { attempts: u32, reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for ActionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ActionError::NotFound(id),
            other => ActionError::Storage(other.to_string()),
        }
    }
}
