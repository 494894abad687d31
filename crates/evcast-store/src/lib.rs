pub mod error;
pub mod file;
pub mod storage;
pub mod store;

pub use error::StoreError;
pub use file::JsonFileStorage;
pub use storage::{MemoryStorage, Storage};
pub use store::EventStore;
