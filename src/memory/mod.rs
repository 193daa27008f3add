pub mod storage;
pub mod store;
pub mod types;

pub use storage::{storage_key, FileMemoryStorage, MemoryStorage, NoMemoryStorage};
pub use store::{MemoryConfig, QueryFilter, WorkingMemory};
pub use types::{validate_key, MemoryEntry, Priority, Scope, SetOptions, Tier};
