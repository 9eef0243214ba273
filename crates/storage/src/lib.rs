pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryKeyValueStore;
pub use sqlite::SqliteKeyValueStore;

/// Durable string records keyed by fixed names.
///
/// Calls are synchronous so callers can treat writes as fire-and-forget; backends that
/// need async IO hide it behind their own worker.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
    fn clear_all(&self) -> StorageResult<()>;
}
