//! Key/value storage for task snapshots.

pub mod file;
pub mod json;
pub mod memory;

pub use file::FileStore;
pub use json::JsonStore;
pub use memory::MemoryStore;

use crate::core::SchedulerError;

/// Byte-slice key/value store with a single bucket.
pub trait Store: Send + Sync {
    /// Value stored under `key`.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SchedulerError>;

    /// Store `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), SchedulerError>;

    /// Remove `key`. Missing keys are not an error.
    fn delete(&self, key: &[u8]) -> Result<(), SchedulerError>;

    /// Number of keys.
    fn length(&self) -> Result<usize, SchedulerError>;

    /// Visit every entry in key order, stopping at the first error.
    fn for_each(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), SchedulerError>,
    ) -> Result<(), SchedulerError>;

    /// Flush pending writes.
    fn sync(&self) -> Result<(), SchedulerError> {
        Ok(())
    }
}
