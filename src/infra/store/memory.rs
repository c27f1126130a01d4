//! In-memory store.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::Store;
use crate::core::SchedulerError;

/// Store kept in a sorted map; lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SchedulerError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), SchedulerError> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), SchedulerError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn length(&self) -> Result<usize, SchedulerError> {
        Ok(self.entries.read().len())
    }

    fn for_each(
        &self,
        visit: &mut dyn FnMut(&[u8], &[u8]) -> Result<(), SchedulerError>,
    ) -> Result<(), SchedulerError> {
        let snapshot = self.entries.read().clone();
        for (key, value) in &snapshot {
            visit(key, value)?;
        }
        Ok(())
    }
}
