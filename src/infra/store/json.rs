//! Task view over a byte store: JSON values keyed by task id.

use std::sync::Arc;

use uuid::Uuid;

use super::Store;
use crate::core::task::Task;
use crate::core::SchedulerError;

/// Stores tasks as JSON under their stringified id.
#[derive(Clone)]
pub struct JsonStore {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for JsonStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStore").finish_non_exhaustive()
    }
}

impl JsonStore {
    /// Wrap `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Task stored under `id`.
    pub fn get(&self, id: Uuid) -> Result<Option<Task>, SchedulerError> {
        self.store
            .get(id.to_string().as_bytes())?
            .map(|raw| serde_json::from_slice(&raw).map_err(SchedulerError::from))
            .transpose()
    }

    /// Store `task`, which must carry an id.
    pub fn put(&self, task: &Task) -> Result<(), SchedulerError> {
        let id = task
            .id
            .ok_or_else(|| SchedulerError::InvalidArgument("task without id".into()))?;
        let raw = serde_json::to_vec(task)?;
        self.store.put(id.to_string().as_bytes(), &raw)
    }

    /// Forget `id`.
    pub fn delete(&self, id: Uuid) -> Result<(), SchedulerError> {
        self.store.delete(id.to_string().as_bytes())
    }

    /// Number of stored tasks.
    pub fn length(&self) -> Result<usize, SchedulerError> {
        self.store.length()
    }

    /// Visit every stored task.
    pub fn for_each(
        &self,
        mut visit: impl FnMut(Task) -> Result<(), SchedulerError>,
    ) -> Result<(), SchedulerError> {
        self.store
            .for_each(&mut |_, raw| visit(serde_json::from_slice(raw)?))
    }

    /// Every stored task.
    pub fn tasks(&self) -> Result<Vec<Task>, SchedulerError> {
        let mut tasks = Vec::new();
        self.for_each(|task| {
            tasks.push(task);
            Ok(())
        })?;
        Ok(tasks)
    }

    /// Flush the underlying store.
    pub fn sync(&self) -> Result<(), SchedulerError> {
        self.store.sync()
    }
}
