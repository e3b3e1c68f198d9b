//! Registry of live task handles.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, PoisonError, RwLock};

use lxtask_common::error::{LxtaskError, Result};
use lxtask_common::types::TaskId;

use crate::handle::TaskHandle;

/// Concurrent map from task ID to handle.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<TaskId, Arc<TaskHandle>>>,
}

impl TaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the handle of `id`.
    pub fn set(&self, id: TaskId, handle: Arc<TaskHandle>) {
        let _ = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
    }

    /// Inserts the handle of `id` unless one is already registered.
    ///
    /// # Errors
    ///
    /// Returns [`LxtaskError::AlreadyExists`] if `id` is taken.
    pub fn insert_new(&self, id: TaskId, handle: Arc<TaskHandle>) -> Result<()> {
        match self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(id)
        {
            Entry::Occupied(e) => Err(LxtaskError::AlreadyExists {
                kind: "task",
                id: e.key().to_string(),
            }),
            Entry::Vacant(e) => {
                let _ = e.insert(handle);
                Ok(())
            }
        }
    }

    /// Returns the handle of `id`, if registered.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<Arc<TaskHandle>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Returns the handle of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`LxtaskError::NotFound`] if `id` is not registered.
    pub fn lookup(&self, id: &TaskId) -> Result<Arc<TaskHandle>> {
        self.get(id)
            .ok_or_else(|| LxtaskError::task_not_found(id.as_str()))
    }

    /// Returns whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Removes the handle of `id`; removing a missing key is a no-op.
    pub fn delete(&self, id: &TaskId) -> Option<Arc<TaskHandle>> {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Returns the registered task IDs, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
