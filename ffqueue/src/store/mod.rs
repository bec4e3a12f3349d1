//! Persistence contracts consumed by the engine.
//!
//! The engine treats the store as the system of record: eligibility of a task
//! is always decided by what the store says, never by in-memory state.

mod memory;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::Result;
use crate::domain::{Preset, Task, TaskStatus, Watchfolder};

pub use memory::MemoryStore;

/// Task repository trait.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Task>;
    /// Persist the task unconditionally.
    async fn save_task(&self, task: &Task) -> Result<()>;
    /// Persist the task only if the stored copy is still in `expected` status.
    ///
    /// Returns `false` when another writer got there first.
    async fn save_task_if_status(&self, task: &Task, expected: TaskStatus) -> Result<bool>;
    /// Highest priority queued task, oldest first among equal priorities.
    async fn next_eligible(&self) -> Result<Option<Task>>;
    async fn count_non_terminal_in_batch(&self, batch: &str) -> Result<usize>;
    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, usize>>;
    async fn delete_task(&self, id: &str) -> Result<()>;
}

/// Preset repository trait.
#[async_trait]
pub trait PresetStore: Send + Sync {
    async fn get_preset(&self, id: &str) -> Result<Preset>;
    async fn save_preset(&self, preset: &Preset) -> Result<()>;
}

/// Watchfolder repository trait.
#[async_trait]
pub trait WatchfolderStore: Send + Sync {
    /// Watchfolders that are neither suspended nor deleted.
    async fn list_active(&self) -> Result<Vec<Watchfolder>>;
    async fn get_watchfolder(&self, id: &str) -> Result<Watchfolder>;
    async fn save_watchfolder(&self, watchfolder: &Watchfolder) -> Result<()>;
}
