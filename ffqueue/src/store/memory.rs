//! In-memory store used by the standalone binary and the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{JobStore, PresetStore, WatchfolderStore};
use crate::domain::{Preset, Task, TaskStatus, Watchfolder, now_millis};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct StoredTask {
    /// Insertion order, breaks ties between tasks created in the same millisecond.
    seq: u64,
    task: Task,
}

/// Store keeping every record in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, StoredTask>>,
    presets: RwLock<HashMap<String, Preset>>,
    watchfolders: RwLock<HashMap<String, Watchfolder>>,
    next_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored task.
    pub fn tasks(&self) -> Vec<Task> {
        let tasks = self.tasks.read();
        let mut all: Vec<&StoredTask> = tasks.values().collect();
        all.sort_by_key(|stored| stored.seq);
        all.into_iter().map(|stored| stored.task.clone()).collect()
    }

    fn touch(task: &Task) -> Task {
        let mut task = task.clone();
        task.updated_at = now_millis();
        task
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write();
        if tasks.contains_key(&task.id) {
            return Err(Error::store(format!("task {} already exists", task.id)));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        tasks.insert(
            task.id.clone(),
            StoredTask {
                seq,
                task: task.clone(),
            },
        );
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks
            .read()
            .get(id)
            .map(|stored| stored.task.clone())
            .ok_or_else(|| Error::not_found("Task", id))
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write();
        let stored = tasks
            .get_mut(&task.id)
            .ok_or_else(|| Error::not_found("Task", &task.id))?;
        stored.task = Self::touch(task);
        Ok(())
    }

    async fn save_task_if_status(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let mut tasks = self.tasks.write();
        let stored = tasks
            .get_mut(&task.id)
            .ok_or_else(|| Error::not_found("Task", &task.id))?;
        if stored.task.status != expected {
            return Ok(false);
        }
        stored.task = Self::touch(task);
        Ok(true)
    }

    async fn next_eligible(&self) -> Result<Option<Task>> {
        let tasks = self.tasks.read();
        let next = tasks
            .values()
            .filter(|stored| stored.task.status == TaskStatus::Queued)
            .min_by(|a, b| {
                b.task
                    .priority
                    .cmp(&a.task.priority)
                    .then(a.task.created_at.cmp(&b.task.created_at))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|stored| stored.task.clone());
        Ok(next)
    }

    async fn count_non_terminal_in_batch(&self, batch: &str) -> Result<usize> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|stored| {
                stored.task.batch.as_deref() == Some(batch) && !stored.task.status.is_terminal()
            })
            .count())
    }

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, usize>> {
        let mut counts: HashMap<TaskStatus, usize> =
            TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for stored in self.tasks.read().values() {
            *counts.entry(stored.task.status).or_default() += 1;
        }
        Ok(counts)
    }

    async fn delete_task(&self, id: &str) -> Result<()> {
        self.tasks
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("Task", id))
    }
}

#[async_trait]
impl PresetStore for MemoryStore {
    async fn get_preset(&self, id: &str) -> Result<Preset> {
        self.presets
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Preset", id))
    }

    async fn save_preset(&self, preset: &Preset) -> Result<()> {
        self.presets
            .write()
            .insert(preset.id.clone(), preset.clone());
        Ok(())
    }
}

#[async_trait]
impl WatchfolderStore for MemoryStore {
    async fn list_active(&self) -> Result<Vec<Watchfolder>> {
        let mut active: Vec<Watchfolder> = self
            .watchfolders
            .read()
            .values()
            .filter(|wf| wf.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|wf| wf.created_at);
        Ok(active)
    }

    async fn get_watchfolder(&self, id: &str) -> Result<Watchfolder> {
        self.watchfolders
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found("Watchfolder", id))
    }

    async fn save_watchfolder(&self, watchfolder: &Watchfolder) -> Result<()> {
        let mut watchfolder = watchfolder.clone();
        watchfolder.updated_at = now_millis();
        self.watchfolders
            .write()
            .insert(watchfolder.id.clone(), watchfolder);
        Ok(())
    }
}
