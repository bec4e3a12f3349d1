//! Task service: creation, updates and user initiated lifecycle changes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::domain::{NewTask, Task, TaskStatus};
use crate::notify::{EngineEvent, EventNotifier};
use crate::store::{JobStore, PresetStore};
use crate::{Error, Result};

/// Cause recorded on tasks canceled on request.
pub const CANCELED_BY_USER: &str = "task canceled by user";

/// Source tag of tasks submitted by API clients.
pub const SOURCE_API: &str = "api";

/// Receiving end of the cancellation-request stream, consumed by the scheduler.
pub type CancelRequestReceiver = mpsc::UnboundedReceiver<String>;

pub struct TaskService {
    store: Arc<dyn JobStore>,
    presets: Arc<dyn PresetStore>,
    notifier: Arc<dyn EventNotifier>,
    cancel_tx: mpsc::UnboundedSender<String>,
    /// Serializes terminal batch updates so "batch finished" is observed once.
    batch_lock: Mutex<()>,
}

impl TaskService {
    /// Create the service together with the cancellation-request stream it feeds.
    pub fn new(
        store: Arc<dyn JobStore>,
        presets: Arc<dyn PresetStore>,
        notifier: Arc<dyn EventNotifier>,
    ) -> (Self, CancelRequestReceiver) {
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        let service = Self {
            store,
            presets,
            notifier,
            cancel_tx,
            batch_lock: Mutex::new(()),
        };
        (service, cancel_rx)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.store.get_task(id).await
    }

    /// Create and enqueue a task.
    ///
    /// When the request names a preset, fields left unset on the request are
    /// inherited from it.
    pub async fn create_task(
        &self,
        request: NewTask,
        batch: Option<String>,
        source: &str,
    ) -> Result<Task> {
        let request = self.prepare(request).await?;
        let task = Task::from_request(&request, batch, source);
        self.insert(&task).await?;
        Ok(task)
    }

    /// Create several tasks sharing a fresh batch id.
    ///
    /// Every request is validated before the first task is stored, so an
    /// invalid member leaves nothing behind.
    pub async fn create_batch(&self, requests: Vec<NewTask>) -> Result<Vec<Task>> {
        let mut prepared = Vec::with_capacity(requests.len());
        for request in requests {
            prepared.push(self.prepare(request).await?);
        }

        let batch = uuid::Uuid::new_v4().to_string();
        let tasks: Vec<Task> = prepared
            .iter()
            .map(|request| Task::from_request(request, Some(batch.clone()), SOURCE_API))
            .collect();

        // Members finishing early wait here until the whole batch exists
        let _guard = self.batch_lock.lock().await;
        for task in &tasks {
            self.insert(task).await?;
        }

        info!(batch = %batch, count = tasks.len(), "New batch added to queue");
        self.notifier.notify(EngineEvent::BatchCreated(tasks.clone()));
        Ok(tasks)
    }

    /// Apply the preset and check the request can become a task.
    async fn prepare(&self, mut request: NewTask) -> Result<NewTask> {
        if !request.preset.is_empty() {
            let preset = self.presets.get_preset(&request.preset).await?;
            preset.apply_to(&mut request);
        }
        if request.command.trim().is_empty() {
            return Err(Error::validation("task has no command"));
        }
        Ok(request)
    }

    async fn insert(&self, task: &Task) -> Result<()> {
        self.store.create_task(task).await?;
        self.notifier.notify(EngineEvent::TaskCreated(task.clone()));
        info!(task_id = %task.id, source = %task.source, "New task added to queue");
        Ok(())
    }

    /// Persist a task and report the change.
    pub async fn update_task(&self, task: &Task) -> Result<()> {
        self.persist(task, None).await.map(|_| ())
    }

    /// Persist a task only if the stored copy is still in `expected` status.
    ///
    /// Returns `false`, without side effects, when another writer won.
    pub async fn update_task_if_status(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        self.persist(task, Some(expected)).await
    }

    async fn persist(&self, task: &Task, expected: Option<TaskStatus>) -> Result<bool> {
        let finishing_batch = task
            .batch
            .as_deref()
            .filter(|_| task.status.is_terminal());
        let _guard = match finishing_batch {
            Some(_) => Some(self.batch_lock.lock().await),
            None => None,
        };

        let saved = match expected {
            Some(expected) => self.store.save_task_if_status(task, expected).await?,
            None => {
                self.store.save_task(task).await?;
                true
            }
        };
        if !saved {
            return Ok(false);
        }

        self.notifier.notify(EngineEvent::TaskUpdated(task.clone()));

        if let Some(batch) = finishing_batch {
            if self.store.count_non_terminal_in_batch(batch).await? == 0 {
                info!(batch = %batch, "Batch finished");
                self.notifier.notify(EngineEvent::BatchFinished(task.clone()));
            }
        }
        Ok(true)
    }

    /// Cancel a task.
    ///
    /// A queued task is canceled right away. For a task that is already
    /// executing a request is handed to the scheduler and the current snapshot
    /// is returned; the task reaches `DONE_CANCELED` once the pipeline observes
    /// the request.
    pub async fn cancel_task(&self, id: &str) -> Result<Task> {
        let mut task = self.store.get_task(id).await?;

        if task.status == TaskStatus::Queued {
            let mut canceled = task.clone();
            canceled.finish(TaskStatus::DoneCanceled, Some(CANCELED_BY_USER.to_string()))?;
            if self
                .update_task_if_status(&canceled, TaskStatus::Queued)
                .await?
            {
                info!(task_id = %id, "Canceled queued task");
                return Ok(canceled);
            }
            // The scheduler claimed it in the meantime
            debug!(task_id = %id, "Queued task was dispatched concurrently, requesting cancellation");
            task = self.store.get_task(id).await?;
        }

        match task.status {
            TaskStatus::PreProcessing | TaskStatus::Running => {
                self.request_cancel(id);
                Ok(task)
            }
            status => Err(Error::validation(format!(
                "failed to cancel task, task in unsupported state '{}'",
                status
            ))),
        }
    }

    fn request_cancel(&self, id: &str) {
        if self.cancel_tx.send(id.to_string()).is_err() {
            warn!(task_id = %id, "Scheduler is not running, cancellation request dropped");
        }
    }

    /// Put a finished task back into the queue.
    pub async fn restart_task(&self, id: &str) -> Result<Task> {
        let mut task = self.store.get_task(id).await?;
        if task.status == TaskStatus::Queued {
            return Err(Error::validation(
                "failed to restart task, task is already in status 'QUEUED'",
            ));
        }
        if !task.status.is_terminal() {
            return Err(Error::validation(
                "failed to restart task, task is still executing",
            ));
        }

        task.restart()?;
        self.update_task(&task).await?;
        info!(task_id = %id, "Task restarted");
        Ok(task)
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let task = self.store.get_task(id).await?;
        if task.status.is_executing() {
            return Err(Error::validation(
                "running tasks can not be deleted, cancel first",
            ));
        }

        self.store.delete_task(id).await?;
        self.notifier.notify(EngineEvent::TaskDeleted(task));
        info!(task_id = %id, "Deleted task");
        Ok(())
    }

    /// Number of tasks per status.
    pub async fn status_counts(&self) -> Result<HashMap<TaskStatus, usize>> {
        self.store.count_by_status().await
    }
}
