//! Polling scheduler.
//!
//! The dispatch loop keeps up to `max_concurrent` tasks in flight. Each
//! dispatched task owns a [`CancelHandle`] registered in the in-flight map
//! until its pipeline returns. A second loop turns cancellation requests into
//! handle cancellations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{Task, TaskStatus, now_millis};
use crate::pipeline::{CancelHandle, TaskExecutor};
use crate::service::{CANCELED_BY_USER, CancelRequestReceiver, TaskService};

/// Cause recorded on tasks interrupted by [`Scheduler::stop`].
pub const SHUTTING_DOWN: &str = "engine shutting down";

/// Configuration for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of tasks executing at once.
    pub max_concurrent: usize,
    /// Delay between two polls when nothing can be dispatched.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval: Duration::from_secs(1),
        }
    }
}

type RunningMap = Arc<Mutex<HashMap<String, CancelHandle>>>;

/// Removes a task from the in-flight map when its pipeline finishes, even on panic.
struct RunningGuard {
    running: RunningMap,
    task_id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.lock().remove(&self.task_id);
    }
}

struct Dispatcher {
    config: SchedulerConfig,
    tasks: Arc<TaskService>,
    executor: Arc<dyn TaskExecutor>,
    running: RunningMap,
}

impl Dispatcher {
    fn has_free_slot(&self) -> bool {
        self.running.lock().len() < self.config.max_concurrent
    }

    /// Dispatch eligible tasks until the ceiling is reached or the queue is empty.
    async fn fill_slots(&self, pipelines: &mut JoinSet<()>) {
        while self.has_free_slot() {
            let task = match self.tasks.store().next_eligible().await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    debug!("No queued tasks found");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Failed to fetch next queued task");
                    return;
                }
            };

            let task_id = task.id.clone();
            match self.claim(task).await {
                Ok(Some((claimed, handle))) => {
                    info!(task_id = %task_id, status = %claimed.status, "Dispatching task");
                    let executor = self.executor.clone();
                    let guard = RunningGuard {
                        running: self.running.clone(),
                        task_id,
                    };
                    pipelines.spawn(async move {
                        let _guard = guard;
                        executor.execute(claimed, handle).await;
                    });
                }
                Ok(None) => {
                    debug!(task_id = %task_id, "Task was no longer queued, skipping");
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Failed to claim task");
                    return;
                }
            }
        }

        if !self.has_free_slot() {
            debug!(
                "Maximum concurrent tasks reached ({}/{})",
                self.running.lock().len(),
                self.config.max_concurrent
            );
        }
    }

    /// Register a handle and move the task out of `QUEUED`.
    ///
    /// The handle is registered first so a cancellation request arriving right
    /// after the claim always finds it.
    async fn claim(&self, task: Task) -> crate::Result<Option<(Task, CancelHandle)>> {
        let handle = CancelHandle::new();
        self.running.lock().insert(task.id.clone(), handle.clone());

        let mut claimed = task;
        let result = match claimed.transition_to(claimed.dispatch_status()) {
            Ok(()) => {
                claimed.started_at = now_millis();
                self.tasks
                    .update_task_if_status(&claimed, TaskStatus::Queued)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(true) => Ok(Some((claimed, handle))),
            Ok(false) => {
                self.running.lock().remove(&claimed.id);
                Ok(None)
            }
            Err(e) => {
                self.running.lock().remove(&claimed.id);
                Err(e)
            }
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut pipelines = JoinSet::new();

        loop {
            if token.is_cancelled() {
                break;
            }
            self.fill_slots(&mut pipelines).await;

            tokio::select! {
                _ = token.cancelled() => break,
                Some(result) = pipelines.join_next(), if !pipelines.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("Task pipeline panicked: {}", e);
                        }
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        let in_flight: Vec<CancelHandle> = self.running.lock().values().cloned().collect();
        if !in_flight.is_empty() {
            info!("Canceling {} in-flight tasks", in_flight.len());
        }
        for handle in in_flight {
            handle.cancel(SHUTTING_DOWN);
        }
        while pipelines.join_next().await.is_some() {}
        debug!("Dispatch loop stopped");
    }
}

fn cancel_in_flight(running: &RunningMap, task_id: &str, cause: &str) -> bool {
    match running.lock().get(task_id) {
        Some(handle) => {
            handle.cancel(cause);
            true
        }
        None => false,
    }
}

async fn consume_cancel_requests(
    running: RunningMap,
    mut requests: CancelRequestReceiver,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            request = requests.recv() => {
                let Some(task_id) = request else { break };
                if cancel_in_flight(&running, &task_id, CANCELED_BY_USER) {
                    info!(task_id = %task_id, "Cancellation requested");
                } else {
                    warn!(task_id = %task_id, "Task not found to cancel");
                }
            }
        }
    }
    debug!("Cancellation loop stopped");
}

/// Dispatches queued tasks to a [`TaskExecutor`].
pub struct Scheduler {
    dispatcher: Arc<Dispatcher>,
    cancellation_token: CancellationToken,
    loops: Mutex<Option<JoinSet<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        tasks: Arc<TaskService>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                config,
                tasks,
                executor,
                running: Arc::new(Mutex::new(HashMap::new())),
            }),
            cancellation_token: CancellationToken::new(),
            loops: Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the dispatch and cancellation loops.
    pub fn start(&self, cancel_requests: CancelRequestReceiver) {
        let mut loops = self.loops.lock();
        let Some(join_set) = loops.as_mut() else {
            warn!("Scheduler already stopped, not starting");
            return;
        };
        if !join_set.is_empty() {
            warn!("Scheduler already started");
            return;
        }

        info!(
            "Starting scheduler with {} max concurrent tasks",
            self.dispatcher.config.max_concurrent
        );
        join_set.spawn(
            self.dispatcher
                .clone()
                .run(self.cancellation_token.clone()),
        );
        join_set.spawn(consume_cancel_requests(
            self.dispatcher.running.clone(),
            cancel_requests,
            self.cancellation_token.clone(),
        ));
    }

    /// Stop both loops, cancel every in-flight task and wait for their pipelines.
    pub async fn stop(&self) {
        info!("Stopping scheduler");
        self.cancellation_token.cancel();

        let join_set = self.loops.lock().take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Scheduler stopped");
    }

    /// Cancel an in-flight task directly. Returns `false` for unknown ids.
    pub fn cancel(&self, task_id: &str) -> bool {
        cancel_in_flight(&self.dispatcher.running, task_id, CANCELED_BY_USER)
    }

    /// Number of tasks currently holding an execution slot.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.running.lock().len()
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
