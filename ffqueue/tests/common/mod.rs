//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ffqueue::domain::{NewTask, Task, TaskStatus};
use ffqueue::notify::{BroadcastNotifier, EngineEvent};
use ffqueue::pipeline::{CancelHandle, TaskExecutor};
use ffqueue::scheduler::SchedulerConfig;
use ffqueue::service::TaskService;
use ffqueue::store::MemoryStore;
use ffqueue::{Engine, Stores};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// How the fake executor ends a task.
#[derive(Debug, Clone, Copy)]
pub enum Behaviour {
    /// Succeed after the delay unless canceled first.
    SucceedAfter(Duration),
    /// Only finish when canceled.
    WaitForCancel,
}

/// Executor recording dispatch order and peak concurrency.
pub struct FakeExecutor {
    tasks: Arc<TaskService>,
    behaviour: Behaviour,
    pub order: Mutex<Vec<String>>,
    active: AtomicUsize,
    pub peak: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(tasks: Arc<TaskService>, behaviour: Behaviour) -> Self {
        Self {
            tasks,
            behaviour,
            order: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for FakeExecutor {
    async fn execute(&self, mut task: Task, cancel: CancelHandle) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        self.order.lock().push(task.name.clone());

        let canceled = match self.behaviour {
            Behaviour::SucceedAfter(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = cancel.token().cancelled() => true,
            },
            Behaviour::WaitForCancel => {
                cancel.token().cancelled().await;
                true
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        if canceled {
            task.finish(
                TaskStatus::DoneCanceled,
                cancel.cause().map(str::to_string),
            )
            .unwrap();
        } else {
            task.finish(TaskStatus::DoneSuccessful, None).unwrap();
        }
        self.tasks.update_task(&task).await.unwrap();
    }
}

pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<MemoryStore>,
    pub executor: Arc<FakeExecutor>,
    pub events: broadcast::Receiver<EngineEvent>,
}

/// Engine backed by the in-memory store and a [`FakeExecutor`].
pub fn fake_engine(max_concurrent: usize, behaviour: Behaviour) -> TestEngine {
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(BroadcastNotifier::with_capacity(4096));
    let events = notifier.subscribe();

    let executor_slot: Arc<Mutex<Option<Arc<FakeExecutor>>>> = Arc::new(Mutex::new(None));
    let slot = executor_slot.clone();
    let engine = Engine::with_executor(
        SchedulerConfig {
            max_concurrent,
            poll_interval: Duration::from_millis(5),
        },
        Stores::shared(store.clone()),
        notifier,
        move |tasks| -> Arc<dyn TaskExecutor> {
            let executor = Arc::new(FakeExecutor::new(tasks, behaviour));
            *slot.lock() = Some(executor.clone());
            executor
        },
    );
    let executor = executor_slot.lock().take().unwrap();

    TestEngine {
        engine,
        store,
        executor,
        events,
    }
}

pub fn named_task(name: &str, priority: u32) -> NewTask {
    NewTask {
        command: "-i ${INPUT_FILE} ${OUTPUT_FILE}".to_string(),
        name: name.to_string(),
        input_file: format!("/in/{name}.mp4"),
        output_file: format!("/out/{name}.mp4"),
        priority,
        ..Default::default()
    }
}

/// Poll `check` until it yields a value or the timeout expires.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drain every event currently buffered on `events`.
pub fn drain(events: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
