//! Wiring of services, scheduler and watchfolder monitor.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::notify::EventNotifier;
use crate::pipeline::{ExecutionPipeline, TaskExecutor};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::service::{CancelRequestReceiver, TaskService, WatchfolderService};
use crate::store::{JobStore, PresetStore, WatchfolderStore};
use crate::transcoder::Transcoder;
use crate::watchfolder::WatchfolderMonitor;

/// Store collaborators of the engine.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub presets: Arc<dyn PresetStore>,
    pub watchfolders: Arc<dyn WatchfolderStore>,
}

impl Stores {
    /// Use one backend for every record type.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: JobStore + PresetStore + WatchfolderStore + 'static,
    {
        Self {
            jobs: store.clone(),
            presets: store.clone(),
            watchfolders: store,
        }
    }
}

/// The task orchestration engine.
pub struct Engine {
    tasks: Arc<TaskService>,
    watchfolders: Arc<WatchfolderService>,
    scheduler: Scheduler,
    monitor: WatchfolderMonitor,
    cancel_requests: Mutex<Option<CancelRequestReceiver>>,
}

impl Engine {
    /// Build an engine running tasks through the transcoder configured in `config`.
    pub fn new(config: &EngineConfig, stores: Stores, notifier: Arc<dyn EventNotifier>) -> Self {
        let transcoder = Transcoder::new(&config.ffmpeg_path);
        Self::with_executor(
            config.scheduler(),
            stores,
            notifier,
            |tasks| -> Arc<dyn TaskExecutor> {
                Arc::new(ExecutionPipeline::new(tasks, transcoder))
            },
        )
    }

    /// Build an engine with a custom executor.
    pub fn with_executor(
        scheduler: SchedulerConfig,
        stores: Stores,
        notifier: Arc<dyn EventNotifier>,
        executor: impl FnOnce(Arc<TaskService>) -> Arc<dyn TaskExecutor>,
    ) -> Self {
        let (tasks, cancel_requests) =
            TaskService::new(stores.jobs, stores.presets.clone(), notifier.clone());
        let tasks = Arc::new(tasks);
        let watchfolders = Arc::new(WatchfolderService::new(
            stores.watchfolders,
            stores.presets,
            notifier,
        ));

        Self {
            scheduler: Scheduler::new(scheduler, tasks.clone(), executor(tasks.clone())),
            monitor: WatchfolderMonitor::new(tasks.clone(), watchfolders.clone()),
            tasks,
            watchfolders,
            cancel_requests: Mutex::new(Some(cancel_requests)),
        }
    }

    pub fn tasks(&self) -> &Arc<TaskService> {
        &self.tasks
    }

    pub fn watchfolders(&self) -> &Arc<WatchfolderService> {
        &self.watchfolders
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn monitor(&self) -> &WatchfolderMonitor {
        &self.monitor
    }

    /// Start dispatching tasks and watching folders.
    pub fn start(&self) {
        let Some(cancel_requests) = self.cancel_requests.lock().take() else {
            warn!("Engine already started");
            return;
        };
        self.scheduler.start(cancel_requests);
        self.monitor.start();
        info!("Engine started");
    }

    /// Stop watching folders, then cancel and drain in-flight tasks.
    pub async fn stop(&self) {
        self.monitor.stop().await;
        self.scheduler.stop().await;
        info!("Engine stopped");
    }
}
