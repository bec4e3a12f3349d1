//! Watchfolder monitor.
//!
//! A supervisor keeps one polling loop per active watchfolder. Loops walk their
//! directory every `interval` seconds and turn files whose size has settled
//! into tasks. Any change to a watchfolder stops its loop, waits for it to
//! exit, and starts a fresh one if the folder is still active.

mod growth;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::domain::{ExtensionFilter, NewTask, Watchfolder, now_millis};
use crate::service::{TaskService, WatchfolderChange, WatchfolderService};

pub use growth::GrowthTracker;

/// Source tag of tasks created by watchfolders.
pub const SOURCE_WATCHFOLDER: &str = "watchfolder";

const MIN_INTERVAL_SECS: u64 = 1;

/// Files found by one walk, with their sizes.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<(PathBuf, u64)>,
    /// First error hit while walking, if any.
    pub error: Option<String>,
}

/// Walk `root` and collect the candidate files.
///
/// Directories, dotfiles and files rejected by `filter` are skipped. Errors do
/// not abort the walk; the first one is reported.
pub fn scan_directory(root: &Path, filter: &ExtensionFilter) -> ScanResult {
    let mut result = ScanResult::default();

    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                result.error.get_or_insert_with(|| e.to_string());
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if !filter.accepts(entry.path()) {
            continue;
        }
        match entry.metadata() {
            Ok(metadata) => result.files.push((entry.into_path(), metadata.len())),
            Err(e) => {
                result.error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    result
}

/// Polling loop of a single watchfolder.
struct FolderWatcher {
    watchfolder: Watchfolder,
    tasks: Arc<TaskService>,
    folders: Arc<WatchfolderService>,
    tracker: GrowthTracker,
}

impl FolderWatcher {
    async fn run(mut self, token: CancellationToken) {
        let id = self.watchfolder.id.clone();
        let interval = Duration::from_secs(self.watchfolder.interval.max(MIN_INTERVAL_SECS));
        info!(watchfolder_id = %id, path = %self.watchfolder.path, "Started watchfolder");

        loop {
            let checked_at = now_millis();
            let root = PathBuf::from(&self.watchfolder.path);
            let filter = self.watchfolder.filter.extensions.clone();
            let walk = tokio::task::spawn_blocking(move || scan_directory(&root, &filter));

            let scan = tokio::select! {
                _ = token.cancelled() => break,
                result = walk => match result {
                    Ok(scan) => scan,
                    Err(e) => ScanResult {
                        error: Some(format!("directory walk aborted: {}", e)),
                        ..Default::default()
                    },
                },
            };
            if token.is_cancelled() {
                break;
            }

            if let Some(e) = &scan.error {
                error!(watchfolder_id = %id, error = %e, "Walking watchfolder directory failed");
            }

            let ready = self
                .tracker
                .poll(&scan.files, self.watchfolder.growth_checks);
            for path in ready {
                self.create_task(&path).await;
            }
            debug!(
                watchfolder_id = %id,
                files = scan.files.len(),
                pending = self.tracker.pending(),
                "Processed watchfolder"
            );

            if let Err(e) = self.folders.record_check(&id, checked_at, scan.error).await {
                error!(watchfolder_id = %id, error = %e, "Failed to record watchfolder check");
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!(watchfolder_id = %id, "Stopped watchfolder");
    }

    async fn create_task(&self, path: &Path) {
        let request = NewTask {
            preset: self.watchfolder.preset.clone(),
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            input_file: path.to_string_lossy().into_owned(),
            ..Default::default()
        };

        match self
            .tasks
            .create_task(request, None, SOURCE_WATCHFOLDER)
            .await
        {
            Ok(task) => debug!(
                watchfolder_id = %self.watchfolder.id,
                task_id = %task.id,
                file = %path.display(),
                "Created task for watchfolder file"
            ),
            Err(e) => error!(
                watchfolder_id = %self.watchfolder.id,
                file = %path.display(),
                error = %e,
                "Failed to create task for watchfolder file"
            ),
        }
    }
}

struct FolderLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

type LoopMap = Arc<Mutex<HashMap<String, FolderLoop>>>;

struct Supervisor {
    tasks: Arc<TaskService>,
    folders: Arc<WatchfolderService>,
    loops: LoopMap,
}

impl Supervisor {
    async fn run(self, mut changes: broadcast::Receiver<WatchfolderChange>, token: CancellationToken) {
        self.start_active().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => self.apply(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Missed {} watchfolder changes, restarting all watchfolders", skipped);
                        self.stop_all().await;
                        self.start_active().await;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.stop_all().await;
    }

    async fn start_active(&self) {
        match self.folders.list_active().await {
            Ok(active) => {
                debug!("Initializing {} watchfolders", active.len());
                for watchfolder in active {
                    self.spawn(watchfolder);
                }
            }
            Err(e) => error!(error = %e, "Failed to list watchfolders"),
        }
    }

    fn spawn(&self, watchfolder: Watchfolder) {
        let token = CancellationToken::new();
        let id = watchfolder.id.clone();
        let watcher = FolderWatcher {
            watchfolder,
            tasks: self.tasks.clone(),
            folders: self.folders.clone(),
            tracker: GrowthTracker::new(),
        };
        let handle = tokio::spawn(watcher.run(token.clone()));
        self.loops.lock().insert(id, FolderLoop { token, handle });
    }

    async fn apply(&self, change: WatchfolderChange) {
        let watchfolder = change.watchfolder().clone();
        self.stop(&watchfolder.id).await;
        if watchfolder.is_active() {
            self.spawn(watchfolder);
        } else {
            debug!(watchfolder_id = %watchfolder.id, "Watchfolder inactive, not restarting");
        }
    }

    async fn stop(&self, id: &str) {
        let running = self.loops.lock().remove(id);
        if let Some(running) = running {
            running.token.cancel();
            if let Err(e) = running.handle.await {
                error!(watchfolder_id = %id, "Watchfolder loop failed: {}", e);
            }
        }
    }

    async fn stop_all(&self) {
        let running: Vec<FolderLoop> = self.loops.lock().drain().map(|(_, l)| l).collect();
        for folder_loop in &running {
            folder_loop.token.cancel();
        }
        for result in join_all(running.into_iter().map(|l| l.handle)).await {
            if let Err(e) = result {
                error!("Watchfolder loop failed: {}", e);
            }
        }
    }
}

/// Supervises the polling loops of all watchfolders.
pub struct WatchfolderMonitor {
    tasks: Arc<TaskService>,
    folders: Arc<WatchfolderService>,
    loops: LoopMap,
    cancellation_token: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WatchfolderMonitor {
    pub fn new(tasks: Arc<TaskService>, folders: Arc<WatchfolderService>) -> Self {
        Self {
            tasks,
            folders,
            loops: Arc::new(Mutex::new(HashMap::new())),
            cancellation_token: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    /// Start a loop per active watchfolder and follow watchfolder changes.
    pub fn start(&self) {
        let mut supervisor = self.supervisor.lock();
        if supervisor.is_some() {
            warn!("Watchfolder monitor already started");
            return;
        }

        // Subscribe before listing so no change slips in between
        let changes = self.folders.subscribe();
        let task = Supervisor {
            tasks: self.tasks.clone(),
            folders: self.folders.clone(),
            loops: self.loops.clone(),
        };
        *supervisor = Some(tokio::spawn(
            task.run(changes, self.cancellation_token.clone()),
        ));
        info!("Watchfolder monitor started");
    }

    /// Stop every loop and wait for them to exit.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        let supervisor = self.supervisor.lock().take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!("Watchfolder supervisor failed: {}", e);
            }
        }
        info!("Watchfolder monitor stopped");
    }

    /// Ids of watchfolders with a running loop.
    pub fn watching(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.loops.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
