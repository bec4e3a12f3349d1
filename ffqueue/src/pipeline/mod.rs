//! Execution pipeline: drives one claimed task through
//! pre-processing, transcoding and post-processing to a terminal state.
//!
//! Every status change is persisted through [`TaskService::update_task`]
//! before the next phase starts. Progress reported by the transcoder is
//! coalesced so that at most one progress write happens per flush interval.

mod cancel;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use process_utils::{Dialect, split_command_line, tokio_command};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::domain::{PrePostProcessing, REMAINING_UNKNOWN, Task, TaskStatus, now_millis};
use crate::placeholder::{PathEscaping, resolve};
use crate::service::{CANCELED_BY_USER, TaskService};
use crate::transcoder::{TranscodeProgress, Transcoder};
use crate::{Error, Result};

pub use cancel::CancelHandle;

/// Minimum delay between two persisted progress updates.
pub const PROGRESS_FLUSH_INTERVAL_MS: u64 = 250;

/// Runs a claimed task to completion.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `task`, which has already been claimed and persisted in its
    /// dispatch status. Must leave the task in a terminal state.
    async fn execute(&self, task: Task, cancel: CancelHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseKind {
    Pre,
    Post,
}

impl PhaseKind {
    fn label(self) -> &'static str {
        match self {
            Self::Pre => "PreProcessing",
            Self::Post => "PostProcessing",
        }
    }

    fn status(self) -> TaskStatus {
        match self {
            Self::Pre => TaskStatus::PreProcessing,
            Self::Post => TaskStatus::PostProcessing,
        }
    }

    fn get(self, task: &Task) -> Option<&PrePostProcessing> {
        match self {
            Self::Pre => task.pre_processing.as_ref(),
            Self::Post => task.post_processing.as_ref(),
        }
    }

    fn get_mut(self, task: &mut Task) -> Option<&mut PrePostProcessing> {
        match self {
            Self::Pre => task.pre_processing.as_mut(),
            Self::Post => task.post_processing.as_mut(),
        }
    }

    /// Pre-processing sees the raw paths, post-processing the resolved ones.
    fn paths(self, task: &Task) -> (String, String) {
        match self {
            Self::Pre => (task.input_file.raw.clone(), task.output_file.raw.clone()),
            Self::Post => (
                task.input_file.resolved.clone(),
                task.output_file.resolved.clone(),
            ),
        }
    }
}

/// How a task run ended.
enum Outcome {
    Succeeded,
    Failed(String),
    Canceled(String),
}

/// The default [`TaskExecutor`].
pub struct ExecutionPipeline {
    tasks: Arc<TaskService>,
    transcoder: Transcoder,
    progress_flush: Duration,
}

impl ExecutionPipeline {
    pub fn new(tasks: Arc<TaskService>, transcoder: Transcoder) -> Self {
        Self {
            tasks,
            transcoder,
            progress_flush: Duration::from_millis(PROGRESS_FLUSH_INTERVAL_MS),
        }
    }

    pub fn with_progress_flush_interval(mut self, interval: Duration) -> Self {
        self.progress_flush = interval;
        self
    }

    async fn run(&self, task: &mut Task, cancel: &CancelHandle) -> Result<Outcome> {
        if task.has_pre_processing() {
            if let Err(e) = self.run_phase(task, PhaseKind::Pre).await {
                return Ok(Outcome::Failed(phase_failure(PhaseKind::Pre, e)));
            }
        }

        task.input_file.resolved = resolve(
            &task.input_file.raw,
            &task.input_file.raw,
            &task.output_file.raw,
            &task.source,
            PathEscaping::Verbatim,
        );
        task.output_file.resolved = resolve(
            &task.output_file.raw,
            &task.input_file.raw,
            &task.output_file.raw,
            &task.source,
            PathEscaping::Verbatim,
        );
        task.command.resolved = resolve(
            &task.command.raw,
            &task.input_file.resolved,
            &task.output_file.resolved,
            &task.source,
            PathEscaping::CommandLine,
        );
        task.transition_to(TaskStatus::Running)?;
        self.persist(task).await;

        if cancel.is_cancelled() {
            return Ok(Outcome::Canceled(cancel_cause(cancel)));
        }

        info!(task_id = %task.id, "Starting transcode");
        let command = task.command.resolved.clone();
        if let Err(e) = self.transcode(task, &command, cancel).await {
            if cancel.is_cancelled() {
                return Ok(Outcome::Canceled(cancel_cause(cancel)));
            }
            return Ok(Outcome::Failed(e.to_string()));
        }
        info!(task_id = %task.id, "Finished transcode");

        task.progress = 100.0;
        task.remaining = REMAINING_UNKNOWN;

        if task.has_post_processing() {
            if let Err(e) = self.run_phase(task, PhaseKind::Post).await {
                return Ok(Outcome::Failed(phase_failure(PhaseKind::Post, e)));
            }
        }

        Ok(Outcome::Succeeded)
    }

    /// Run the transcoder while flushing the latest progress on a fixed cadence.
    async fn transcode(&self, task: &mut Task, command: &str, cancel: &CancelHandle) -> Result<()> {
        let (progress_tx, mut progress_rx) = watch::channel(None::<TranscodeProgress>);
        let on_progress = move |progress: TranscodeProgress| {
            progress_tx.send_replace(Some(progress));
        };

        let run = self.transcoder.run(command, cancel.token(), &on_progress);
        tokio::pin!(run);

        let mut flush = tokio::time::interval(self.progress_flush);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = flush.tick() => {
                    if !progress_rx.has_changed().unwrap_or(false) {
                        continue;
                    }
                    let latest = *progress_rx.borrow_and_update();
                    if let Some(progress) = latest {
                        apply_progress(task, progress);
                        self.persist(task).await;
                    }
                }
            }
        };

        // Keep the newest value even if it never made it to a flush
        if progress_rx.has_changed().unwrap_or(false) {
            if let Some(progress) = *progress_rx.borrow_and_update() {
                apply_progress(task, progress);
            }
        }
        result
    }

    async fn run_phase(&self, task: &mut Task, kind: PhaseKind) -> Result<()> {
        info!(task_id = %task.id, "Starting {}", kind.label());
        task.transition_to(kind.status())?;
        if let Some(phase) = kind.get_mut(task) {
            phase.started_at = now_millis();
            phase.error.clear();
        }
        self.persist(task).await;

        let result = self.run_phase_steps(task, kind).await;

        if let Some(phase) = kind.get_mut(task) {
            phase.finished_at = now_millis();
            if let Err(e) = &result {
                phase.error = e.to_string();
            }
        }
        match &result {
            Ok(()) => info!(task_id = %task.id, "Finished {}", kind.label()),
            Err(e) => warn!(task_id = %task.id, error = %e, "Finished {} with error", kind.label()),
        }
        result
    }

    async fn run_phase_steps(&self, task: &mut Task, kind: PhaseKind) -> Result<()> {
        let (input, output) = kind.paths(task);
        let raw_template = |path: Option<&crate::domain::RawResolved>| {
            path.map(|p| p.raw.clone()).filter(|raw| !raw.is_empty())
        };
        let (sidecar, script) = match kind.get(task) {
            Some(phase) => (
                raw_template(phase.sidecar_path.as_ref()),
                raw_template(phase.script_path.as_ref()),
            ),
            None => return Ok(()),
        };

        if let Some(raw) = sidecar {
            let path = resolve(&raw, &input, &output, &task.source, PathEscaping::Verbatim);
            if let Some(sidecar) = kind.get_mut(task).and_then(|p| p.sidecar_path.as_mut()) {
                sidecar.resolved = path.clone();
            }
            self.persist(task).await;
            write_sidecar(task, Path::new(&path)).await?;
            debug!(task_id = %task.id, path = %path, "Wrote sidecar file");
        }

        if let Some(raw) = script {
            let line = resolve(&raw, &input, &output, &task.source, PathEscaping::CommandLine);
            if let Some(script) = kind.get_mut(task).and_then(|p| p.script_path.as_mut()) {
                script.resolved = line.clone();
            }
            self.persist(task).await;
            run_script(&task.id, &line).await?;
        }

        Ok(())
    }

    async fn persist(&self, task: &Task) {
        if let Err(e) = self.tasks.update_task(task).await {
            error!(task_id = %task.id, error = %e, "Failed to persist task");
        }
    }

    async fn finish(&self, task: &mut Task, outcome: Outcome) {
        let (target, error) = match outcome {
            Outcome::Succeeded => (TaskStatus::DoneSuccessful, None),
            Outcome::Failed(e) => (TaskStatus::DoneError, Some(e)),
            Outcome::Canceled(cause) => (TaskStatus::DoneCanceled, Some(cause)),
        };

        if let Err(e) = task.finish(target, error) {
            error!(task_id = %task.id, error = %e, "Cannot finish task");
            return;
        }
        self.persist(task).await;

        match task.status {
            TaskStatus::DoneSuccessful => info!(task_id = %task.id, "Task successful"),
            TaskStatus::DoneCanceled => warn!(task_id = %task.id, cause = %task.error, "Task canceled"),
            _ => warn!(task_id = %task.id, "Task failed:\n{}", task.error),
        }
    }
}

#[async_trait]
impl TaskExecutor for ExecutionPipeline {
    async fn execute(&self, mut task: Task, cancel: CancelHandle) {
        info!(task_id = %task.id, "Processing task");

        let outcome = match self.run(&mut task, &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::Failed(e.to_string()),
        };
        self.finish(&mut task, outcome).await;
    }
}

fn apply_progress(task: &mut Task, progress: TranscodeProgress) {
    task.progress = progress.percent;
    task.remaining = progress.remaining;
}

fn cancel_cause(cancel: &CancelHandle) -> String {
    cancel.cause().unwrap_or(CANCELED_BY_USER).to_string()
}

fn phase_failure(kind: PhaseKind, error: Error) -> String {
    Error::Phase {
        phase: kind.label(),
        message: error.to_string(),
    }
    .to_string()
}

/// Write the task as JSON to `path`.
async fn write_sidecar(task: &Task, path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(task)?;
    tokio::fs::write(path, json)
        .await
        .map_err(|e| Error::io_path("writing sidecar", path, e))
}

/// Run a pre/post-processing script to completion.
async fn run_script(task_id: &str, line: &str) -> Result<()> {
    let args = split_command_line(line, Dialect::native())?;
    let (program, rest) = args
        .split_first()
        .ok_or_else(|| Error::Process("script command line is empty".to_string()))?;

    debug!(task_id = %task_id, program = %program, "Running script");
    let output = tokio_command(program)
        .args(rest)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Process(format!("failed to start script {}: {}", program, e)))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(task_id = %task_id, "stdout: {}", line);
    }

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        Err(Error::Process(format!("script exited with {}", output.status)))
    } else {
        Err(Error::Process(stderr))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{NewPrePostProcessing, NewTask};
    use crate::notify::BroadcastNotifier;
    use crate::service::SOURCE_API;
    use crate::store::{JobStore, MemoryStore};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    struct Harness {
        _dir: TempDir,
        dir: std::path::PathBuf,
        store: Arc<MemoryStore>,
        service: Arc<TaskService>,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (service, _cancel_rx) = TaskService::new(
            store.clone(),
            store.clone(),
            Arc::new(BroadcastNotifier::new()),
        );
        Harness {
            dir: dir.path().to_path_buf(),
            _dir: dir,
            store,
            service: Arc::new(service),
        }
    }

    impl Harness {
        fn pipeline(&self, transcoder_body: &str) -> ExecutionPipeline {
            let binary = write_script(&self.dir, "transcoder", transcoder_body);
            ExecutionPipeline::new(self.service.clone(), Transcoder::new(binary))
                .with_progress_flush_interval(Duration::from_millis(10))
        }

        async fn claimed(&self, request: NewTask) -> Task {
            let mut task = self
                .service
                .create_task(request, None, SOURCE_API)
                .await
                .unwrap();
            task.transition_to(task.dispatch_status()).unwrap();
            task.started_at = now_millis();
            self.service.update_task(&task).await.unwrap();
            task
        }
    }

    fn request(dir: &Path) -> NewTask {
        NewTask {
            command: "-i ${INPUT_FILE} ${OUTPUT_FILE}".into(),
            input_file: dir.join("in.mp4").to_string_lossy().into_owned(),
            output_file: dir.join("out.mp4").to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_failing_transcoder_records_transcript() {
        let h = harness();
        let pipeline = h.pipeline("echo 'in.mp4: No such file or directory' >&2\nexit 1");
        let task = h.claimed(request(&h.dir)).await;

        pipeline.execute(task.clone(), CancelHandle::new()).await;

        let stored = h.store.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::DoneError);
        assert!(stored.error.contains("No such file or directory"));
        assert_eq!(stored.progress, 100.0);
        assert_eq!(stored.remaining, REMAINING_UNKNOWN);
    }

    #[tokio::test]
    async fn test_pre_processing_failure_skips_transcode() {
        let h = harness();
        let marker = h.dir.join("transcoder-ran");
        let pipeline = h.pipeline(&format!("touch '{}'", marker.display()));
        let failing = write_script(&h.dir, "pre.sh", "echo 'not allowed' >&2\nexit 3");

        let mut req = request(&h.dir);
        req.pre_processing = Some(NewPrePostProcessing {
            script_path: failing,
            sidecar_path: String::new(),
        });
        let task = h.claimed(req).await;
        assert_eq!(task.status, TaskStatus::PreProcessing);

        pipeline.execute(task.clone(), CancelHandle::new()).await;

        let stored = h.store.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::DoneError);
        assert_eq!(stored.error, "PreProcessing failed: Process error: not allowed");
        let pre = stored.pre_processing.unwrap();
        assert!(pre.finished_at >= pre.started_at && pre.started_at > 0);
        assert!(!pre.error.is_empty());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_sidecars_and_post_processing() {
        let h = harness();
        let pipeline = h.pipeline("exit 0");
        let post_marker = h.dir.join("post.txt");
        let post = write_script(
            &h.dir,
            "post.sh",
            &format!("echo \"$1\" > '{}'", post_marker.display()),
        );

        let mut req = request(&h.dir);
        req.pre_processing = Some(NewPrePostProcessing {
            script_path: String::new(),
            sidecar_path: "${INPUT_FILE}.json".into(),
        });
        req.post_processing = Some(NewPrePostProcessing {
            script_path: format!("{post} ${{OUTPUT_FILE}}"),
            sidecar_path: String::new(),
        });
        let task = h.claimed(req).await;

        pipeline.execute(task.clone(), CancelHandle::new()).await;

        let stored = h.store.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::DoneSuccessful, "{}", stored.error);

        let sidecar_path = format!("{}.json", task.input_file.raw);
        let sidecar: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&sidecar_path).unwrap()).unwrap();
        assert_eq!(sidecar["id"], task.id.as_str());
        assert_eq!(sidecar["status"], "PRE_PROCESSING");
        assert_eq!(
            stored.pre_processing.unwrap().sidecar_path.unwrap().resolved,
            sidecar_path
        );

        let post_output = std::fs::read_to_string(&post_marker).unwrap();
        assert_eq!(post_output.trim(), task.output_file.raw);
    }

    #[tokio::test]
    async fn test_cancel_before_transcode_ends_canceled() {
        let h = harness();
        let pipeline = h.pipeline("exit 0");
        let task = h.claimed(request(&h.dir)).await;

        let cancel = CancelHandle::new();
        cancel.cancel("engine shutting down");
        pipeline.execute(task.clone(), cancel).await;

        let stored = h.store.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::DoneCanceled);
        assert_eq!(stored.error, "engine shutting down");
        assert!(!stored.command.resolved.is_empty());
    }
}
