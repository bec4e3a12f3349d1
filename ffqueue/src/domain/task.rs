//! Task entity and its status state machine.

use serde::{Deserialize, Serialize};
use serde_json::Map as JsonMap;

use super::now_millis;
use crate::{Error, Result};

/// Sentinel for "remaining time unknown".
pub const REMAINING_UNKNOWN: f64 = -1.0;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for a free slot.
    #[default]
    Queued,
    /// Running the pre-processing script/sidecar step.
    PreProcessing,
    /// The transcoder is running.
    Running,
    /// Running the post-processing script/sidecar step.
    PostProcessing,
    DoneSuccessful,
    DoneError,
    DoneCanceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        Self::Queued,
        Self::PreProcessing,
        Self::Running,
        Self::PostProcessing,
        Self::DoneSuccessful,
        Self::DoneError,
        Self::DoneCanceled,
    ];

    /// String representation used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::PreProcessing => "PRE_PROCESSING",
            Self::Running => "RUNNING",
            Self::PostProcessing => "POST_PROCESSING",
            Self::DoneSuccessful => "DONE_SUCCESSFUL",
            Self::DoneError => "DONE_ERROR",
            Self::DoneCanceled => "DONE_CANCELED",
        }
    }

    /// Parse from the wire representation.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Whether the task has finished, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DoneSuccessful | Self::DoneError | Self::DoneCanceled
        )
    }

    /// Whether the task currently occupies an execution slot.
    pub fn is_executing(&self) -> bool {
        matches!(
            self,
            Self::PreProcessing | Self::Running | Self::PostProcessing
        )
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, target) {
            // Re-persisting the current phase is always allowed
            (from, to) if *from == to => !from.is_terminal(),

            (Queued, PreProcessing | Running | DoneCanceled) => true,
            (PreProcessing, Running | DoneError) => true,
            (Running, PostProcessing | DoneSuccessful | DoneError | DoneCanceled) => true,
            (PostProcessing, DoneSuccessful | DoneError) => true,

            // Explicit restart
            (from, Queued) if from.is_terminal() => true,

            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: TaskStatus) -> Result<TaskStatus> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user supplied template and its value after placeholder resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResolved {
    pub raw: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolved: String,
}

impl RawResolved {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            resolved: String::new(),
        }
    }

    /// A template that is absent or empty is treated as not configured.
    pub fn is_set(value: &Option<RawResolved>) -> bool {
        value.as_ref().is_some_and(|v| !v.raw.is_empty())
    }
}

/// Pre/post-processing templates as submitted (and as stored on presets).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPrePostProcessing {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sidecar_path: String,
}

/// Pre/post-processing step of a task, with its own bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrePostProcessing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_path: Option<RawResolved>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_path: Option<RawResolved>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: i64,
}

impl PrePostProcessing {
    /// A phase only runs when it has a non-empty script or sidecar path.
    pub fn is_configured(&self) -> bool {
        RawResolved::is_set(&self.script_path) || RawResolved::is_set(&self.sidecar_path)
    }

    /// Forget everything a previous execution wrote.
    fn reset(&mut self) {
        for path in [&mut self.script_path, &mut self.sidecar_path]
            .into_iter()
            .flatten()
        {
            path.resolved.clear();
        }
        self.error.clear();
        self.started_at = 0;
        self.finished_at = 0;
    }
}

impl From<&NewPrePostProcessing> for PrePostProcessing {
    fn from(new: &NewPrePostProcessing) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| RawResolved::new(s));
        Self {
            script_path: non_empty(&new.script_path),
            sidecar_path: non_empty(&new.sidecar_path),
            ..Default::default()
        }
    }
}

/// Task creation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub preset: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input_file: String,
    #[serde(default)]
    pub output_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap<String, serde_json::Value>>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_processing: Option<NewPrePostProcessing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_processing: Option<NewPrePostProcessing>,
}

/// One unit of transcoding work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    pub command: RawResolved,
    pub input_file: RawResolved,
    pub output_file: RawResolved,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap<String, serde_json::Value>>,

    pub status: TaskStatus,
    pub progress: f64,
    pub remaining: f64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    pub priority: u32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_processing: Option<PrePostProcessing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_processing: Option<PrePostProcessing>,

    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: i64,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// Build a queued task from a (preset-merged) creation request.
    pub fn from_request(request: &NewTask, batch: Option<String>, source: &str) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            batch,
            name: request.name.clone(),
            command: RawResolved::new(&request.command),
            input_file: RawResolved::new(&request.input_file),
            output_file: RawResolved::new(&request.output_file),
            metadata: request.metadata.clone(),
            status: TaskStatus::Queued,
            progress: 0.0,
            remaining: REMAINING_UNKNOWN,
            error: String::new(),
            priority: request.priority,
            source: source.to_string(),
            pre_processing: request.pre_processing.as_ref().map(PrePostProcessing::from),
            post_processing: request.post_processing.as_ref().map(PrePostProcessing::from),
            started_at: 0,
            finished_at: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_pre_processing(&self) -> bool {
        self.pre_processing
            .as_ref()
            .is_some_and(PrePostProcessing::is_configured)
    }

    pub fn has_post_processing(&self) -> bool {
        self.post_processing
            .as_ref()
            .is_some_and(PrePostProcessing::is_configured)
    }

    /// The first status a task takes when it is picked up.
    pub fn dispatch_status(&self) -> TaskStatus {
        if self.has_pre_processing() {
            TaskStatus::PreProcessing
        } else {
            TaskStatus::Running
        }
    }

    /// Move to `target`, rejecting transitions the state machine does not allow.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<()> {
        self.status = self.status.transition_to(target)?;
        Ok(())
    }

    /// Enter a terminal state: progress forced to 100, remaining unknown.
    ///
    /// `error` is recorded for failure and cancellation.
    pub fn finish(&mut self, target: TaskStatus, error: Option<String>) -> Result<()> {
        debug_assert!(target.is_terminal());
        self.transition_to(target)?;
        self.progress = 100.0;
        self.remaining = REMAINING_UNKNOWN;
        self.finished_at = now_millis();
        if let Some(error) = error {
            self.error = error;
        }
        Ok(())
    }

    /// Reset the task so it can run again from scratch.
    pub fn restart(&mut self) -> Result<()> {
        if !self.status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: TaskStatus::Queued.to_string(),
            });
        }
        self.transition_to(TaskStatus::Queued)?;
        self.progress = 0.0;
        self.remaining = REMAINING_UNKNOWN;
        self.started_at = 0;
        self.finished_at = 0;
        self.error.clear();
        self.command.resolved.clear();
        self.input_file.resolved.clear();
        self.output_file.resolved.clear();
        for phase in [&mut self.pre_processing, &mut self.post_processing]
            .into_iter()
            .flatten()
        {
            phase.reset();
        }
        Ok(())
    }
}
