//! Presets: reusable templates a task can inherit defaults from.

use serde::{Deserialize, Serialize};

use super::task::{NewPrePostProcessing, NewTask};

/// Named template bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub output_file: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_processing: Option<NewPrePostProcessing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_processing: Option<NewPrePostProcessing>,
}

impl Preset {
    /// Fill the unset fields of `request` from this preset.
    ///
    /// Values already present on the request always win.
    pub fn apply_to(&self, request: &mut NewTask) {
        if request.command.is_empty() {
            request.command = self.command.clone();
        }
        if request.output_file.is_empty() {
            request.output_file = self.output_file.clone();
        }
        if request.priority == 0 {
            request.priority = self.priority;
        }
        if request.pre_processing.is_none() {
            request.pre_processing = self.pre_processing.clone();
        }
        if request.post_processing.is_none() {
            request.post_processing = self.post_processing.clone();
        }
    }
}
