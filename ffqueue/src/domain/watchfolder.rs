//! Watchfolder entity and its extension filter.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Include/exclude lists matched against file extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ExtensionFilter {
    /// Decide whether `path` passes the filter.
    ///
    /// A non-empty exclude list decides alone: matching files are rejected and
    /// everything else passes. Otherwise a non-empty include list only lets
    /// matching files through. With both lists empty everything passes.
    pub fn accepts(&self, path: &Path) -> bool {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_lowercase(),
            None => return false,
        };

        if !self.exclude.is_empty() {
            return !self.exclude.iter().any(|ext| has_extension(&name, ext));
        }
        if !self.include.is_empty() {
            return self.include.iter().any(|ext| has_extension(&name, ext));
        }
        true
    }
}

fn has_extension(file_name: &str, ext: &str) -> bool {
    let ext = ext.trim().trim_start_matches('.');
    if ext.is_empty() {
        return false;
    }
    file_name
        .strip_suffix(&ext.to_lowercase())
        .is_some_and(|stem| stem.ends_with('.'))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchfolderFilter {
    #[serde(default)]
    pub extensions: ExtensionFilter,
}

/// A directory polled for new, stable files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watchfolder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,

    pub path: String,
    /// Seconds between two walks.
    pub interval: u64,
    /// Consecutive stable-size polls required before a file is picked up.
    #[serde(default)]
    pub growth_checks: u32,

    #[serde(default)]
    pub filter: WatchfolderFilter,

    /// Preset new tasks inherit from.
    pub preset: String,

    #[serde(default)]
    pub suspended: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default)]
    pub last_check: i64,

    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
}

/// Fields accepted when creating or updating a watchfolder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewWatchfolder {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub path: String,
    pub interval: u64,
    #[serde(default)]
    pub growth_checks: u32,
    #[serde(default)]
    pub filter: WatchfolderFilter,
    pub preset: String,
    #[serde(default)]
    pub suspended: bool,
}

impl Watchfolder {
    /// Whether a monitor loop should be running for this folder.
    pub fn is_active(&self) -> bool {
        !self.suspended && self.deleted_at.is_none()
    }

    /// Copy user editable fields from a request.
    pub fn apply(&mut self, request: &NewWatchfolder) {
        self.name = request.name.clone();
        self.description = request.description.clone();
        self.path = request.path.clone();
        self.interval = request.interval;
        self.growth_checks = request.growth_checks;
        self.filter = request.filter.clone();
        self.preset = request.preset.clone();
        self.suspended = request.suspended;
    }
}
