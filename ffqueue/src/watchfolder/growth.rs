//! Growth-check debounce for files still being written.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileState {
    size: u64,
    hits: u32,
}

/// Per-loop record of observed file sizes and already processed files.
#[derive(Debug, Default)]
pub struct GrowthTracker {
    states: HashMap<PathBuf, FileState>,
    processed: HashSet<PathBuf>,
}

impl GrowthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation of `path` and report whether it is ready.
    ///
    /// With `growth_checks == 0` every file is ready immediately. Otherwise the
    /// first sighting counts as one hit, an unchanged size adds a hit, a
    /// changed size starts over at one, and the file is ready once it reaches
    /// `growth_checks` hits.
    pub fn observe(&mut self, path: &Path, size: u64, growth_checks: u32) -> bool {
        if growth_checks == 0 {
            return true;
        }

        let state = self
            .states
            .entry(path.to_path_buf())
            .and_modify(|state| {
                if state.size == size {
                    state.hits = state.hits.saturating_add(1);
                } else {
                    *state = FileState { size, hits: 1 };
                }
            })
            .or_insert(FileState { size, hits: 1 });
        state.hits >= growth_checks
    }

    /// Feed the result of one walk, returning the files that became ready.
    ///
    /// Ready files are remembered as processed and never reported again.
    /// Tracking state of files missing from `files` is discarded.
    pub fn poll(&mut self, files: &[(PathBuf, u64)], growth_checks: u32) -> Vec<PathBuf> {
        let mut ready = Vec::new();
        for (path, size) in files {
            if self.processed.contains(path) {
                continue;
            }
            if self.observe(path, *size, growth_checks) {
                self.states.remove(path);
                self.processed.insert(path.clone());
                ready.push(path.clone());
            }
        }

        let seen: HashSet<&PathBuf> = files.iter().map(|(path, _)| path).collect();
        self.states.retain(|path, _| seen.contains(path));
        ready
    }

    pub fn is_processed(&self, path: &Path) -> bool {
        self.processed.contains(path)
    }

    /// Number of files still waiting for their size to settle.
    pub fn pending(&self) -> usize {
        self.states.len()
    }
}
