//! Engine configuration.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::SchedulerConfig;
use crate::{Error, Result};

pub const ENV_FFMPEG: &str = "FFQUEUE_FFMPEG";
pub const ENV_MAX_CONCURRENT_TASKS: &str = "FFQUEUE_MAX_CONCURRENT_TASKS";
pub const ENV_POLL_INTERVAL_MS: &str = "FFQUEUE_POLL_INTERVAL_MS";
pub const ENV_LOG_DIR: &str = "FFQUEUE_LOG_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Transcoder binary, looked up in `PATH` unless absolute.
    pub ffmpeg_path: String,
    pub max_concurrent_tasks: usize,
    pub poll_interval_ms: u64,
    pub log_dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            max_concurrent_tasks: 3,
            poll_interval_ms: 1000,
            log_dir: "logs".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load `.env` (if any) and read the configuration from the environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_FFMPEG).filter(|v| !v.trim().is_empty()) {
            config.ffmpeg_path = path;
        }
        if let Some(value) = lookup(ENV_MAX_CONCURRENT_TASKS) {
            config.max_concurrent_tasks = parse_number(ENV_MAX_CONCURRENT_TASKS, &value)?;
        }
        if let Some(value) = lookup(ENV_POLL_INTERVAL_MS) {
            config.poll_interval_ms = parse_number(ENV_POLL_INTERVAL_MS, &value)?;
        }
        if let Some(dir) = lookup(ENV_LOG_DIR).filter(|v| !v.trim().is_empty()) {
            config.log_dir = dir;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(Error::config("max_concurrent_tasks must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be at least 1"));
        }
        Ok(())
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.max_concurrent_tasks,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{} must be a number, got '{}'", key, value)))
}
