//! Domain entities: tasks, presets and watchfolders.

pub mod preset;
pub mod task;
pub mod watchfolder;

pub use preset::Preset;
pub use task::{
    NewPrePostProcessing, NewTask, PrePostProcessing, REMAINING_UNKNOWN, RawResolved, Task,
    TaskStatus,
};
pub use watchfolder::{ExtensionFilter, NewWatchfolder, Watchfolder, WatchfolderFilter};

/// Current time as unix milliseconds, the timestamp unit of every entity.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
