//! Services mediating between callers, the engine and the stores.

pub mod task;
pub mod watchfolder;

pub use task::{CANCELED_BY_USER, CancelRequestReceiver, SOURCE_API, TaskService};
pub use watchfolder::{WatchfolderChange, WatchfolderService};
