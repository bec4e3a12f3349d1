//! Lifecycle event fan-out.
//!
//! The engine reports every task and watchfolder change to an
//! [`EventNotifier`]. Delivery is fire-and-forget: the engine never waits for,
//! nor retries, a notification. Webhooks and websockets subscribe on the other
//! side of the broadcast channel.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::{Task, Watchfolder};

/// Events emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum EngineEvent {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted(Task),
    BatchCreated(Vec<Task>),
    /// The last non-terminal task of a batch finished; carries that task.
    BatchFinished(Task),
    WatchfolderCreated(Watchfolder),
    WatchfolderUpdated(Watchfolder),
    WatchfolderDeleted(Watchfolder),
}

impl EngineEvent {
    /// Get a description of the event for logging.
    pub fn description(&self) -> String {
        match self {
            Self::TaskCreated(t) => format!("Task created: {}", t.id),
            Self::TaskUpdated(t) => format!("Task updated: {} ({})", t.id, t.status),
            Self::TaskDeleted(t) => format!("Task deleted: {}", t.id),
            Self::BatchCreated(tasks) => format!(
                "Batch created: {} ({} tasks)",
                tasks
                    .first()
                    .and_then(|t| t.batch.as_deref())
                    .unwrap_or_default(),
                tasks.len()
            ),
            Self::BatchFinished(t) => {
                format!("Batch finished: {}", t.batch.as_deref().unwrap_or_default())
            }
            Self::WatchfolderCreated(w) => format!("Watchfolder created: {}", w.id),
            Self::WatchfolderUpdated(w) => format!("Watchfolder updated: {}", w.id),
            Self::WatchfolderDeleted(w) => format!("Watchfolder deleted: {}", w.id),
        }
    }
}

/// Receiver of engine events.
pub trait EventNotifier: Send + Sync {
    fn notify(&self, event: EngineEvent);
}

/// Default channel capacity for engine events.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Notifier backed by a tokio broadcast channel.
pub struct BroadcastNotifier {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastNotifier {
    /// Create a new notifier with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new notifier with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNotifier for BroadcastNotifier {
    fn notify(&self, event: EngineEvent) {
        tracing::trace!("Publishing engine event: {}", event.description());
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}
