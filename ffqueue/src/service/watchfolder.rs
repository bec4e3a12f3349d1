//! Watchfolder management and the change stream the monitor listens to.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use crate::domain::{NewWatchfolder, Watchfolder, now_millis};
use crate::notify::{EngineEvent, EventNotifier};
use crate::store::{PresetStore, WatchfolderStore};
use crate::{Error, Result};

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Watchfolder change published after it has been persisted.
#[derive(Debug, Clone)]
pub enum WatchfolderChange {
    Created(Watchfolder),
    Updated(Watchfolder),
    Deleted(Watchfolder),
}

impl WatchfolderChange {
    /// The record as persisted by the change.
    pub fn watchfolder(&self) -> &Watchfolder {
        match self {
            Self::Created(wf) | Self::Updated(wf) | Self::Deleted(wf) => wf,
        }
    }
}

pub struct WatchfolderService {
    store: Arc<dyn WatchfolderStore>,
    presets: Arc<dyn PresetStore>,
    notifier: Arc<dyn EventNotifier>,
    changes: broadcast::Sender<WatchfolderChange>,
    /// Read-modify-write cycles on watchfolder records are serialized.
    write_lock: Mutex<()>,
}

impl WatchfolderService {
    pub fn new(
        store: Arc<dyn WatchfolderStore>,
        presets: Arc<dyn PresetStore>,
        notifier: Arc<dyn EventNotifier>,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            store,
            presets,
            notifier,
            changes,
            write_lock: Mutex::new(()),
        }
    }

    /// Subscribe to watchfolder changes.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchfolderChange> {
        self.changes.subscribe()
    }

    pub async fn get(&self, id: &str) -> Result<Watchfolder> {
        self.store.get_watchfolder(id).await
    }

    pub async fn list_active(&self) -> Result<Vec<Watchfolder>> {
        self.store.list_active().await
    }

    pub async fn create(&self, request: NewWatchfolder) -> Result<Watchfolder> {
        self.validate(&request).await?;

        let now = now_millis();
        let mut watchfolder = Watchfolder {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            ..Default::default()
        };
        watchfolder.apply(&request);

        {
            let _guard = self.write_lock.lock().await;
            self.store.save_watchfolder(&watchfolder).await?;
        }

        info!(watchfolder_id = %watchfolder.id, path = %watchfolder.path, "Created watchfolder");
        self.notifier
            .notify(EngineEvent::WatchfolderCreated(watchfolder.clone()));
        self.publish(WatchfolderChange::Created(watchfolder.clone()));
        Ok(watchfolder)
    }

    pub async fn update(&self, id: &str, request: NewWatchfolder) -> Result<Watchfolder> {
        self.validate(&request).await?;

        let watchfolder = self
            .modify(id, |wf| {
                wf.apply(&request);
                // A new configuration starts with a clean slate
                wf.error.clear();
            })
            .await?;

        info!(watchfolder_id = %id, "Updated watchfolder");
        self.notifier
            .notify(EngineEvent::WatchfolderUpdated(watchfolder.clone()));
        self.publish(WatchfolderChange::Updated(watchfolder.clone()));
        Ok(watchfolder)
    }

    /// Suspend or resume polling of a watchfolder.
    pub async fn set_suspended(&self, id: &str, suspended: bool) -> Result<Watchfolder> {
        let watchfolder = self.modify(id, |wf| wf.suspended = suspended).await?;

        info!(watchfolder_id = %id, suspended, "Changed watchfolder suspension");
        self.notifier
            .notify(EngineEvent::WatchfolderUpdated(watchfolder.clone()));
        self.publish(WatchfolderChange::Updated(watchfolder.clone()));
        Ok(watchfolder)
    }

    /// Soft-delete a watchfolder.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let watchfolder = self
            .modify(id, |wf| wf.deleted_at = Some(now_millis()))
            .await?;

        info!(watchfolder_id = %id, "Deleted watchfolder");
        self.notifier
            .notify(EngineEvent::WatchfolderDeleted(watchfolder.clone()));
        self.publish(WatchfolderChange::Deleted(watchfolder));
        Ok(())
    }

    /// Persist the outcome of one polling cycle.
    ///
    /// Only the check timestamp and error are touched, and no change is
    /// published, so the running loop is left alone.
    pub async fn record_check(&self, id: &str, checked_at: i64, error: Option<String>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut watchfolder = self.store.get_watchfolder(id).await?;
        if watchfolder.deleted_at.is_some() {
            debug!(watchfolder_id = %id, "Skipping check result of deleted watchfolder");
            return Ok(());
        }
        watchfolder.last_check = checked_at;
        watchfolder.error = error.unwrap_or_default();
        self.store.save_watchfolder(&watchfolder).await
    }

    async fn validate(&self, request: &NewWatchfolder) -> Result<()> {
        if request.path.trim().is_empty() {
            return Err(Error::validation("watchfolder path must not be empty"));
        }
        match self.presets.get_preset(&request.preset).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound { .. }) => Err(Error::validation(format!(
                "preset '{}' does not exist",
                request.preset
            ))),
            Err(e) => Err(e),
        }
    }

    async fn modify(&self, id: &str, change: impl FnOnce(&mut Watchfolder)) -> Result<Watchfolder> {
        let _guard = self.write_lock.lock().await;
        let mut watchfolder = self.store.get_watchfolder(id).await?;
        if watchfolder.deleted_at.is_some() {
            return Err(Error::not_found("Watchfolder", id));
        }
        change(&mut watchfolder);
        watchfolder.updated_at = now_millis();
        self.store.save_watchfolder(&watchfolder).await?;
        Ok(watchfolder)
    }

    fn publish(&self, change: WatchfolderChange) {
        // Nobody listening means no monitor is running
        let _ = self.changes.send(change);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Preset;
    use crate::notify::BroadcastNotifier;
    use crate::store::MemoryStore;

    async fn service() -> (WatchfolderService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .save_preset(&Preset {
                id: "p".into(),
                name: "copy".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let service = WatchfolderService::new(
            store.clone(),
            store.clone(),
            Arc::new(BroadcastNotifier::new()),
        );
        (service, store)
    }

    fn request() -> NewWatchfolder {
        NewWatchfolder {
            name: "inbox".into(),
            path: "/srv/inbox".into(),
            interval: 5,
            growth_checks: 3,
            preset: "p".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_requires_existing_preset() {
        let (service, _) = service().await;
        let mut req = request();
        req.preset = "missing".into();
        assert!(matches!(
            service.create(req).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_changes_are_published() {
        let (service, store) = service().await;
        let mut changes = service.subscribe();

        let created = service.create(request()).await.unwrap();
        assert!(matches!(changes.recv().await.unwrap(), WatchfolderChange::Created(wf) if wf.id == created.id));

        service.set_suspended(&created.id, true).await.unwrap();
        match changes.recv().await.unwrap() {
            WatchfolderChange::Updated(wf) => assert!(wf.suspended),
            other => panic!("unexpected change {:?}", other),
        }
        assert!(store.list_active().await.unwrap().is_empty());

        service.delete(&created.id).await.unwrap();
        assert!(matches!(
            changes.recv().await.unwrap(),
            WatchfolderChange::Deleted(_)
        ));
        assert!(service.update(&created.id, request()).await.is_err());
    }

    #[tokio::test]
    async fn test_record_check_does_not_publish() {
        let (service, _) = service().await;
        let created = service.create(request()).await.unwrap();
        let mut changes = service.subscribe();

        service
            .record_check(&created.id, 42, Some("permission denied".into()))
            .await
            .unwrap();
        let stored = service.get(&created.id).await.unwrap();
        assert_eq!(stored.last_check, 42);
        assert_eq!(stored.error, "permission denied");
        assert!(changes.try_recv().is_err());

        service.record_check(&created.id, 43, None).await.unwrap();
        assert!(service.get(&created.id).await.unwrap().error.is_empty());
    }
}
