//! Background retention sweep.
//!
//! Runs on a fixed interval: removes expired blobs and, when an event
//! horizon is configured, whole event ranges older than it. This is the
//! only path that deletes anything.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::blobs::BlobStore;
use crate::config::RetentionConfig;
use crate::error::Result;
use crate::storage::StorageBackend;

pub struct RetentionSweeper {
    backend: Arc<dyn StorageBackend>,
    blobs: Arc<BlobStore>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        blobs: Arc<BlobStore>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            backend,
            blobs,
            config,
        }
    }

    /// Spawn the sweep loop. Flipping the watch channel stops it after
    /// the current pass.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                interval_secs = self.config.sweep_interval.as_secs(),
                "retention sweeper started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            error!(error = %e, "retention sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("retention sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// One sweep pass. Public so operators can trigger it out of cycle.
    #[instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<u64> {
        let now = Utc::now();
        let mut removed = self.blobs.prune_expired(now).await?;

        if let Some(horizon) = self.config.event_horizon {
            let horizon = Duration::from_std(horizon).unwrap_or_else(|_| Duration::days(365));
            let pruned = self.backend.prune_events_before(now - horizon).await?;
            if pruned > 0 {
                info!(pruned, "event ranges removed past the retention horizon");
            }
            removed += pruned;
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::BlobRecord;
    use crate::masking::SecretMasker;
    use crate::storage::file::FileBackend;
    use tempfile::TempDir;

    fn sweeper(config: RetentionConfig) -> (TempDir, RetentionSweeper, Arc<dyn StorageBackend>) {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FileBackend::open(dir.path()).unwrap());
        let blobs = Arc::new(BlobStore::new(
            Arc::clone(&backend),
            Arc::new(SecretMasker::new()),
            std::time::Duration::from_secs(3600),
        ));
        let sweeper = RetentionSweeper::new(Arc::clone(&backend), blobs, config);
        (dir, sweeper, backend)
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_blobs() {
        let (_dir, sweeper, backend) = sweeper(RetentionConfig::default());

        let expired = BlobRecord {
            id: crate::blobs::content_address(b"old"),
            content_type: "text/plain".into(),
            size_bytes: 3,
            created_at: Utc::now() - Duration::days(100),
            expires_at: Utc::now() - Duration::days(1),
            data: b"old".to_vec(),
        };
        let fresh = BlobRecord {
            id: crate::blobs::content_address(b"new"),
            content_type: "text/plain".into(),
            size_bytes: 3,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::days(30),
            data: b"new".to_vec(),
        };
        backend.put_blob(&expired).await.unwrap();
        backend.put_blob(&fresh).await.unwrap();

        let removed = sweeper.sweep_once().await.unwrap();
        assert_eq!(removed, 1);
        assert!(backend.get_blob(&expired.id).await.unwrap().is_none());
        assert!(backend.get_blob(&fresh.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_honors_event_horizon() {
        let config = RetentionConfig {
            event_horizon: Some(std::time::Duration::from_secs(60)),
            ..RetentionConfig::default()
        };
        let (_dir, sweeper, backend) = sweeper(config);

        use crate::events::envelope::{Actor, DomainEvent, EventId};
        let mut old = DomainEvent {
            id: EventId::new(),
            event_type: "OLD.EVENT".into(),
            timestamp: Utc::now() - Duration::hours(2),
            schema_version: 1,
            actor: Actor::system("test"),
            tags: Default::default(),
            payload: serde_json::json!({}),
            metadata: None,
        };
        backend.append_event(&old).await.unwrap();
        old.id = EventId::new();
        old.timestamp = Utc::now();
        old.event_type = "FRESH.EVENT".into();
        backend.append_event(&old).await.unwrap();

        let removed = sweeper.sweep_once().await.unwrap();
        assert_eq!(removed, 1);

        let page = backend
            .query_events(&crate::storage::EventFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].event_type, "FRESH.EVENT");
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let (_dir, sweeper, _backend) = sweeper(RetentionConfig {
            sweep_interval: std::time::Duration::from_millis(10),
            ..RetentionConfig::default()
        });

        let (tx, rx) = watch::channel(false);
        let handle = sweeper.spawn(rx);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
