//! Storage backends.
//!
//! Everything above this trait is backend-agnostic: the event store, blob
//! store, projection engine, and query service all talk to a
//! `StorageBackend` and never learn whether events land in Postgres or in
//! a local append-only file.

pub mod file;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::blobs::BlobRecord;
use crate::config::{Config, StorageBackendKind};
use crate::error::Result;
use crate::events::envelope::{DomainEvent, EventId, Tags};
use crate::projections::ProjectionRecord;

/// Filter over the chronological stream. All present fields must match
/// (tags are AND-combined with the rest).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    /// Restrict to events caused by this actor id (scoped reads).
    pub actor_id: Option<String>,
}

impl EventFilter {
    /// Whether an event satisfies this filter. Shared by the file backend
    /// and by in-memory post-filtering.
    pub fn matches(&self, event: &DomainEvent) -> bool {
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        if let Some(ref event_type) = self.event_type {
            if &event.event_type != event_type {
                return false;
            }
        }
        if let Some(ref actor_id) = self.actor_id {
            if &event.actor.id != actor_id {
                return false;
            }
        }
        self.tags
            .iter()
            .all(|(key, value)| event.tag(key) == Some(value.as_str()))
    }
}

/// A page of events plus the total match count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPage {
    pub events: Vec<DomainEvent>,
    pub total: u64,
}

/// Store-wide statistics for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub event_count: u64,
    pub events_by_type: HashMap<String, u64>,
    pub blob_count: u64,
    pub blob_bytes: u64,
}

/// The storage seam. One implementation per backend; selection happens
/// once at startup in [`open_backend`].
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ─── Events ──────────────────────────────────────────────────────────

    /// Persist a single event. Exactly one attempt; the caller owns retry.
    async fn append_event(&self, event: &DomainEvent) -> Result<()>;

    /// Persist a batch atomically. Either every event lands or none does.
    async fn append_events(&self, events: &[DomainEvent]) -> Result<()>;

    async fn get_event(&self, id: EventId) -> Result<Option<DomainEvent>>;

    /// Page of matching events ordered by id ascending.
    async fn query_events(&self, filter: &EventFilter, limit: u32, offset: u64)
        -> Result<EventPage>;

    /// Lazy chronological stream of every matching event.
    fn stream_events(&self, filter: EventFilter) -> BoxStream<'static, Result<DomainEvent>>;

    /// Remove whole event ranges older than the horizon. Returns the
    /// number removed. Retention only; single events are never deleted.
    async fn prune_events_before(&self, horizon: DateTime<Utc>) -> Result<u64>;

    // ─── Blobs ───────────────────────────────────────────────────────────

    async fn put_blob(&self, blob: &BlobRecord) -> Result<()>;

    async fn get_blob(&self, blob_id: &str) -> Result<Option<BlobRecord>>;

    async fn delete_blob(&self, blob_id: &str) -> Result<bool>;

    /// Ids of blobs whose expiry has passed.
    async fn list_expired_blobs(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    // ─── Projections ─────────────────────────────────────────────────────

    async fn load_projection(&self, name: &str, entity_id: &str)
        -> Result<Option<ProjectionRecord>>;

    async fn save_projection(&self, record: &ProjectionRecord) -> Result<()>;

    async fn list_projections(&self, name: &str) -> Result<Vec<ProjectionRecord>>;

    /// Highest event id any projection has applied. Drives the async-mode
    /// recovery scan at startup.
    async fn max_projected_event_id(&self) -> Result<Option<EventId>>;

    // ─── Misc ────────────────────────────────────────────────────────────

    async fn stats(&self) -> Result<StoreStats>;

    /// Liveness probe for the health endpoint.
    async fn ping(&self) -> Result<()>;
}

/// Open the configured backend.
pub async fn open_backend(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    match config.storage.backend {
        StorageBackendKind::Postgres => {
            let backend = postgres::PostgresBackend::connect(&config.storage).await?;
            Ok(Arc::new(backend))
        }
        StorageBackendKind::File => {
            let backend = file::FileBackend::open(&config.storage.data_dir)?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::envelope::{Actor, EventId};
    use serde_json::json;

    fn sample_event(event_type: &str, tags: &[(&str, &str)]) -> DomainEvent {
        DomainEvent {
            id: EventId::new(),
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            schema_version: 1,
            actor: Actor::user("alice"),
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            payload: json!({}),
            metadata: None,
        }
    }

    #[test]
    fn test_filter_matches_tags_conjunctively() {
        let event = sample_event("ISSUE.SELECTED", &[("issueId", "42"), ("correlationId", "c-1")]);

        let mut filter = EventFilter::default();
        filter.tags.insert("issueId".into(), "42".into());
        assert!(filter.matches(&event));

        filter.tags.insert("correlationId".into(), "c-other".into());
        assert!(!filter.matches(&event));
    }

    #[test]
    fn test_filter_time_window() {
        let event = sample_event("ISSUE.SELECTED", &[]);

        let mut filter = EventFilter::default();
        filter.since = Some(event.timestamp - chrono::Duration::seconds(1));
        filter.until = Some(event.timestamp + chrono::Duration::seconds(1));
        assert!(filter.matches(&event));

        filter.since = Some(event.timestamp + chrono::Duration::seconds(1));
        assert!(!filter.matches(&event));
    }

    #[test]
    fn test_filter_actor_scope() {
        let event = sample_event("ISSUE.SELECTED", &[]);

        let mut filter = EventFilter::default();
        filter.actor_id = Some("alice".into());
        assert!(filter.matches(&event));

        filter.actor_id = Some("bob".into());
        assert!(!filter.matches(&event));
    }
}
