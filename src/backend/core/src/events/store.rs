//! The append pipeline and read operations over the stream.
//!
//! Append order is fixed: validate, mask, assign identity, persist,
//! notify projections. The store makes exactly one persistence attempt
//! per call; retrying transient failures is the producer's job, for
//! which [`EventStore::append_with_retry`] provides the bounded
//! exponential-backoff loop.

use chrono::Utc;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{instrument, warn};

use crate::error::{ChronicleError, ErrorCode, Result};
use crate::events::envelope::{DomainEvent, EventId, EventIdGenerator, NewEvent};
use crate::events::schema::SchemaRegistry;
use crate::masking::SecretMasker;
use crate::observability::metrics;
use crate::projections::ProjectionEngine;
use crate::storage::{EventFilter, EventPage, StorageBackend};

/// Bounded backoff for producer-side retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

pub struct EventStore {
    backend: Arc<dyn StorageBackend>,
    registry: SchemaRegistry,
    masker: Arc<SecretMasker>,
    ids: EventIdGenerator,
    projections: Arc<ProjectionEngine>,
}

impl EventStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        registry: SchemaRegistry,
        masker: Arc<SecretMasker>,
        projections: Arc<ProjectionEngine>,
    ) -> Self {
        Self {
            backend,
            registry,
            masker,
            ids: EventIdGenerator::new(),
            projections,
        }
    }

    /// Append a single event. One persistence attempt; validation
    /// failures are permanent and must not be retried.
    #[instrument(skip(self, new), fields(event_type = %new.event_type))]
    pub async fn append(&self, new: NewEvent) -> Result<DomainEvent> {
        let started = Instant::now();
        let event = self.prepare(new)?;

        self.backend
            .append_event(&event)
            .await
            .map_err(into_write_failure)?;

        metrics::record_append(&event.event_type, started.elapsed().as_secs_f64());
        self.projections.notify(&event).await;
        Ok(event)
    }

    /// Append a batch atomically: every event is validated up front and
    /// either all of them land or none do.
    #[instrument(skip(self, batch), fields(batch_size = batch.len()))]
    pub async fn append_batch(&self, batch: Vec<NewEvent>) -> Result<Vec<DomainEvent>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let mut events = Vec::with_capacity(batch.len());
        for (index, new) in batch.into_iter().enumerate() {
            let event = self.prepare(new).map_err(|e| {
                ChronicleError::new(
                    ErrorCode::BatchRejected,
                    format!("batch rejected: event at index {} is invalid", index),
                )
                .with_context("index", index)
                .with_context("cause", e.user_message())
            })?;
            events.push(event);
        }

        self.backend
            .append_events(&events)
            .await
            .map_err(into_write_failure)?;

        let elapsed = started.elapsed().as_secs_f64();
        for event in &events {
            metrics::record_append(&event.event_type, elapsed);
            self.projections.notify(event).await;
        }
        Ok(events)
    }

    /// Producer-side retry wrapper. Validation failures abort
    /// immediately; transient write failures back off exponentially and
    /// become fatal once attempts run out.
    pub async fn append_with_retry(
        &self,
        new: NewEvent,
        policy: &RetryPolicy,
    ) -> Result<DomainEvent> {
        let mut attempt = 0u32;
        loop {
            match self.append(new.clone()).await {
                Ok(event) => return Ok(event),
                Err(e) if e.is_retryable() && attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "append failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => {
                    return Err(ChronicleError::with_internal(
                        ErrorCode::AppendRetriesExhausted,
                        "Event could not be persisted after repeated attempts",
                        e.to_string(),
                    )
                    .with_context("attempts", policy.max_attempts));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Page of events matching a filter, ordered by id ascending.
    #[instrument(skip(self, filter))]
    pub async fn get_events(
        &self,
        filter: &EventFilter,
        limit: u32,
        offset: u64,
    ) -> Result<EventPage> {
        let started = Instant::now();
        let page = self.backend.query_events(filter, limit, offset).await?;
        metrics::record_query(started.elapsed().as_secs_f64());
        Ok(page)
    }

    pub async fn get_event_by_id(&self, id: EventId) -> Result<Option<DomainEvent>> {
        self.backend.get_event(id).await
    }

    /// Lazy chronological stream of every matching event.
    pub fn stream_events(&self, filter: EventFilter) -> BoxStream<'static, Result<DomainEvent>> {
        self.backend.stream_events(filter)
    }

    /// Validate, default the schema version, mask, and stamp identity.
    fn prepare(&self, new: NewEvent) -> Result<DomainEvent> {
        let report = self.registry.validate(&new);
        if !report.is_valid() {
            metrics::record_rejection(&new.event_type);
            return Err(ChronicleError::validation(format!(
                "event failed validation with {} error(s)",
                report.errors.len()
            ))
            .with_context("eventType", &new.event_type)
            .with_context("errors", &report.errors));
        }

        let schema_version = new
            .schema_version
            .or_else(|| self.registry.latest_version(&new.event_type))
            .unwrap_or(1);

        let payload = self.masker.mask_json(&new.payload);
        let metadata = new.metadata.as_ref().map(|m| self.masker.mask_json(m));
        let tags = new
            .tags
            .into_iter()
            .map(|(k, v)| (k, self.masker.mask_str(&v)))
            .collect();

        Ok(DomainEvent {
            id: self.ids.next(),
            event_type: new.event_type,
            timestamp: Utc::now(),
            schema_version,
            actor: mask_actor(new.actor, &self.masker),
            tags,
            payload,
            metadata,
        })
    }
}

fn mask_actor(
    mut actor: crate::events::envelope::Actor,
    masker: &SecretMasker,
) -> crate::events::envelope::Actor {
    if let Some(metadata) = actor.metadata.take() {
        actor.metadata = Some(masker.mask_json(&metadata));
    }
    actor
}

/// Persist failures surface with the retryable write-failure code so
/// producers can tell them apart from permanent rejections.
fn into_write_failure(e: ChronicleError) -> ChronicleError {
    if e.is_retryable() {
        ChronicleError::write_failure(e.to_string())
    } else {
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectionsConfig;
    use crate::events::envelope::Actor;
    use crate::events::schema::default_registry;
    use crate::projections::views::default_views;
    use crate::storage::file::FileBackend;
    use futures::StreamExt;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, EventStore) {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FileBackend::open(dir.path()).unwrap());
        let masker = Arc::new(SecretMasker::new());
        let projections = ProjectionEngine::new(
            Arc::clone(&backend),
            default_views(),
            &ProjectionsConfig::default(),
        );
        let store = EventStore::new(backend, default_registry(), masker, projections);
        (dir, store)
    }

    fn issue_selected(issue: &str) -> NewEvent {
        NewEvent::new(
            "ISSUE.SELECTED",
            Actor::user("alice"),
            json!({"issueId": issue, "title": "a fine issue"}),
        )
        .with_tag("issueId", issue)
    }

    #[tokio::test]
    async fn test_append_assigns_identity_and_version() {
        let (_dir, store) = store();
        let event = store.append(issue_selected("42")).await.unwrap();
        assert_eq!(event.schema_version, 1);
        assert_eq!(event.event_type, "ISSUE.SELECTED");

        let loaded = store.get_event_by_id(event.id).await.unwrap().unwrap();
        assert_eq!(loaded, event);
    }

    #[tokio::test]
    async fn test_append_rejects_invalid_payload() {
        let (_dir, store) = store();
        let bad = NewEvent::new("ISSUE.SELECTED", Actor::user("alice"), json!({}));
        let err = store.append(bad).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_append_masks_payload() {
        let (_dir, store) = store();
        let new = NewEvent::new(
            "ISSUE.SELECTED",
            Actor::user("alice"),
            json!({"issueId": "42", "title": "key is sk-ant-abcdefgh12345678"}),
        );
        let event = store.append(new).await.unwrap();
        let title = event.payload["title"].as_str().unwrap();
        assert!(!title.contains("sk-ant-"));
    }

    #[tokio::test]
    async fn test_events_ordered_by_id() {
        let (_dir, store) = store();
        for i in 0..20 {
            store.append(issue_selected(&i.to_string())).await.unwrap();
        }

        let page = store
            .get_events(&EventFilter::default(), 100, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 20);
        for pair in page.events.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[tokio::test]
    async fn test_batch_rejected_when_one_invalid() {
        let (_dir, store) = store();
        let batch = vec![
            issue_selected("1"),
            NewEvent::new("ISSUE.SELECTED", Actor::user("alice"), json!({})),
        ];
        let err = store.append_batch(batch).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BatchRejected);

        // nothing from the batch landed
        let page = store
            .get_events(&EventFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_batch_appends_all() {
        let (_dir, store) = store();
        let batch = vec![issue_selected("1"), issue_selected("2")];
        let events = store.append_batch(batch).await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].id < events[1].id);
    }

    #[tokio::test]
    async fn test_stream_is_finite_and_chronological() {
        let (_dir, store) = store();
        for i in 0..5 {
            store.append(issue_selected(&i.to_string())).await.unwrap();
        }

        let streamed: Vec<DomainEvent> = store
            .stream_events(EventFilter::default())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(streamed.len(), 5);
        for pair in streamed.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends_land_exactly_once_in_order() {
        let (_dir, store) = store();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for (producer, correlation) in [("alice", "c-left"), ("bob", "c-right")] {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    store
                        .append(
                            NewEvent::new(
                                "ISSUE.SELECTED",
                                Actor::user(producer),
                                json!({"issueId": format!("{}-{}", producer, i)}),
                            )
                            .with_correlation(correlation),
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let page = store
            .get_events(&EventFilter::default(), 100, 0)
            .await
            .unwrap();
        assert_eq!(page.total, 20);

        // strictly ordered, no duplicates
        for pair in page.events.windows(2) {
            assert!(pair[0].id < pair[1].id);
        }
        let mut issues: Vec<&str> = page
            .events
            .iter()
            .map(|e| e.payload["issueId"].as_str().unwrap())
            .collect();
        issues.sort_unstable();
        issues.dedup();
        assert_eq!(issues.len(), 20);
    }

    #[tokio::test]
    async fn test_sync_projection_applied_on_append() {
        let (_dir, store) = store();
        store.append(issue_selected("42")).await.unwrap();

        let record = store
            .backend
            .load_projection("issue-status", "42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state["status"], "selected");
    }

    #[tokio::test]
    async fn test_unknown_type_rejected_not_retried() {
        let (_dir, store) = store();
        let new = NewEvent::new("TOTALLY.UNKNOWN", Actor::user("alice"), json!({}));
        let err = store
            .append_with_retry(new, &RetryPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_tag_filter_scopes_reads() {
        let (_dir, store) = store();
        store.append(issue_selected("42")).await.unwrap();
        store.append(issue_selected("7")).await.unwrap();

        let mut filter = EventFilter::default();
        filter.tags.insert("issueId".into(), "42".into());
        let page = store.get_events(&filter, 10, 0).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].tag("issueId"), Some("42"));
    }
}
