//! Materialized projections.
//!
//! A projection is a named pure fold over the event stream, keyed by an
//! entity id extracted from the event's tags. The engine persists one
//! record per `(projection, entity)` with the id of the last event
//! applied; applying an event at or below that id is a no-op, which makes
//! delivery-after-crash and recovery re-scans safe.
//!
//! The same fold functions feed both live application here and historical
//! reconstruction in the replay engine, so the two can never disagree.

pub mod views;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use crate::config::{ProjectionMode, ProjectionsConfig};
use crate::error::Result;
use crate::events::envelope::{DomainEvent, EventId};
use crate::observability::metrics;
use crate::storage::{EventFilter, StorageBackend};

// ═══════════════════════════════════════════════════════════════════════════════
// Projection Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A registered fold.
///
/// `apply` must be pure: same state and event in, same state out, no
/// clocks, no randomness, no I/O. Determinism of replay depends on it.
pub trait Projection: Send + Sync {
    /// Stable name, used as the storage key and in the query API.
    fn name(&self) -> &'static str;

    /// The entity this event belongs to, or `None` when the projection
    /// does not consume the event at all.
    fn entity_id(&self, event: &DomainEvent) -> Option<String>;

    /// State before any event has been applied.
    fn initial_state(&self) -> Value;

    /// The fold: `(state, event) -> state`.
    fn apply(&self, state: Value, event: &DomainEvent) -> Value;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Stored Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted state for one `(projection, entity)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionRecord {
    pub name: String,
    pub entity_id: String,
    pub state: Value,
    /// Id of the last event folded into `state`.
    pub last_event_id: EventId,
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Applies registered folds to appended events, synchronously or through
/// a bounded queue.
pub struct ProjectionEngine {
    backend: Arc<dyn StorageBackend>,
    projections: Vec<Arc<dyn Projection>>,
    mode: ProjectionMode,
    queue: Option<mpsc::Sender<DomainEvent>>,
}

impl ProjectionEngine {
    /// Build the engine. In async mode this spawns the worker task; call
    /// from within a runtime.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        projections: Vec<Arc<dyn Projection>>,
        config: &ProjectionsConfig,
    ) -> Arc<Self> {
        match config.mode {
            ProjectionMode::Sync => Arc::new(Self {
                backend,
                projections,
                mode: ProjectionMode::Sync,
                queue: None,
            }),
            ProjectionMode::Async => {
                let (tx, rx) = mpsc::channel(config.queue_capacity);
                let engine = Arc::new(Self {
                    backend,
                    projections,
                    mode: ProjectionMode::Async,
                    queue: Some(tx),
                });
                tokio::spawn(Self::worker(Arc::clone(&engine), rx));
                engine
            }
        }
    }

    /// Registered folds, shared with the replay engine.
    pub fn projections(&self) -> &[Arc<dyn Projection>] {
        &self.projections
    }

    pub fn mode(&self) -> ProjectionMode {
        self.mode
    }

    /// Entry point called by the event store after a successful append.
    ///
    /// Sync mode folds inline; a projection failure is logged but never
    /// fails the append, because the event is already durable and the
    /// projection can be rebuilt.
    pub async fn notify(&self, event: &DomainEvent) {
        match self.mode {
            ProjectionMode::Sync => {
                if let Err(e) = self.apply_event(event).await {
                    error!(event_id = %event.id, error = %e, "projection application failed");
                }
            }
            ProjectionMode::Async => {
                if let Some(queue) = &self.queue {
                    if let Err(e) = queue.send(event.clone()).await {
                        error!(event_id = %event.id, error = %e, "projection queue closed");
                    } else {
                        metrics::set_projection_lag(
                            (queue.max_capacity() - queue.capacity()) as u64,
                        );
                    }
                }
            }
        }
    }

    async fn worker(engine: Arc<Self>, mut rx: mpsc::Receiver<DomainEvent>) {
        info!("projection worker started");
        while let Some(event) = rx.recv().await {
            if let Err(e) = engine.apply_event(&event).await {
                error!(event_id = %event.id, error = %e, "projection application failed");
            }
            if let Some(queue) = &engine.queue {
                metrics::set_projection_lag((queue.max_capacity() - queue.capacity()) as u64);
            }
        }
        info!("projection worker stopped");
    }

    /// Fold one event into every projection that consumes it.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn apply_event(&self, event: &DomainEvent) -> Result<()> {
        for projection in &self.projections {
            let Some(entity_id) = projection.entity_id(event) else {
                continue;
            };

            let existing = self
                .backend
                .load_projection(projection.name(), &entity_id)
                .await?;

            // idempotency: an event at or below the recorded high-water
            // mark has already been folded in
            if let Some(ref record) = existing {
                if record.last_event_id >= event.id {
                    debug!(
                        projection = projection.name(),
                        entity_id = %entity_id,
                        "event already applied, skipping"
                    );
                    continue;
                }
            }

            let state = existing
                .map(|r| r.state)
                .unwrap_or_else(|| projection.initial_state());
            let next_state = projection.apply(state, event);

            self.backend
                .save_projection(&ProjectionRecord {
                    name: projection.name().to_string(),
                    entity_id,
                    state: next_state,
                    last_event_id: event.id,
                    updated_at: Utc::now(),
                })
                .await?;
        }
        Ok(())
    }

    /// Startup recovery: re-scan the stream and fold anything the stored
    /// records have not seen. Compare-and-skip makes the re-scan safe to
    /// run from the beginning.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<u64> {
        let checkpoint = self.backend.max_projected_event_id().await?;
        info!(?checkpoint, "projection recovery scan starting");

        let mut stream = self.backend.stream_events(EventFilter::default());
        let mut scanned = 0u64;
        while let Some(event) = stream.next().await {
            let event = event?;
            self.apply_event(&event).await?;
            scanned += 1;
        }

        if scanned > 0 {
            info!(scanned, "projection recovery scan complete");
        }
        Ok(scanned)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Shared Fold Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Fold a slice of events through one projection, in memory.
///
/// The replay engine uses this to rebuild state at a point in time with
/// the exact folds the live engine runs.
pub fn fold_events(projection: &dyn Projection, events: &[DomainEvent]) -> Value {
    let mut state = projection.initial_state();
    for event in events {
        if projection.entity_id(event).is_some() {
            state = projection.apply(state, event);
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::envelope::{Actor, Tags};
    use serde_json::json;

    struct CountingProjection;

    impl Projection for CountingProjection {
        fn name(&self) -> &'static str {
            "event-count"
        }

        fn entity_id(&self, event: &DomainEvent) -> Option<String> {
            event.tag("issueId").map(String::from)
        }

        fn initial_state(&self) -> Value {
            json!({"count": 0})
        }

        fn apply(&self, state: Value, _event: &DomainEvent) -> Value {
            let count = state["count"].as_i64().unwrap_or(0);
            json!({"count": count + 1})
        }
    }

    fn tagged_event(issue: &str) -> DomainEvent {
        DomainEvent {
            id: EventId::new(),
            event_type: "ISSUE.SELECTED".into(),
            timestamp: Utc::now(),
            schema_version: 1,
            actor: Actor::user("alice"),
            tags: [("issueId".to_string(), issue.to_string())].into(),
            payload: json!({"issueId": issue}),
            metadata: None,
        }
    }

    #[test]
    fn test_fold_events_is_deterministic() {
        let projection = CountingProjection;
        let events = vec![tagged_event("1"), tagged_event("1"), tagged_event("1")];
        let a = fold_events(&projection, &events);
        let b = fold_events(&projection, &events);
        assert_eq!(a, b);
        assert_eq!(a["count"], 3);
    }

    #[test]
    fn test_fold_skips_events_without_entity() {
        let projection = CountingProjection;
        let mut untagged = tagged_event("1");
        untagged.tags = Tags::new();
        let events = vec![tagged_event("1"), untagged];
        let state = fold_events(&projection, &events);
        assert_eq!(state["count"], 1);
    }
}
