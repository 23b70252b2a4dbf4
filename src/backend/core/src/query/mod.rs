//! The read surface.
//!
//! All reads go through `QueryService`: it enforces actor scoping,
//! clamps pagination, applies caller deadlines, and routes historical
//! projection reads through the replay engine so `as_of` answers come
//! from the same folds as live state.

pub mod export;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::config::QueryConfig;
use crate::error::{ChronicleError, ErrorCode, Result};
use crate::events::envelope::{tag, DomainEvent, EventId};
use crate::pagination::{PageMeta, PageRequest};
use crate::replay::{ReplayEngine, ReplayOptions, ReplayResult, Selector};
use crate::storage::{EventFilter, StorageBackend, StoreStats};

// ═══════════════════════════════════════════════════════════════════════════════
// Caller Identity
// ═══════════════════════════════════════════════════════════════════════════════

/// Opaque identity handed in by the outer authentication layer. The
/// store never issues or verifies credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: CallerRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallerRole {
    /// May only read events their own actor id produced.
    Standard,
    /// Unrestricted reads plus export.
    Elevated,
}

impl Caller {
    pub fn elevated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: CallerRole::Elevated,
        }
    }

    pub fn standard(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: CallerRole::Standard,
        }
    }

    pub fn is_elevated(&self) -> bool {
        self.role == CallerRole::Elevated
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Summary Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregate view of one correlation's events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationSummary {
    pub correlation_id: String,
    pub event_count: u64,
    pub distinct_types: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A projection read, live or historical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionView {
    pub name: String,
    pub entity_id: String,
    pub state: Value,
    /// Set when the state was reconstructed for a historical timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

pub struct QueryService {
    backend: Arc<dyn StorageBackend>,
    replay: Arc<ReplayEngine>,
    config: QueryConfig,
}

impl QueryService {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        replay: Arc<ReplayEngine>,
        config: QueryConfig,
    ) -> Self {
        Self {
            backend,
            replay,
            config,
        }
    }

    /// Non-elevated callers are silently narrowed to their own events.
    fn scope_filter(&self, caller: &Caller, mut filter: EventFilter) -> EventFilter {
        if !caller.is_elevated() {
            filter.actor_id = Some(caller.id.clone());
        }
        filter
    }

    /// Run a future under the caller's deadline. A timeout surfaces as a
    /// dedicated error, never as an empty result.
    async fn with_deadline<T>(
        &self,
        deadline: Option<Duration>,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let deadline = deadline.unwrap_or(self.config.default_deadline);
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChronicleError::query_timeout(deadline.as_millis() as u64)),
        }
    }

    #[instrument(skip(self, caller, filter, page), fields(caller = %caller.id))]
    pub async fn get_events(
        &self,
        caller: &Caller,
        filter: EventFilter,
        page: PageRequest,
        deadline: Option<Duration>,
    ) -> Result<(Vec<DomainEvent>, PageMeta)> {
        let filter = self.scope_filter(caller, filter);
        let (limit, offset) = page.clamp(self.config.default_limit, self.config.max_limit);

        let result = self
            .with_deadline(deadline, self.backend.query_events(&filter, limit, offset))
            .await?;

        let meta = PageMeta::new(result.total, limit, offset, result.events.len());
        Ok((result.events, meta))
    }

    pub async fn get_event_by_id(&self, caller: &Caller, id: EventId) -> Result<DomainEvent> {
        let event = self
            .backend
            .get_event(id)
            .await?
            .ok_or_else(|| ChronicleError::not_found("event", id.to_string()))?;

        // scoping treats an out-of-scope event as absent rather than
        // revealing that it exists
        if !caller.is_elevated() && event.actor.id != caller.id {
            return Err(ChronicleError::not_found("event", id.to_string()));
        }
        Ok(event)
    }

    /// Every event for one correlation plus a summary.
    ///
    /// The whole correlation is streamed rather than paged so the
    /// summary reflects every event, not just the first page.
    #[instrument(skip(self, caller), fields(caller = %caller.id))]
    pub async fn get_correlation(
        &self,
        caller: &Caller,
        correlation_id: &str,
    ) -> Result<(Vec<DomainEvent>, CorrelationSummary)> {
        let mut filter = EventFilter::default();
        filter
            .tags
            .insert(tag::CORRELATION_ID.to_string(), correlation_id.to_string());
        let filter = self.scope_filter(caller, filter);

        let events: Vec<DomainEvent> = self.backend.stream_events(filter).try_collect().await?;

        let distinct_types: BTreeSet<String> = events
            .iter()
            .map(|e| e.event_type.clone())
            .collect();

        let summary = CorrelationSummary {
            correlation_id: correlation_id.to_string(),
            event_count: events.len() as u64,
            distinct_types: distinct_types.into_iter().collect(),
            started_at: events.first().map(|e| e.timestamp),
            ended_at: events.last().map(|e| e.timestamp),
        };

        Ok((events, summary))
    }

    /// Reconstruct past state under the caller's deadline. Replays walk
    /// the whole matching slice, so they honor the same timeout contract
    /// as paged queries.
    #[instrument(skip(self, options, deadline), fields(selector = %selector))]
    pub async fn replay(
        &self,
        selector: &Selector,
        options: &ReplayOptions,
        deadline: Option<Duration>,
    ) -> Result<ReplayResult> {
        self.with_deadline(deadline, self.replay.reconstruct(selector, options))
            .await
    }

    /// Current or historical projection state.
    ///
    /// With `as_of`, the live record is ignored and the state is
    /// reconstructed through the replay engine so the answer reflects
    /// exactly the events up to that instant.
    #[instrument(skip(self, deadline))]
    pub async fn get_projection(
        &self,
        name: &str,
        entity_id: &str,
        as_of: Option<DateTime<Utc>>,
        deadline: Option<Duration>,
    ) -> Result<ProjectionView> {
        if let Some(as_of) = as_of {
            let selector = selector_for_projection(name, entity_id)?;
            let result = self
                .replay(
                    &selector,
                    &ReplayOptions {
                        as_of: Some(as_of),
                        ..ReplayOptions::default()
                    },
                    deadline,
                )
                .await?;

            let state = result
                .states
                .get(name)
                .and_then(|entities| entities.get(entity_id))
                .cloned()
                .ok_or_else(|| {
                    ChronicleError::not_found("projection", format!("{}/{}", name, entity_id))
                })?;

            return Ok(ProjectionView {
                name: name.to_string(),
                entity_id: entity_id.to_string(),
                state,
                as_of: Some(as_of),
            });
        }

        let record = self
            .backend
            .load_projection(name, entity_id)
            .await?
            .ok_or_else(|| {
                ChronicleError::not_found("projection", format!("{}/{}", name, entity_id))
            })?;

        Ok(ProjectionView {
            name: record.name,
            entity_id: record.entity_id,
            state: record.state,
            as_of: None,
        })
    }

    /// Every materialized entity of one projection, ordered by entity id.
    pub async fn list_projections(&self, name: &str) -> Result<Vec<ProjectionView>> {
        let records = self.backend.list_projections(name).await?;
        Ok(records
            .into_iter()
            .map(|record| ProjectionView {
                name: record.name,
                entity_id: record.entity_id,
                state: record.state,
                as_of: None,
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.backend.stats().await
    }

    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }
}

/// Which tag keys a projection is keyed by. Historical reads need this
/// to turn `(projection, entity)` back into a replay selector.
fn selector_for_projection(name: &str, entity_id: &str) -> Result<Selector> {
    match name {
        "issue-status" => Ok(Selector::Issue(entity_id.to_string())),
        "pr-state" => Ok(Selector::Pr(entity_id.to_string())),
        "workflow-run" => Ok(Selector::Correlation(entity_id.to_string())),
        _ => Err(ChronicleError::new(
            ErrorCode::ProjectionNotFound,
            format!("unknown projection: {}", name),
        )),
    }
}
