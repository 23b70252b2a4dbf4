//! Deterministic replay.
//!
//! Replay answers "what did the system know, and when" for one workflow
//! run, issue, or pull request: resolve the selector to a tag filter,
//! stream the matching events chronologically, resolve referenced blobs
//! up front and in parallel, then fold the events through the same
//! projection folds the live engine runs. Identical inputs produce
//! byte-identical output; every collection in the result is ordered.

pub mod report;

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

use crate::blobs::BlobStore;
use crate::config::ReplayConfig;
use crate::error::{ChronicleError, ErrorCode, Result};
use crate::events::envelope::{tag, DomainEvent};
use crate::observability::metrics;
use crate::projections::Projection;
use crate::storage::{EventFilter, StorageBackend};

// ═══════════════════════════════════════════════════════════════════════════════
// Selector
// ═══════════════════════════════════════════════════════════════════════════════

/// What to replay. Each variant names the tag the events must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum Selector {
    Correlation(String),
    Issue(String),
    Pr(String),
}

impl Selector {
    pub fn tag_key(&self) -> &'static str {
        match self {
            Self::Correlation(_) => tag::CORRELATION_ID,
            Self::Issue(_) => tag::ISSUE_ID,
            Self::Pr(_) => tag::PR_ID,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Self::Correlation(id) | Self::Issue(id) | Self::Pr(id) => id,
        }
    }

    fn to_filter(&self, options: &ReplayOptions) -> EventFilter {
        let mut filter = EventFilter {
            until: options.as_of,
            event_type: options.event_type.clone(),
            ..EventFilter::default()
        };
        filter
            .tags
            .insert(self.tag_key().to_string(), self.entity_id().to_string());
        filter
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Correlation(id) => write!(f, "correlationId={}", id),
            Self::Issue(id) => write!(f, "issueId={}", id),
            Self::Pr(id) => write!(f, "prId={}", id),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Reconstruct state as of this instant; `None` means now.
    pub as_of: Option<DateTime<Utc>>,

    /// Restrict the timeline to one event type.
    pub event_type: Option<String>,

    /// Override the configured blob strictness.
    pub strict_blobs: Option<bool>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Result Types
// ═══════════════════════════════════════════════════════════════════════════════

/// A blob reference after resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ResolvedBlob {
    Resolved {
        blob_id: String,
        content_type: String,
        size_bytes: u64,
        /// Present for textual content; binary blobs carry metadata only.
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Visible placeholder for a blob the store no longer has.
    Missing { blob_id: String },
}

impl ResolvedBlob {
    pub fn blob_id(&self) -> &str {
        match self {
            Self::Resolved { blob_id, .. } | Self::Missing { blob_id } => blob_id,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing { .. })
    }
}

/// One step of the reconstructed timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub event: DomainEvent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blobs: Vec<ResolvedBlob>,
}

/// Complete reconstruction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult {
    pub selector: Selector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub as_of: Option<DateTime<Utc>>,
    pub event_count: u64,
    pub missing_blob_count: u64,
    /// `projection name -> entity id -> state`, every level ordered.
    pub states: BTreeMap<String, BTreeMap<String, Value>>,
    pub timeline: Vec<TimelineEntry>,
    pub warnings: Vec<String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine
// ═══════════════════════════════════════════════════════════════════════════════

pub struct ReplayEngine {
    backend: Arc<dyn StorageBackend>,
    blobs: Arc<BlobStore>,
    projections: Vec<Arc<dyn Projection>>,
    config: ReplayConfig,
}

impl ReplayEngine {
    /// `projections` must be the same folds the live engine registers,
    /// or replayed state and live state will disagree.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        blobs: Arc<BlobStore>,
        projections: Vec<Arc<dyn Projection>>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            backend,
            blobs,
            projections,
            config,
        }
    }

    /// Reconstruct state and timeline for a selector.
    ///
    /// Errors: `NO_EVENTS_FOR_SELECTOR` when nothing matches (distinct
    /// from a replay that found events but lost blobs), and
    /// `REPLAY_INCOMPLETE` when blobs are missing under strict mode.
    #[instrument(skip(self, options), fields(selector = %selector))]
    pub async fn reconstruct(
        &self,
        selector: &Selector,
        options: &ReplayOptions,
    ) -> Result<ReplayResult> {
        let started = Instant::now();
        let filter = selector.to_filter(options);

        let events: Vec<DomainEvent> = self
            .backend
            .stream_events(filter)
            .try_collect()
            .await?;

        if events.is_empty() {
            return Err(ChronicleError::new(
                ErrorCode::NoEventsForSelector,
                format!("no events recorded for {}", selector),
            ));
        }

        let resolved = self.resolve_blobs(&events).await?;
        let missing: Vec<&str> = resolved
            .iter()
            .filter_map(|(id, blob)| blob.is_none().then_some(id.as_str()))
            .collect();

        let strict = options.strict_blobs.unwrap_or(self.config.strict_blobs);
        if strict && !missing.is_empty() {
            return Err(ChronicleError::replay_incomplete(missing.len()));
        }

        let mut warnings = Vec::new();
        for blob_id in &missing {
            warn!(blob_id, selector = %selector, "referenced blob unavailable during replay");
            warnings.push(format!("blob {} is unavailable; content omitted", blob_id));
        }

        let timeline: Vec<TimelineEntry> = events
            .iter()
            .map(|event| TimelineEntry {
                event: event.clone(),
                blobs: event
                    .blob_refs()
                    .into_iter()
                    .map(|blob_id| resolve_entry(&blob_id, &resolved))
                    .collect(),
            })
            .collect();

        let states = self.fold_states(&events);

        let result = ReplayResult {
            selector: selector.clone(),
            as_of: options.as_of,
            event_count: events.len() as u64,
            missing_blob_count: missing.len() as u64,
            states,
            timeline,
            warnings,
        };

        metrics::record_replay(
            result.event_count,
            result.missing_blob_count,
            started.elapsed().as_secs_f64(),
        );
        info!(
            events = result.event_count,
            missing_blobs = result.missing_blob_count,
            "replay reconstruction complete"
        );
        Ok(result)
    }

    /// Fetch every referenced blob once, concurrently. The result map is
    /// keyed by blob id; `None` marks a miss.
    async fn resolve_blobs(
        &self,
        events: &[DomainEvent],
    ) -> Result<BTreeMap<String, Option<crate::blobs::BlobRecord>>> {
        let mut ids: Vec<String> = events.iter().flat_map(|e| e.blob_refs()).collect();
        ids.sort();
        ids.dedup();

        let fetches = futures::stream::iter(ids.into_iter().map(|id| {
            let blobs = Arc::clone(&self.blobs);
            async move {
                let record = blobs.retrieve(&id).await?;
                Ok::<_, ChronicleError>((id, record))
            }
        }))
        .buffer_unordered(self.config.blob_concurrency.max(1));

        fetches.try_collect().await
    }

    /// Fold the event slice through every registered projection, grouped
    /// by the entity each event maps to.
    fn fold_states(&self, events: &[DomainEvent]) -> BTreeMap<String, BTreeMap<String, Value>> {
        let mut states: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for projection in &self.projections {
            let mut entities: BTreeMap<String, Value> = BTreeMap::new();
            for event in events {
                let Some(entity_id) = projection.entity_id(event) else {
                    continue;
                };
                let state = entities
                    .entry(entity_id)
                    .or_insert_with(|| projection.initial_state());
                *state = projection.apply(state.take(), event);
            }
            if !entities.is_empty() {
                states.insert(projection.name().to_string(), entities);
            }
        }
        states
    }
}

fn resolve_entry(
    blob_id: &str,
    resolved: &BTreeMap<String, Option<crate::blobs::BlobRecord>>,
) -> ResolvedBlob {
    match resolved.get(blob_id) {
        Some(Some(record)) => ResolvedBlob::Resolved {
            blob_id: record.id.clone(),
            content_type: record.content_type.clone(),
            size_bytes: record.size_bytes,
            text: String::from_utf8(record.data.clone()).ok(),
        },
        _ => ResolvedBlob::Missing {
            blob_id: blob_id.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectionsConfig;
    use crate::events::envelope::{Actor, NewEvent};
    use crate::events::schema::default_registry;
    use crate::events::store::EventStore;
    use crate::masking::SecretMasker;
    use crate::projections::views::default_views;
    use crate::projections::ProjectionEngine;
    use crate::storage::file::FileBackend;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: EventStore,
        blobs: Arc<BlobStore>,
        engine: ReplayEngine,
    }

    fn fixture(strict: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn StorageBackend> =
            Arc::new(FileBackend::open(dir.path()).unwrap());
        let masker = Arc::new(SecretMasker::new());
        let blobs = Arc::new(BlobStore::new(
            Arc::clone(&backend),
            Arc::clone(&masker),
            std::time::Duration::from_secs(3600),
        ));
        let projections = ProjectionEngine::new(
            Arc::clone(&backend),
            default_views(),
            &ProjectionsConfig::default(),
        );
        let store = EventStore::new(
            Arc::clone(&backend),
            default_registry(),
            masker,
            projections,
        );
        let engine = ReplayEngine::new(
            backend,
            Arc::clone(&blobs),
            default_views(),
            ReplayConfig {
                strict_blobs: strict,
                blob_concurrency: 4,
            },
        );
        Fixture {
            _dir: dir,
            store,
            blobs,
            engine,
        }
    }

    async fn seed_pr_run(fx: &Fixture, correlation: &str) -> String {
        let blob_id = fx
            .blobs
            .store(b"diff --git a/lib.rs b/lib.rs\n+fixed", "text/x-diff")
            .await
            .unwrap();

        fx.store
            .append(
                NewEvent::new(
                    "PR.CREATED",
                    Actor::user("alice"),
                    json!({"prId": "7", "issueId": "42"}),
                )
                .with_correlation(correlation)
                .with_tag("prId", "7"),
            )
            .await
            .unwrap();
        fx.store
            .append(
                NewEvent::new(
                    "PR.DIFF.CAPTURED",
                    Actor::system("capture"),
                    json!({"prId": "7", "blobId": blob_id}),
                )
                .with_correlation(correlation)
                .with_tag("prId", "7"),
            )
            .await
            .unwrap();
        blob_id
    }

    #[tokio::test]
    async fn test_no_events_for_selector_is_distinct() {
        let fx = fixture(false);
        let err = fx
            .engine
            .reconstruct(
                &Selector::Correlation("c-nothing".into()),
                &ReplayOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoEventsForSelector);
    }

    #[tokio::test]
    async fn test_reconstruct_resolves_blobs_and_folds_state() {
        let fx = fixture(false);
        let blob_id = seed_pr_run(&fx, "c-run-1").await;

        let result = fx
            .engine
            .reconstruct(
                &Selector::Correlation("c-run-1".into()),
                &ReplayOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.event_count, 2);
        assert_eq!(result.missing_blob_count, 0);

        let diff_entry = &result.timeline[1];
        assert_eq!(diff_entry.blobs.len(), 1);
        match &diff_entry.blobs[0] {
            ResolvedBlob::Resolved { text, .. } => {
                assert!(text.as_deref().unwrap().contains("diff --git"));
            }
            other => panic!("expected resolved blob, got {:?}", other),
        }

        let pr_state = &result.states["pr-state"]["7"];
        assert_eq!(pr_state["status"], "open");
        assert_eq!(pr_state["diffBlobIds"], json!([blob_id]));
    }

    #[tokio::test]
    async fn test_replay_is_deterministic() {
        let fx = fixture(false);
        seed_pr_run(&fx, "c-run-2").await;

        let selector = Selector::Correlation("c-run-2".into());
        let a = fx
            .engine
            .reconstruct(&selector, &ReplayOptions::default())
            .await
            .unwrap();
        let b = fx
            .engine
            .reconstruct(&selector, &ReplayOptions::default())
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[tokio::test]
    async fn test_replayed_state_matches_live_projection() {
        let fx = fixture(false);
        seed_pr_run(&fx, "c-run-live").await;

        let live = fx
            .engine
            .backend
            .load_projection("pr-state", "7")
            .await
            .unwrap()
            .unwrap();

        let result = fx
            .engine
            .reconstruct(
                &Selector::Pr("7".into()),
                &ReplayOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.states["pr-state"]["7"], live.state);
    }

    #[tokio::test]
    async fn test_missing_blob_soft_mode_placeholder() {
        let fx = fixture(false);
        let blob_id = seed_pr_run(&fx, "c-run-3").await;
        fx.engine.backend.delete_blob(&blob_id).await.unwrap();

        let result = fx
            .engine
            .reconstruct(
                &Selector::Correlation("c-run-3".into()),
                &ReplayOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.missing_blob_count, 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.timeline[1].blobs[0].is_missing());
    }

    #[tokio::test]
    async fn test_missing_blob_strict_mode_fails() {
        let fx = fixture(true);
        let blob_id = seed_pr_run(&fx, "c-run-4").await;
        fx.engine.backend.delete_blob(&blob_id).await.unwrap();

        let err = fx
            .engine
            .reconstruct(
                &Selector::Correlation("c-run-4".into()),
                &ReplayOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReplayIncomplete);
    }

    #[tokio::test]
    async fn test_as_of_excludes_later_events() {
        let fx = fixture(false);
        seed_pr_run(&fx, "c-run-5").await;
        let cutoff = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        fx.store
            .append(
                NewEvent::new(
                    "PR.MERGED",
                    Actor::user("alice"),
                    json!({"prId": "7"}),
                )
                .with_correlation("c-run-5")
                .with_tag("prId", "7"),
            )
            .await
            .unwrap();

        let full = fx
            .engine
            .reconstruct(
                &Selector::Correlation("c-run-5".into()),
                &ReplayOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(full.event_count, 3);
        assert_eq!(full.states["pr-state"]["7"]["status"], "merged");

        let historical = fx
            .engine
            .reconstruct(
                &Selector::Correlation("c-run-5".into()),
                &ReplayOptions {
                    as_of: Some(cutoff),
                    ..ReplayOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(historical.event_count, 2);
        assert_eq!(historical.states["pr-state"]["7"]["status"], "open");
    }

    #[tokio::test]
    async fn test_issue_selector_scopes_by_tag() {
        let fx = fixture(false);
        fx.store
            .append(
                NewEvent::new(
                    "ISSUE.SELECTED",
                    Actor::user("alice"),
                    json!({"issueId": "42"}),
                )
                .with_tag("issueId", "42"),
            )
            .await
            .unwrap();
        fx.store
            .append(
                NewEvent::new(
                    "ISSUE.SELECTED",
                    Actor::user("bob"),
                    json!({"issueId": "99"}),
                )
                .with_tag("issueId", "99"),
            )
            .await
            .unwrap();

        let result = fx
            .engine
            .reconstruct(&Selector::Issue("42".into()), &ReplayOptions::default())
            .await
            .unwrap();
        assert_eq!(result.event_count, 1);
    }
}
