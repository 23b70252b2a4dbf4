//! Request handlers for the versioned API.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::auth::CallerIdentity;
use super::{ApiResponse, AppState};
use crate::error::{ChronicleError, ErrorCode, Result};
use crate::events::envelope::{tag, DomainEvent, EventId, NewEvent};
use crate::pagination::{PageMeta, PageRequest};
use crate::query::export::{ExportJob, ExportRequest};
use crate::query::CorrelationSummary;
use crate::storage::EventFilter;

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEventsParams {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub correlation_id: Option<String>,
    pub issue_id: Option<String>,
    pub pr_id: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u64>,
    /// Caller-supplied deadline in milliseconds.
    pub deadline_ms: Option<u64>,
}

impl ListEventsParams {
    fn into_filter(self) -> (EventFilter, PageRequest, Option<Duration>) {
        let mut filter = EventFilter {
            since: self.since,
            until: self.until,
            event_type: self.event_type,
            ..EventFilter::default()
        };
        if let Some(id) = self.correlation_id {
            filter.tags.insert(tag::CORRELATION_ID.to_string(), id);
        }
        if let Some(id) = self.issue_id {
            filter.tags.insert(tag::ISSUE_ID.to_string(), id);
        }
        if let Some(id) = self.pr_id {
            filter.tags.insert(tag::PR_ID.to_string(), id);
        }
        let page = PageRequest {
            limit: self.limit,
            offset: self.offset,
        };
        let deadline = self.deadline_ms.map(Duration::from_millis);
        (filter, page, deadline)
    }
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<DomainEvent>,
    pub page: PageMeta,
}

pub async fn append_event(
    State(state): State<AppState>,
    CallerIdentity(_caller): CallerIdentity,
    Json(new): Json<NewEvent>,
) -> Result<impl IntoResponse> {
    let event = state.store.append(new).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(event))))
}

pub async fn append_batch(
    State(state): State<AppState>,
    CallerIdentity(_caller): CallerIdentity,
    Json(batch): Json<Vec<NewEvent>>,
) -> Result<impl IntoResponse> {
    let events = state.store.append_batch(batch).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(events))))
}

pub async fn list_events(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Query(params): Query<ListEventsParams>,
) -> Result<impl IntoResponse> {
    let (filter, page, deadline) = params.into_filter();
    let (events, meta) = state.query.get_events(&caller, filter, page, deadline).await?;
    Ok(Json(ApiResponse::success(EventListResponse {
        events,
        page: meta,
    })))
}

pub async fn get_event(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id = EventId::parse(&id)
        .ok_or_else(|| ChronicleError::new(ErrorCode::InvalidInput, "malformed event id"))?;
    let event = state.query.get_event_by_id(&caller, id).await?;
    Ok(Json(ApiResponse::success(event)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationResponse {
    pub events: Vec<DomainEvent>,
    pub summary: CorrelationSummary,
}

pub async fn get_correlation(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(correlation_id): Path<String>,
) -> Result<impl IntoResponse> {
    let (events, summary) = state.query.get_correlation(&caller, &correlation_id).await?;
    Ok(Json(ApiResponse::success(CorrelationResponse {
        events,
        summary,
    })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Projections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionParams {
    /// Historical read: reconstruct state as of this instant.
    pub timestamp: Option<DateTime<Utc>>,
    pub deadline_ms: Option<u64>,
}

pub async fn list_projections(
    State(state): State<AppState>,
    CallerIdentity(_caller): CallerIdentity,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let views = state.query.list_projections(&name).await?;
    Ok(Json(ApiResponse::success(views)))
}

pub async fn get_projection(
    State(state): State<AppState>,
    CallerIdentity(_caller): CallerIdentity,
    Path((name, entity_id)): Path<(String, String)>,
    Query(params): Query<ProjectionParams>,
) -> Result<impl IntoResponse> {
    let deadline = params.deadline_ms.map(Duration::from_millis);
    let view = state
        .query
        .get_projection(&name, &entity_id, params.timestamp, deadline)
        .await?;
    Ok(Json(ApiResponse::success(view)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Blobs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobStoredResponse {
    pub blob_id: String,
}

pub async fn store_blob(
    State(state): State<AppState>,
    CallerIdentity(_caller): CallerIdentity,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let blob_id = state.blobs.store(&body, content_type).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(BlobStoredResponse { blob_id })),
    ))
}

pub async fn get_blob(
    State(state): State<AppState>,
    CallerIdentity(_caller): CallerIdentity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let blob = state
        .blobs
        .retrieve(&id)
        .await?
        .ok_or_else(|| ChronicleError::not_found("blob", &id))?;
    Ok((
        [(header::CONTENT_TYPE, blob.content_type)],
        blob.data,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Export
// ─────────────────────────────────────────────────────────────────────────────

pub async fn start_export(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Json(request): Json<ExportRequest>,
) -> Result<impl IntoResponse> {
    let job = state.export.start(&caller, request)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::<ExportJob>::success(job)),
    ))
}

pub async fn get_export(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let job = state.export.get(&caller, id)?;
    Ok(Json(ApiResponse::success(job)))
}

pub async fn download_export(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let (format, bundle) = state.export.download(&caller, id)?;
    Ok((
        [(header::CONTENT_TYPE, format.content_type())],
        bundle,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayParams {
    pub correlation_id: Option<String>,
    pub issue_id: Option<String>,
    pub pr_id: Option<String>,
    pub as_of: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub strict: Option<bool>,
    pub deadline_ms: Option<u64>,
}

impl ReplayParams {
    fn into_request(
        self,
    ) -> Result<(
        crate::replay::Selector,
        crate::replay::ReplayOptions,
        Option<Duration>,
    )> {
        use crate::replay::Selector;

        let selector = match (self.correlation_id, self.issue_id, self.pr_id) {
            (Some(id), None, None) => Selector::Correlation(id),
            (None, Some(id), None) => Selector::Issue(id),
            (None, None, Some(id)) => Selector::Pr(id),
            _ => {
                return Err(ChronicleError::new(
                    ErrorCode::InvalidInput,
                    "exactly one of correlationId, issueId, prId is required",
                ))
            }
        };

        Ok((
            selector,
            crate::replay::ReplayOptions {
                as_of: self.as_of,
                event_type: self.event_type,
                strict_blobs: self.strict,
            },
            self.deadline_ms.map(Duration::from_millis),
        ))
    }
}

pub async fn replay(
    State(state): State<AppState>,
    CallerIdentity(_caller): CallerIdentity,
    Query(params): Query<ReplayParams>,
) -> Result<impl IntoResponse> {
    let (selector, options, deadline) = params.into_request()?;
    let result = state.query.replay(&selector, &options, deadline).await?;
    Ok(Json(ApiResponse::success(result)))
}

pub async fn replay_report(
    State(state): State<AppState>,
    CallerIdentity(_caller): CallerIdentity,
    Query(params): Query<ReplayParams>,
) -> Result<impl IntoResponse> {
    let (selector, options, deadline) = params.into_request()?;
    let result = state.query.replay(&selector, &options, deadline).await?;
    let markdown = crate::replay::report::render_markdown(&result);
    Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], markdown))
}

// ─────────────────────────────────────────────────────────────────────────────
// Stats / Health / Metrics
// ─────────────────────────────────────────────────────────────────────────────

pub async fn get_stats(
    State(state): State<AppState>,
    CallerIdentity(_caller): CallerIdentity,
) -> Result<impl IntoResponse> {
    let stats = state.query.stats().await?;
    Ok(Json(ApiResponse::success(stats)))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health(State(state): State<AppState>) -> Result<impl IntoResponse> {
    state.query.ping().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics_handle.render()
}
