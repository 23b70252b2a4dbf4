//! HTTP API surface.

pub mod auth;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::blobs::BlobStore;
use crate::events::store::EventStore;
use crate::query::export::ExportService;
use crate::query::QueryService;

/// Shared application state. Replay is reached through the query
/// service so every replay runs under the caller deadline.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<EventStore>,
    pub blobs: Arc<BlobStore>,
    pub query: Arc<QueryService>,
    pub export: Arc<ExportService>,
    pub metrics_handle: PrometheusHandle,
}

/// Standard response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Build the full router: versioned API plus unversioned health and
/// metrics endpoints.
pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        .route("/events", get(handlers::list_events).post(handlers::append_event))
        .route("/events/batch", post(handlers::append_batch))
        .route("/blobs", post(handlers::store_blob))
        .route("/blobs/:id", get(handlers::get_blob))
        .route("/events/export", post(handlers::start_export))
        .route("/events/export/:id", get(handlers::get_export))
        .route("/events/export/:id/download", get(handlers::download_export))
        .route("/events/correlation/:correlation_id", get(handlers::get_correlation))
        .route("/events/:id", get(handlers::get_event))
        .route("/projections/:name", get(handlers::list_projections))
        .route("/projections/:name/:entity_id", get(handlers::get_projection))
        .route("/replay", get(handlers::replay))
        .route("/replay/report", get(handlers::replay_report))
        .route("/stats", get(handlers::get_stats));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .with_state(state)
}
