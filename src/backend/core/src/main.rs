//! chronicle-server: HTTP front end for the event store.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;

use chronicle_core::api::{build_router, AppState};
use chronicle_core::blobs::BlobStore;
use chronicle_core::config::{Config, ProjectionMode};
use chronicle_core::events::schema::default_registry;
use chronicle_core::events::store::EventStore;
use chronicle_core::masking::SecretMasker;
use chronicle_core::observability;
use chronicle_core::projections::views::default_views;
use chronicle_core::projections::ProjectionEngine;
use chronicle_core::query::export::ExportService;
use chronicle_core::query::QueryService;
use chronicle_core::replay::ReplayEngine;
use chronicle_core::retention::RetentionSweeper;
use chronicle_core::storage::open_backend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load().context("failed to load configuration")?;
    observability::init(&config.observability)?;
    let metrics_handle = observability::install_prometheus()?;

    info!(
        backend = ?config.storage.backend,
        port = config.server.port,
        "starting chronicle-server"
    );

    let backend = open_backend(&config).await?;
    let masker = Arc::new(SecretMasker::new());

    let mut registry = default_registry();
    if config.schema.permissive {
        registry = registry.permissive();
    }

    let projections = ProjectionEngine::new(
        Arc::clone(&backend),
        default_views(),
        &config.projections,
    );
    if config.projections.mode == ProjectionMode::Async {
        // catch projections up with anything appended before a crash
        projections.recover().await?;
    }

    let blobs = Arc::new(BlobStore::new(
        Arc::clone(&backend),
        Arc::clone(&masker),
        config.retention.blob_ttl,
    ));
    let store = Arc::new(EventStore::new(
        Arc::clone(&backend),
        registry,
        masker,
        Arc::clone(&projections),
    ));
    let replay = Arc::new(ReplayEngine::new(
        Arc::clone(&backend),
        Arc::clone(&blobs),
        default_views(),
        config.replay.clone(),
    ));
    let query = Arc::new(QueryService::new(
        Arc::clone(&backend),
        replay,
        config.query.clone(),
    ));
    let export = Arc::new(ExportService::new(Arc::clone(&backend)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = RetentionSweeper::new(
        Arc::clone(&backend),
        Arc::clone(&blobs),
        config.retention.clone(),
    );
    let sweeper_handle = sweeper.spawn(shutdown_rx);

    let state = AppState {
        store,
        blobs,
        query,
        export,
        metrics_handle,
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "chronicle-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = sweeper_handle.await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
