use anyhow::Result;
use axum::{middleware, routing::get, Router};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    config::{Config, ServerConfig},
    handlers::{self, AppState},
    metrics,
    middleware::profiling_middleware,
    profiler::{store::spawn_retention_task, PersistenceSettings, ProfileSink, Profiler, SqliteProfileStore},
    signals::setup_signal_handlers,
};

const RETENTION_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Start the dashboard server
///
/// This function:
/// 1. Initializes metrics
/// 2. Opens the profile store (when persistence is enabled)
/// 3. Starts the profiler and its background tasks
/// 4. Sets up signal handlers for graceful shutdown and config reload
/// 5. Serves requests until shutdown, then drains the profiler
pub async fn start_server(mut config: Config, config_path: PathBuf) -> Result<()> {
    config.exclude_monitor_prefix();

    info!("Initializing Prometheus metrics...");
    let metrics_handle = Arc::new(metrics::init_metrics()?);

    let store = if config.persistence.enabled {
        Some(Arc::new(SqliteProfileStore::open(&config.persistence.database_url).await?))
    } else {
        info!("Persistence disabled; history endpoints will be unavailable");
        None
    };

    let sink = store.clone().map(|s| s as Arc<dyn ProfileSink>);
    let profiler = Profiler::init_with(
        config.profiler.clone(),
        sink,
        PersistenceSettings::from(&config.persistence),
    );

    // SIGTERM/SIGINT for shutdown; SIGHUP reloads profiler thresholds
    let (shutdown_tx, signal_handle) = setup_signal_handlers(config_path, profiler.clone());
    let mut shutdown_rx = shutdown_tx.subscribe();

    let retention_handle = store.as_ref().map(|store| {
        spawn_retention_task(
            store.clone(),
            config.persistence.retention_days,
            RETENTION_CHECK_INTERVAL,
            shutdown_tx.subscribe(),
        )
    });

    let state = AppState {
        profiler: profiler.clone(),
        store,
        metrics: metrics_handle,
    };
    let app = create_router(&config.server, state);

    let addr = SocketAddr::from((config.server.host.parse::<std::net::IpAddr>()?, config.server.port));

    info!("Starting profileboard on {}", addr);
    info!(
        "Dashboard API under {}, n+1 threshold {}, slow query {}ms",
        config.server.monitor_prefix, config.profiler.n_query_threshold, config.profiler.slow_query_ms
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Shutdown signal received, draining connections...");
        })
        .await?;

    signal_handle.await?;
    if let Some(handle) = retention_handle {
        handle.await?;
    }
    profiler.shutdown().await;
    info!("Server stopped gracefully");

    Ok(())
}

/// Create the Axum router with the dashboard API and profiling middleware
///
/// Requests under the monitor prefix are excluded from profiling by the
/// default path exclusions.
pub fn create_router(server: &ServerConfig, state: AppState) -> Router {
    let monitor_routes = Router::new()
        .route("/stream", get(handlers::stream::stream_profiles))
        .route("/profiles", get(handlers::profiles::list_profiles))
        .route("/profiles/:id", get(handlers::profiles::get_profile))
        .route("/export", get(handlers::profiles::export_profiles))
        .route("/stats", get(handlers::stats::get_stats))
        .route(
            "/profiler",
            get(handlers::toggle::get_profiler_state).post(handlers::toggle::set_profiler_state),
        );

    let profiler = state.profiler.clone();

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics_handler::metrics))
        .nest(&server.monitor_prefix, monitor_routes)
        .with_state(state)
        .layer(middleware::from_fn_with_state(profiler, profiling_middleware))
        .layer(TraceLayer::new_for_http())
}
