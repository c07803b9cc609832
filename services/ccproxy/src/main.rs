//! Multi-account reverse proxy for an Anthropic-style `/v1/messages` API.
//!
//! Wires together:
//! - `AccountStore` (sqlite) + `AsyncDbWriter` for persistence
//! - `TokenManager` for OAuth refresh with dedup and backoff
//! - `HealthMonitor` for refresh-credential age classification
//! - `AdapterRegistry` for provider wire-format translation
//! - `Dispatcher` for per-request account selection and forwarding
//! - `AutoRefreshScheduler` for periodic warm-up requests
//!
//! Two HTTP surfaces: the public proxy port forwards `/v1/messages` and
//! friends; the admin port (bound separately, defaults to loopback) exposes
//! account management and `/metrics`.

mod admin;
mod config;
mod error;
mod metrics;

use account_store::AccountStore;
use account_store::writer::AsyncDbWriter;
use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use provider::{AdapterRegistry, AnthropicAdapter};
use proxy_core::dispatcher::Dispatcher;
use proxy_core::post_processor::PostProcessor;
use proxy_core::strategy::{SessionAffinityStrategy, Strategy};
use proxy_core::types::RequestMeta;
use proxy_core::SinkTuning;
use scheduler::{AutoRefreshScheduler, SchedulerTuning};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use token_manager::{HealthMonitor, HealthThresholds, RefreshTuning, TokenManager};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// Shared state for the public proxy surface.
#[derive(Clone)]
struct ProxyAppState {
    dispatcher: Arc<Dispatcher>,
    started_at: Instant,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting ccproxy");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = common::config::cli_config_flag(&args);
    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        admin_listen_addr = %config.proxy.admin_listen_addr,
        database_path = %config.database.path.display(),
        "configuration loaded"
    );

    let prometheus_handle = metrics::install_recorder();

    let store = AccountStore::connect(&config.database.path)
        .await
        .context("failed to open account store")?;
    let writer = AsyncDbWriter::spawn(store.clone());
    let http_client = reqwest::Client::new();

    let refresh_tuning = RefreshTuning {
        safety_window_ms: config.tuning.safety_window_ms,
        backoff_ms: config.tuning.backoff_ms,
        max_backoff_retries: config.tuning.max_backoff_retries,
        failure_ttl: Duration::from_millis(config.tuning.failure_ttl_ms),
        failure_map_cap: config.tuning.max_failure_records,
    };
    let health_thresholds = HealthThresholds {
        poll_interval: Duration::from_millis(config.tuning.health_check_interval_ms),
        warning_days: config.tuning.refresh_token_warning_days as i64,
        critical_days: config.tuning.refresh_token_critical_days as i64,
        max_age_days: config.tuning.refresh_token_max_age_days as i64,
    };
    let sink_tuning = SinkTuning {
        sse_buffer_cap: config.tuning.stream_usage_buffer_bytes,
        orphan_timeout: Duration::from_millis(config.tuning.stream_orphan_timeout_ms),
    };
    let scheduler_tuning = SchedulerTuning {
        tick: Duration::from_secs(config.tuning.scheduler_tick_secs),
        failure_threshold: config.tuning.failure_threshold,
    };

    let token_manager = TokenManager::new(store.clone(), writer.clone(), http_client.clone(), refresh_tuning);
    let health_monitor = HealthMonitor::new(store.clone(), health_thresholds);

    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(AnthropicAdapter));
    let registry = Arc::new(registry);

    let strategy: Arc<dyn Strategy> = Arc::new(SessionAffinityStrategy);
    let post_processor = PostProcessor::spawn(writer.clone(), sink_tuning);

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        writer.clone(),
        token_manager.clone(),
        registry.clone(),
        strategy,
        http_client.clone(),
        post_processor,
        Vec::new(),
    ));

    let scheduler_base_url = format!("http://{}", config.proxy.listen_addr);
    AutoRefreshScheduler::new(
        store.clone(),
        writer.clone(),
        http_client.clone(),
        Arc::new(AnthropicAdapter),
        scheduler_base_url,
        health_monitor.clone(),
        scheduler_tuning,
    );

    let proxy_state = ProxyAppState {
        dispatcher,
        started_at: Instant::now(),
    };
    let proxy_app = Router::new()
        .route("/health", get(health_handler))
        .fallback(proxy_handler)
        .with_state(proxy_state);

    let admin_state = admin::AdminState::new(store, health_monitor, http_client);
    let metrics_router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);
    let admin_app = admin::build_admin_router(admin_state).merge(metrics_router);

    let proxy_listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;
    let admin_listener = TcpListener::bind(config.proxy.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.admin_listen_addr))?;

    info!(addr = %config.proxy.listen_addr, "proxy listening");
    info!(addr = %config.proxy.admin_listen_addr, "admin listening");

    let proxy_server = axum::serve(proxy_listener, proxy_app).with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { proxy_server.await.context("proxy server error") },
        async { admin_server.await.context("admin server error") },
    )?;

    info!("shutdown complete");
    Ok(())
}

async fn health_handler(State(state): State<ProxyAppState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": uptime,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn metrics_handler(State(prometheus): State<PrometheusHandle>) -> impl IntoResponse {
    prometheus.render()
}

/// Catch-all handler: every non-`/health` request on the proxy surface is a
/// candidate `/v1/messages`-shaped call for the dispatcher.
async fn proxy_handler(
    State(state): State<ProxyAppState>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let (parts, body) = request.into_parts();
    let body_bytes = match axum::body::to_bytes(body, 32 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let response = error_response(common::ProxyError::Validation(format!(
                "failed to read request body: {err}"
            )));
            metrics::record_request(response.status().as_u16(), &method, start.elapsed().as_secs_f64());
            return response;
        }
    };

    let meta = RequestMeta::new(method.clone(), parts.uri.path().to_string(), parts.headers);

    let response = match state.dispatcher.dispatch(meta, body_bytes).await {
        Ok(response) => response,
        Err(err) => {
            metrics::record_upstream_error(error_type_label(&err));
            error_response(err.into())
        }
    };
    metrics::record_request(response.status().as_u16(), &method, start.elapsed().as_secs_f64());
    response
}

/// Coarse classification label for the `proxy_upstream_errors_total` counter.
fn error_type_label(err: &proxy_core::Error) -> &'static str {
    match err {
        proxy_core::Error::NoAdapter(_) => "no_adapter",
        proxy_core::Error::Validation(_) => "validation",
        proxy_core::Error::ServiceUnavailable { .. } => "service_unavailable",
        proxy_core::Error::Provider(_) => "provider",
        proxy_core::Error::TokenManager(_) => "token_manager",
        proxy_core::Error::Store(_) => "store",
        proxy_core::Error::Http(_) => "http",
    }
}

fn error_response(err: common::ProxyError) -> Response {
    let status = axum::http::StatusCode::from_u16(err.status_code()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    let body = serde_json::json!({ "error": err.to_string() });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
