//! HTTP API server: a thin POST-JSON surface over the archive library.
//!
//! Request gating order: panic recovery, request log, request id, IP
//! allow-list, CORS, rate limit, concurrency gate, authentication, handler.
//! `/health` only passes the log and allow-list stages.

pub mod config;
pub mod handlers;
pub mod middleware;

use std::any::Any;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::{watch, Semaphore};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;

use self::config::ServerConfig;
use self::middleware::{IpAllowlist, RateLimiter};
use crate::config::{Config, Timeout};

/// Bounded drain after the shutdown signal before forced termination.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    pub lib_config: Config,
    pub settings: Arc<ServerConfig>,
    pub api_keys: Arc<HashSet<String>>,
    pub allowlist: Arc<IpAllowlist>,
    pub limiter: Arc<RateLimiter>,
    pub gate: Arc<Semaphore>,
}

impl AppState {
    /// Build the state from validated configuration. Must run inside the
    /// runtime: the rate limiter spawns its sweeper here.
    pub fn new(config: &ServerConfig) -> Self {
        let lib_config = Config::default()
            .with_max_file_size(config.library.max_file_size)
            .with_timeout(Timeout::from_secs(config.library.timeout))
            .with_debug(config.library.debug);

        Self {
            lib_config,
            api_keys: Arc::new(config.all_api_keys().into_iter().collect()),
            allowlist: Arc::new(IpAllowlist::new(
                config.server.ip_whitelist.enabled,
                &config.server.ip_whitelist.ips,
            )),
            limiter: Arc::new(RateLimiter::new(
                config.server.rate_limit.enabled,
                config.server.rate_limit.requests_per_min,
                &config.server.rate_limit.whitelist,
            )),
            gate: Arc::new(Semaphore::new(config.server.max_concurrent)),
            settings: Arc::new(config.clone()),
        }
    }
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    handlers::error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error",
        "INTERNAL_ERROR",
    )
}

/// Assemble the full router with the middleware chain.
pub fn build_router(state: AppState) -> Router {
    // Read/write deadlines apply to the JSON endpoints; the extract stream
    // is exempt and governed by the library timeout instead.
    let json_deadline = Duration::from_secs(
        state.settings.server.timeout.read + state.settings.server.timeout.write,
    );

    let api = Router::new()
        .route(
            "/api/info",
            post(handlers::info).fallback(handlers::method_not_allowed),
        )
        .route(
            "/api/list",
            post(handlers::list).fallback(handlers::method_not_allowed),
        )
        .layer(TimeoutLayer::new(json_deadline))
        .route(
            "/api/extract",
            post(handlers::extract).fallback(handlers::method_not_allowed),
        )
        .layer(from_fn_with_state(state.clone(), middleware::auth))
        .layer(from_fn_with_state(state.clone(), middleware::concurrency_gate))
        .layer(from_fn_with_state(state.clone(), middleware::rate_limit))
        .layer(from_fn_with_state(state.clone(), middleware::cors))
        .layer(from_fn_with_state(state.clone(), middleware::ip_allowlist))
        .layer(from_fn(middleware::request_id))
        .layer(from_fn(middleware::request_log))
        .layer(CatchPanicLayer::custom(panic_response));

    let health = Router::new()
        .route("/health", get(handlers::health))
        .layer(from_fn_with_state(state.clone(), middleware::ip_allowlist))
        .layer(from_fn(middleware::request_log));

    api.merge(health).with_state(state)
}

/// Serve until interrupted, then drain for at most [`SHUTDOWN_DRAIN`].
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let state = AppState::new(&config);
    let limiter = Arc::clone(&state.limiter);
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "server starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut graceful_rx = shutdown_rx.clone();
    let mut drain_rx = shutdown_rx;

    let server = async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = graceful_rx.changed().await;
        })
        .await
    };

    tokio::select! {
        result = server => result?,
        _ = async {
            let _ = drain_rx.changed().await;
            tokio::time::sleep(SHUTDOWN_DRAIN).await;
        } => {
            tracing::warn!("graceful drain timed out, forcing shutdown");
        }
    }

    limiter.stop();
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
