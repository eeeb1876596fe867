//! Gateway service entry point.
//!
//! Real-time event gateway: persistent connections in front of the
//! request/response API, sharing one action router.

use anyhow::Result;
use gateway::{
    handlers, http_server, ws_server, ActionRouter, AppState, BroadcastDispatcher,
    ConnectionRegistry, RateLimiter, RateLimiterConfig, ScopePermissionEngine,
    StaticTokenResolver,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting gateway service");

    // Read configuration from environment
    let port: u16 = env::var("GATEWAY_PORT")
        .unwrap_or_else(|_| "8082".to_string())
        .parse()
        .expect("GATEWAY_PORT must be a number");
    let metrics_port: u16 = env::var("METRICS_PORT")
        .unwrap_or_else(|_| "9093".to_string())
        .parse()
        .expect("METRICS_PORT must be a number");
    let rate_config = RateLimiterConfig {
        authenticated_limit: env_u32("RATE_LIMIT_AUTHENTICATED", 10_800),
        anonymous_limit: env_u32("RATE_LIMIT_ANONYMOUS", 3_600),
        window: Duration::from_secs(env_u32("RATE_LIMIT_WINDOW_SECS", 3_600) as u64),
    };
    let stale_after_ms: i64 = env_u32("STALE_CONNECTION_SECS", 300) as i64 * 1_000;

    info!("Configuration:");
    info!("  GATEWAY_PORT: {}", port);
    info!("  METRICS_PORT: {}", metrics_port);
    info!(
        "  RATE_LIMIT: {}/{} per {:?}",
        rate_config.authenticated_limit, rate_config.anonymous_limit, rate_config.window
    );

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
        .expect("Failed to start Prometheus exporter");
    info!("Prometheus metrics server started on port {}", metrics_port);

    // Wire the collaborators and shared registries
    let resolver = Arc::new(StaticTokenResolver::from_env());
    if resolver.is_empty() {
        info!("No bearer tokens configured; all connections stay anonymous");
    }
    let permissions = Arc::new(ScopePermissionEngine);
    let registry = Arc::new(ConnectionRegistry::new(resolver.clone()));
    let limiter = Arc::new(RateLimiter::new(rate_config));
    let dispatcher = Arc::new(BroadcastDispatcher::new(registry.clone(), permissions));

    // One router instance, populated before any connection is accepted and
    // shared by both fronts.
    let mut router = ActionRouter::new();
    handlers::register_builtin_routes(&mut router, registry.clone())?;
    let router = Arc::new(router);
    info!("{} routes registered", router.route_count());

    let state = Arc::new(AppState {
        registry: registry.clone(),
        router,
        limiter,
        dispatcher,
        resolver,
    });

    // Sweep connections with no inbound activity
    let sweeper_registry = registry.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            sweeper_registry.cleanup_stale(stale_after_ms);
        }
    });

    let app = ws_server::create_router(state.clone()).merge(http_server::create_router(state));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Gateway stopped");
    Ok(())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
