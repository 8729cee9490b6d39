#![deny(unused_must_use)]
mod app_detector;
mod capture_source;
mod config;
mod enrichment;
mod geo_db;
mod hub;
mod metrics_engine;
mod packet;
mod report_builder;
mod session;
mod state;
mod window;

use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use state::{AppState, OwnAddresses};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::Config::load_or_default();

    // EnvFilter from RUST_LOG when set, the configured level otherwise.
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting NetLens server");
    tracing::info!(
        "  Listening on {}:{}, capture window {}s, capture tool '{}'",
        config.server.host,
        config.server.port,
        config.capture.window_secs,
        config.capture.tool
    );

    let own_addrs = OwnAddresses::discover();
    let app_state = AppState::new(config.clone(), own_addrs);

    enrichment::spawn_enrichment_worker(app_state.clone());

    let app = Router::new()
        .route("/ws", get(hub::ws_handler))
        .with_state(app_state.clone())
        .layer(TraceLayer::new_for_http());

    let ip_addr = config.server.host.parse::<std::net::IpAddr>().unwrap_or_else(|e| {
        tracing::warn!(
            "Failed to parse host '{}': {}. Using 127.0.0.1",
            config.server.host,
            e
        );
        [127, 0, 0, 1].into()
    });
    let addr = SocketAddr::from((ip_addr, config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Subscriber channel listening on ws://{}/ws", addr);

    let shutdown_state = app_state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received, stopping capture");
            shutdown_state.capture.stop().await;
        })
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
