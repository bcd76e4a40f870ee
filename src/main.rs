use otpgate::config::AppConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok(); // Load .env file if present

    let config = AppConfig::load()?;
    otpgate::telemetry::init(&config.logging)?;

    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return Err(e.into());
    }

    let (app, limiter) = otpgate::build_app(&config)?;

    let sweep_every = config.rate_limit.sweep_interval_seconds;
    if config.rate_limit.enabled && sweep_every > 0 {
        tokio::spawn(limiter.run_sweeper(Duration::from_secs(sweep_every)));
    }

    let listener = tokio::net::TcpListener::bind(config.server.address()).await?;
    info!("Server listening on {}", listener.local_addr()?);
    info!(
        "Rate limit: {} requests per {} seconds under {}",
        config.rate_limit.max_requests,
        config.rate_limit.window_seconds,
        config.rate_limit.gated_prefix
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
