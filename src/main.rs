use std::{net::SocketAddr, sync::Arc};

use tracing::info;
use tracing_subscriber::EnvFilter;

mod codec;
mod error;
mod inference;
mod model;
mod routes;
mod utils;

use error::StartupError;
use inference::InferenceService;
use routes::ServiceState;
use utils::Config;

#[tokio::main]
async fn main() -> Result<(), StartupError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let model = model::load(&config).await?;
    let service = InferenceService::new(Arc::new(model));
    let state = Arc::new(ServiceState::new(Some(service)));

    let app = routes::router(state, config.body_limit_bytes);

    let addr = SocketAddr::new(config.host, config.port);
    let server = axum::Server::try_bind(&addr).map_err(|e| StartupError::Server(e.to_string()))?;

    info!("Server running on http://{}", addr);
    info!("NSFW endpoint: http://{}/v1/image_nsfw", addr);
    info!("Health check: http://{}/health", addr);

    server
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| StartupError::Server(e.to_string()))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down server...");
}
