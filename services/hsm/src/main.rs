//! HSM Service - PKCS#11 key custody over HTTP

use std::sync::Arc;

use custody::{SessionManager, TokenConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "custody=info,hsm=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("Starting HSM Service");

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "80".to_string())
        .parse()
        .map_err(|e| format!("PORT must be a valid number: {}", e))?;

    let config = TokenConfig::from_env()?;
    let sessions = Arc::new(SessionManager::pkcs11(config));

    // Fail fast on a missing module or token instead of on the first request
    let init = sessions.clone();
    tokio::task::spawn_blocking(move || init.initialize())
        .await?
        .map_err(|e| format!("Failed to initialize PKCS#11: {}", e))?;

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    hsm::server::run(listener, sessions).await?;

    Ok(())
}
