//! HSM Service HTTP Server

use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

use axum::{
    Router,
    routing::{get, post},
};
use custody::{Module, SessionManager};

use crate::handlers::{self, AppState};

/// Create and configure the Axum router
pub fn create_router<M: Module>(sessions: Arc<SessionManager<M>>) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        // Key operations
        .route(
            "/api/v1/keys",
            post(handlers::create_key::<M>).get(handlers::list_keys::<M>),
        )
        .route(
            "/api/v1/keys/:id",
            get(handlers::get_key::<M>).delete(handlers::delete_key::<M>),
        )
        // Signing
        .route("/api/v1/sign", post(handlers::sign::<M>))
        .with_state(AppState::new(sessions))
}

/// Serve until SIGINT/SIGTERM, then finalize the module.
pub async fn run<M: Module>(
    listener: tokio::net::TcpListener,
    sessions: Arc<SessionManager<M>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = create_router(sessions.clone());

    info!(
        "HSM service listening on {}",
        listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tokio::task::spawn_blocking(move || sessions.shutdown()).await?;

    Ok(())
}

/// Wait for SIGTERM or SIGINT signal
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Starting graceful shutdown...");
}
