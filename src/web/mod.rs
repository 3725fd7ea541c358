//! Web server module: push-signal ingress.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::scheduler::{HeartbeatTracker, Scheduler};

use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub heartbeat: Arc<HeartbeatTracker>,
}

/// Web server for Waypost.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, scheduler: Arc<Scheduler>, heartbeat: Arc<HeartbeatTracker>) -> Self {
        Self {
            config,
            state: AppState {
                scheduler,
                heartbeat,
            },
        }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` completes.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route(
            "/api/push/{token}",
            get(handlers::handle_push).post(handlers::handle_push),
        )
        .route("/api/health", get(handlers::handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}
