//! Waypost - uptime monitoring core
//!
//! Probes targets on a schedule, tracks push heartbeats, opens and resolves
//! incidents, and notifies linked channels.

use waypost::db::{Storage, Store, Target};
use waypost::{
    HeartbeatTracker, IncidentManager, Notifier, ProbeChecker, Scheduler, Server, ServerConfig,
    WebhookTransport,
};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("waypost=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Waypost on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    // Add sample target if none exist
    if store.list_targets()?.is_empty() {
        tracing::info!("Adding sample target: Example");
        let mut target = Target {
            name: "Example".to_string(),
            url: "https://example.com".to_string(),
            ..Default::default()
        };
        store.add_target(&mut target)?;
    }

    let shared: Arc<dyn Storage> = Arc::new(store);
    let transport = Arc::new(WebhookTransport::new(cfg.delivery_timeout())?);
    let notifier = Arc::new(Notifier::new(shared.clone(), transport, cfg.delivery_timeout()));
    let incidents = Arc::new(IncidentManager::new(shared.clone(), notifier.clone()));
    let scheduler = Arc::new(Scheduler::new(
        shared.clone(),
        Arc::new(ProbeChecker::new()),
        incidents.clone(),
    ));
    let heartbeat = Arc::new(HeartbeatTracker::new(
        shared,
        incidents,
        notifier,
        cfg.sweep_interval(),
    ));

    // Start background work
    heartbeat.seed().await?;
    scheduler.start().await?;
    heartbeat.start().await;

    // Serve push ingress until Ctrl-C
    let server = Server::new(cfg, scheduler.clone(), heartbeat.clone());
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutting down...");
        })
        .await?;

    heartbeat.stop().await;
    scheduler.stop_all().await;

    Ok(())
}
