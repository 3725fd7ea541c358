//! Waypost library: the uptime monitoring core.
//!
//! Probes targets on a schedule, tracks push heartbeats, opens and resolves
//! incidents, and notifies linked channels. A management layer drives it
//! through [`Scheduler`], [`HeartbeatTracker`] and [`IncidentManager`].

pub mod config;
pub mod db;
pub mod incident;
mod keyed;
pub mod notify;
pub mod probe;
pub mod scheduler;
pub mod web;

pub use config::ServerConfig;
pub use incident::{IncidentError, IncidentManager};
pub use notify::{Notifier, WebhookTransport};
pub use probe::{Checker, ProbeChecker};
pub use scheduler::{generate_push_token, HeartbeatTracker, PushError, Scheduler};
pub use web::Server;
