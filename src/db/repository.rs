//! Storage traits consumed by the monitoring core.
//!
//! The scheduler, incident manager, heartbeat tracker and notifier only see
//! these traits; [`Store`](super::Store) is the SQLite implementation.

use chrono::{DateTime, Utc};

use super::models::*;
use super::store::DbError;

/// Target configuration lookups.
pub trait TargetStore {
    /// Current row for a target, `None` if it was deleted.
    fn get_target(&self, id: i64) -> Result<Option<Target>, DbError>;

    /// Active targets of every type.
    fn list_active_targets(&self) -> Result<Vec<Target>, DbError>;

    /// Active targets of type `push`.
    fn list_active_push_targets(&self) -> Result<Vec<Target>, DbError>;

    /// Target owning a push token, active or not.
    fn find_by_push_token(&self, token: &str) -> Result<Option<Target>, DbError>;
}

/// Append-only check log.
pub trait OutcomeStore {
    fn append_outcome(&self, outcome: &CheckOutcome) -> Result<i64, DbError>;

    fn latest_outcome(&self, target_id: i64) -> Result<Option<CheckOutcome>, DbError>;

    /// Most recent outcomes first.
    fn recent_outcomes(&self, target_id: i64, limit: usize) -> Result<Vec<CheckOutcome>, DbError>;
}

/// Incidents and their update trail.
pub trait IncidentStore {
    fn create_incident(&self, incident: &NewIncident) -> Result<Incident, DbError>;

    /// Appends an update and moves the incident to the update's status.
    fn append_update(
        &self,
        incident_id: i64,
        status: IncidentStatus,
        message: &str,
    ) -> Result<IncidentUpdate, DbError>;

    fn find_unresolved_auto(&self, target_id: i64) -> Result<Option<Incident>, DbError>;

    /// Marks the incident resolved and stamps its resolve time.
    fn resolve(&self, incident_id: i64) -> Result<(), DbError>;

    fn get_incident(&self, incident_id: i64) -> Result<Option<Incident>, DbError>;
}

/// Maintenance window lookups.
pub trait MaintenanceStore {
    fn is_under_maintenance(&self, target_id: i64, now: DateTime<Utc>) -> Result<bool, DbError>;
}

/// Target to channel links.
pub trait ChannelStore {
    /// Active channels linked to the target.
    fn channels_for_target(&self, target_id: i64) -> Result<Vec<NotificationChannel>, DbError>;
}

/// Everything the monitoring core reads and writes.
pub trait Storage:
    TargetStore + OutcomeStore + IncidentStore + MaintenanceStore + ChannelStore + Send + Sync
{
}

impl<T> Storage for T where
    T: TargetStore + OutcomeStore + IncidentStore + MaintenanceStore + ChannelStore + Send + Sync
{
}
