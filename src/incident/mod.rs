//! Incident manager: turns the outcome stream into incidents.
//!
//! Keeps a consecutive-failure counter per target. An auto incident opens
//! once the counter reaches the target's retry threshold and resolves on the
//! first healthy outcome after it. Errors while handling one target are
//! logged and never reach the caller.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::db::{
    CheckOutcome, CheckStatus, DbError, Incident, IncidentStatus, IncidentType, IncidentUpdate,
    NewIncident, Storage, Target,
};
use crate::keyed::KeyedState;
use crate::notify::Notifier;

/// Errors from operator-facing incident operations.
#[derive(Error, Debug)]
pub enum IncidentError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("incident {0} not found")]
    NotFound(i64),
    #[error("incident {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: IncidentStatus,
        to: IncidentStatus,
    },
}

pub struct IncidentManager {
    store: Arc<dyn Storage>,
    notifier: Arc<Notifier>,
    failures: KeyedState<u32>,
}

impl IncidentManager {
    pub fn new(store: Arc<dyn Storage>, notifier: Arc<Notifier>) -> Self {
        Self {
            store,
            notifier,
            failures: KeyedState::new(),
        }
    }

    /// Feed one stored outcome through the state machine.
    ///
    /// The outcome must already be in the check log: the degraded edge is
    /// detected by comparing against the outcome stored before it.
    pub async fn evaluate(&self, target: &Target, outcome: &CheckOutcome) {
        if let Err(e) = self.try_evaluate(target, outcome).await {
            error!("Error evaluating incident for target {}: {}", target.id, e);
        }
    }

    async fn try_evaluate(&self, target: &Target, outcome: &CheckOutcome) -> Result<(), DbError> {
        let slot = self.failures.slot(target.id);
        let mut failures = slot.lock().await;

        if outcome.status == CheckStatus::Down {
            *failures += 1;
            let threshold = target.failure_threshold();
            debug!("Target {} failure count: {}/{}", target.name, *failures, threshold);
            if *failures < threshold || self.store.find_unresolved_auto(target.id)?.is_some() {
                return Ok(());
            }

            let message = if outcome.error_message.is_empty() {
                format!("Target {} is not responding", target.name)
            } else {
                outcome.error_message.clone()
            };
            let incident = self.open_auto(target.id, &format!("{} is down", target.name), &message)?;
            drop(failures);

            warn!("Incident {} created for target {}", incident.id, target.name);
            self.notifier.notify_down(target, &incident, outcome).await;
            return Ok(());
        }

        *failures = 0;
        let message = format!(
            "{} is back online. Response time: {}ms",
            target.name, outcome.response_time_ms
        );
        let resolved = self.resolve_auto(target.id, &message)?;
        drop(failures);

        if let Some(incident) = resolved {
            info!("Incident {} auto-resolved for target {}", incident.id, target.name);
            self.notifier.notify_up(target, &incident, outcome).await;
        }

        if outcome.status == CheckStatus::Degraded {
            let recent = self.store.recent_outcomes(target.id, 2)?;
            let was_up = recent.get(1).map_or(false, |prev| prev.status == CheckStatus::Up);
            if was_up {
                self.notifier.notify_degraded(target, outcome).await;
            }
        }
        Ok(())
    }

    /// Open an auto incident with its initial `investigating` update.
    pub fn open_auto(&self, target_id: i64, title: &str, message: &str) -> Result<Incident, DbError> {
        let incident = self.store.create_incident(&NewIncident {
            target_id: Some(target_id),
            title: title.to_string(),
            incident_type: IncidentType::Auto,
        })?;
        self.store
            .append_update(incident.id, IncidentStatus::Investigating, message)?;
        Ok(incident)
    }

    /// Resolve the target's unresolved auto incident, if any.
    pub fn resolve_auto(&self, target_id: i64, message: &str) -> Result<Option<Incident>, DbError> {
        let Some(incident) = self.store.find_unresolved_auto(target_id)? else {
            return Ok(None);
        };
        self.store
            .append_update(incident.id, IncidentStatus::Resolved, message)?;
        self.store.resolve(incident.id)?;
        Ok(Some(incident))
    }

    /// Operator update. Status only moves forward and `resolved` is final.
    pub async fn post_update(
        &self,
        incident_id: i64,
        status: IncidentStatus,
        message: &str,
    ) -> Result<IncidentUpdate, IncidentError> {
        let incident = self
            .store
            .get_incident(incident_id)?
            .ok_or(IncidentError::NotFound(incident_id))?;
        if status <= incident.status {
            return Err(IncidentError::InvalidTransition {
                id: incident_id,
                from: incident.status,
                to: status,
            });
        }

        let update = self.store.append_update(incident_id, status, message)?;
        if status == IncidentStatus::Resolved {
            self.store.resolve(incident_id)?;
        }

        let target = match incident.target_id {
            Some(id) => self.store.get_target(id)?,
            None => None,
        };
        self.notifier
            .notify_incident_update(target.as_ref(), &incident, &update)
            .await;
        Ok(update)
    }

    /// Open a manual incident, optionally tied to a target.
    pub fn open_manual(
        &self,
        target_id: Option<i64>,
        title: &str,
        message: &str,
    ) -> Result<Incident, IncidentError> {
        let incident = self.store.create_incident(&NewIncident {
            target_id,
            title: title.to_string(),
            incident_type: IncidentType::Manual,
        })?;
        self.store
            .append_update(incident.id, IncidentStatus::Investigating, message)?;
        info!("Manual incident {} opened: {}", incident.id, title);
        Ok(incident)
    }

    pub async fn failure_count(&self, target_id: i64) -> u32 {
        *self.failures.slot(target_id).lock().await
    }

    /// Forget every failure counter.
    pub fn reset_all(&self) {
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        ChannelStore, IncidentStore, MaintenanceStore, NotificationChannel, OutcomeStore, Store,
        TargetStore,
    };
    use crate::notify::testing::RecordingTransport;
    use crate::notify::EventKind;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        store: Store,
        target: Target,
        transport: Arc<RecordingTransport>,
        manager: IncidentManager,
    }

    fn fixture(retries: i64) -> Fixture {
        let store = Store::open_in_memory().unwrap();
        let mut target = Target {
            name: "edge".to_string(),
            url: "https://edge.example.com".to_string(),
            retries,
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        let mut channel = NotificationChannel {
            id: 0,
            name: "pager".to_string(),
            channel_type: "webhook".to_string(),
            config: json!({}),
            active: true,
        };
        store.add_channel(&mut channel).unwrap();
        store.link_channel(target.id, channel.id).unwrap();

        let transport = Arc::new(RecordingTransport::default());
        let shared: Arc<dyn Storage> = Arc::new(store.clone());
        let notifier = Arc::new(Notifier::new(shared.clone(), transport.clone(), Duration::from_secs(10)));
        Fixture {
            manager: IncidentManager::new(shared, notifier),
            store,
            target,
            transport,
        }
    }

    impl Fixture {
        /// Store then evaluate, the way the scheduler does. Outcomes are spaced a second apart.
        async fn feed(&self, status: CheckStatus) {
            let count = self.store.recent_outcomes(self.target.id, 1000).unwrap().len() as i64;
            let mut outcome = CheckOutcome::new(self.target.id, status)
                .with_time(Utc::now() + ChronoDuration::seconds(count));
            outcome.response_time_ms = 42;
            if status == CheckStatus::Down {
                outcome.error_message = "connection refused".to_string();
            }
            self.store.append_outcome(&outcome).unwrap();
            self.manager.evaluate(&self.target, &outcome).await;
        }

        fn incidents(&self) -> Vec<Incident> {
            self.store.incidents_for_target(self.target.id).unwrap()
        }
    }

    #[tokio::test]
    async fn test_incident_opens_exactly_at_threshold() {
        let f = fixture(3);
        f.feed(CheckStatus::Down).await;
        f.feed(CheckStatus::Down).await;
        assert!(f.incidents().is_empty());
        assert_eq!(f.manager.failure_count(f.target.id).await, 2);

        f.feed(CheckStatus::Down).await;
        let incidents = f.incidents();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].title, "edge is down");
        assert_eq!(incidents[0].incident_type, IncidentType::Auto);
        assert_eq!(incidents[0].status, IncidentStatus::Investigating);

        let updates = f.store.incident_updates(incidents[0].id).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].message, "connection refused");
        assert_eq!(f.transport.kinds(), vec![EventKind::MonitorDown]);
    }

    #[tokio::test]
    async fn test_unresolved_incident_never_duplicated() {
        let f = fixture(2);
        for _ in 0..6 {
            f.feed(CheckStatus::Down).await;
        }
        assert_eq!(f.incidents().len(), 1);
        assert_eq!(f.transport.kinds(), vec![EventKind::MonitorDown]);
    }

    #[tokio::test]
    async fn test_flap_below_threshold_is_absorbed() {
        let f = fixture(3);
        f.feed(CheckStatus::Down).await;
        f.feed(CheckStatus::Down).await;
        f.feed(CheckStatus::Up).await;

        assert!(f.incidents().is_empty());
        assert_eq!(f.manager.failure_count(f.target.id).await, 0);
        assert!(f.transport.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_down_then_recovery_sends_down_then_up() {
        let f = fixture(3);
        f.feed(CheckStatus::Up).await;
        for _ in 0..3 {
            f.feed(CheckStatus::Down).await;
        }
        f.feed(CheckStatus::Up).await;

        assert_eq!(
            f.transport.kinds(),
            vec![EventKind::MonitorDown, EventKind::MonitorUp]
        );
        let incident = &f.incidents()[0];
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert!(incident.resolved_at.is_some());

        let updates = f.store.incident_updates(incident.id).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].status, IncidentStatus::Resolved);
        assert_eq!(updates[1].message, "edge is back online. Response time: 42ms");
    }

    #[tokio::test]
    async fn test_degraded_notifies_only_on_edge_from_up() {
        let f = fixture(3);
        f.feed(CheckStatus::Up).await;
        f.feed(CheckStatus::Degraded).await;
        f.feed(CheckStatus::Degraded).await;
        f.feed(CheckStatus::Degraded).await;
        assert_eq!(f.transport.kinds(), vec![EventKind::MonitorDegraded]);

        // down -> degraded is not an up -> degraded edge
        f.feed(CheckStatus::Down).await;
        f.feed(CheckStatus::Degraded).await;
        assert_eq!(f.transport.kinds(), vec![EventKind::MonitorDegraded]);

        f.feed(CheckStatus::Up).await;
        f.feed(CheckStatus::Degraded).await;
        assert_eq!(
            f.transport.kinds(),
            vec![EventKind::MonitorDegraded, EventKind::MonitorDegraded]
        );
    }

    #[tokio::test]
    async fn test_degraded_resolves_open_incident() {
        let f = fixture(1);
        f.feed(CheckStatus::Down).await;
        f.feed(CheckStatus::Degraded).await;
        assert_eq!(f.incidents()[0].status, IncidentStatus::Resolved);
        assert_eq!(
            f.transport.kinds(),
            vec![EventKind::MonitorDown, EventKind::MonitorUp]
        );
    }

    #[tokio::test]
    async fn test_stale_incident_resolved_after_restart() {
        let f = fixture(3);
        let stale = f.manager.open_auto(f.target.id, "edge is down", "left over").unwrap();

        // Fresh counters, as after a process restart.
        f.manager.reset_all();
        f.feed(CheckStatus::Up).await;

        let incident = f.store.get_incident(stale.id).unwrap().unwrap();
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert_eq!(f.transport.kinds(), vec![EventKind::MonitorUp]);
    }

    #[tokio::test]
    async fn test_manual_incident_not_auto_resolved() {
        let f = fixture(3);
        let manual = f
            .manager
            .open_manual(Some(f.target.id), "Planned migration", "Moving racks")
            .unwrap();
        f.feed(CheckStatus::Up).await;

        let incident = f.store.get_incident(manual.id).unwrap().unwrap();
        assert_eq!(incident.incident_type, IncidentType::Manual);
        assert_eq!(incident.status, IncidentStatus::Investigating);
        assert!(f.transport.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_post_update_moves_forward_only() {
        let f = fixture(3);
        let incident = f
            .manager
            .open_manual(Some(f.target.id), "Elevated errors", "Looking into it")
            .unwrap();

        f.manager
            .post_update(incident.id, IncidentStatus::Identified, "Bad deploy")
            .await
            .unwrap();
        let backwards = f
            .manager
            .post_update(incident.id, IncidentStatus::Investigating, "Again")
            .await;
        assert!(matches!(backwards, Err(IncidentError::InvalidTransition { .. })));

        f.manager
            .post_update(incident.id, IncidentStatus::Resolved, "Rolled back")
            .await
            .unwrap();
        let after = f
            .manager
            .post_update(incident.id, IncidentStatus::Resolved, "Done")
            .await;
        assert!(matches!(after, Err(IncidentError::InvalidTransition { .. })));

        let stored = f.store.get_incident(incident.id).unwrap().unwrap();
        assert_eq!(stored.status, IncidentStatus::Resolved);
        assert!(stored.resolved_at.is_some());
        assert_eq!(
            f.transport.kinds(),
            vec![EventKind::IncidentUpdate, EventKind::IncidentUpdate]
        );
    }

    #[tokio::test]
    async fn test_post_update_without_target_sends_nothing() {
        let f = fixture(3);
        let incident = f
            .manager
            .open_manual(None, "Provider outage", "Upstream DNS issues")
            .unwrap();
        f.manager
            .post_update(incident.id, IncidentStatus::Monitoring, "Recovering")
            .await
            .unwrap();
        assert!(f.transport.kinds().is_empty());

        let missing = f.manager.post_update(9999, IncidentStatus::Resolved, "?").await;
        assert!(matches!(missing, Err(IncidentError::NotFound(9999))));
    }

    /// Storage whose every call fails.
    struct FailingStore;

    impl TargetStore for FailingStore {
        fn get_target(&self, _: i64) -> Result<Option<Target>, DbError> {
            Err(DbError::Poisoned)
        }
        fn list_active_targets(&self) -> Result<Vec<Target>, DbError> {
            Err(DbError::Poisoned)
        }
        fn list_active_push_targets(&self) -> Result<Vec<Target>, DbError> {
            Err(DbError::Poisoned)
        }
        fn find_by_push_token(&self, _: &str) -> Result<Option<Target>, DbError> {
            Err(DbError::Poisoned)
        }
    }

    impl OutcomeStore for FailingStore {
        fn append_outcome(&self, _: &CheckOutcome) -> Result<i64, DbError> {
            Err(DbError::Poisoned)
        }
        fn latest_outcome(&self, _: i64) -> Result<Option<CheckOutcome>, DbError> {
            Err(DbError::Poisoned)
        }
        fn recent_outcomes(&self, _: i64, _: usize) -> Result<Vec<CheckOutcome>, DbError> {
            Err(DbError::Poisoned)
        }
    }

    impl IncidentStore for FailingStore {
        fn create_incident(&self, _: &NewIncident) -> Result<Incident, DbError> {
            Err(DbError::Poisoned)
        }
        fn append_update(&self, _: i64, _: IncidentStatus, _: &str) -> Result<IncidentUpdate, DbError> {
            Err(DbError::Poisoned)
        }
        fn find_unresolved_auto(&self, _: i64) -> Result<Option<Incident>, DbError> {
            Err(DbError::Poisoned)
        }
        fn resolve(&self, _: i64) -> Result<(), DbError> {
            Err(DbError::Poisoned)
        }
        fn get_incident(&self, _: i64) -> Result<Option<Incident>, DbError> {
            Err(DbError::Poisoned)
        }
    }

    impl MaintenanceStore for FailingStore {
        fn is_under_maintenance(&self, _: i64, _: DateTime<Utc>) -> Result<bool, DbError> {
            Err(DbError::Poisoned)
        }
    }

    impl ChannelStore for FailingStore {
        fn channels_for_target(&self, _: i64) -> Result<Vec<NotificationChannel>, DbError> {
            Err(DbError::Poisoned)
        }
    }

    #[tokio::test]
    async fn test_storage_errors_are_contained() {
        let store: Arc<dyn Storage> = Arc::new(FailingStore);
        let transport = Arc::new(RecordingTransport::default());
        let notifier = Arc::new(Notifier::new(store.clone(), transport.clone(), Duration::from_secs(10)));
        let manager = IncidentManager::new(store, notifier);
        let target = Target {
            id: 5,
            retries: 1,
            ..Default::default()
        };

        manager.evaluate(&target, &CheckOutcome::down(5, "refused")).await;
        manager.evaluate(&target, &CheckOutcome::new(5, CheckStatus::Up)).await;

        assert!(transport.kinds().is_empty());
        assert_eq!(manager.failure_count(5).await, 0);
    }
}
