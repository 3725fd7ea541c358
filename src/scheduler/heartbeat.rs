//! Heartbeat tracker for push targets.
//!
//! Push targets are never probed. The monitored service calls in with its
//! token; a periodic sweep opens an incident for any target that has been
//! silent for longer than one and a half push intervals.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::db::{CheckOutcome, CheckStatus, DbError, Storage, Target, TargetType};
use crate::incident::IncidentManager;
use crate::keyed::KeyedState;
use crate::notify::Notifier;

/// Why a heartbeat was rejected.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("Target not found")]
    NotFound,
    #[error("Target is paused")]
    Inactive,
    #[error(transparent)]
    Db(#[from] DbError),
}

pub struct HeartbeatTracker {
    store: Arc<dyn Storage>,
    incidents: Arc<IncidentManager>,
    notifier: Arc<Notifier>,
    /// Last signal per push target; `None` until seeded or first swept.
    last_signal: KeyedState<Option<DateTime<Utc>>>,
    sweep_interval: Duration,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl HeartbeatTracker {
    pub fn new(
        store: Arc<dyn Storage>,
        incidents: Arc<IncidentManager>,
        notifier: Arc<Notifier>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            incidents,
            notifier,
            last_signal: KeyedState::new(),
            sweep_interval,
            stop: Mutex::new(None),
        }
    }

    /// Load each active push target's last signal from its latest stored
    /// outcome, or now if it has none.
    pub async fn seed(&self) -> Result<usize, DbError> {
        let targets = self.store.list_active_push_targets()?;
        for target in &targets {
            let at = self
                .store
                .latest_outcome(target.id)?
                .map_or_else(Utc::now, |o| o.time);
            *self.last_signal.slot(target.id).lock().await = Some(at);
        }
        tracing::info!("Heartbeat: seeded {} push targets", targets.len());
        Ok(targets.len())
    }

    /// Accept a heartbeat addressed by push token.
    ///
    /// Unknown tokens and paused targets are rejected without touching any state.
    pub async fn record_push(&self, token: &str) -> Result<Target, PushError> {
        let target = self
            .store
            .find_by_push_token(token)?
            .ok_or(PushError::NotFound)?;
        if !target.active {
            return Err(PushError::Inactive);
        }
        self.signal(&target).await?;
        Ok(target)
    }

    /// Accept a heartbeat for a push target by id.
    pub async fn record_signal(&self, target_id: i64) -> Result<(), PushError> {
        let target = self
            .store
            .get_target(target_id)?
            .filter(|t| t.target_type == TargetType::Push)
            .ok_or(PushError::NotFound)?;
        if !target.active {
            return Err(PushError::Inactive);
        }
        self.signal(&target).await?;
        Ok(())
    }

    async fn signal(&self, target: &Target) -> Result<(), DbError> {
        let now = Utc::now();
        let slot = self.last_signal.slot(target.id);
        let mut last = slot.lock().await;
        *last = Some(now);

        let outcome = CheckOutcome::new(target.id, CheckStatus::Up)
            .with_metadata(json!({ "type": "heartbeat" }))
            .with_time(now);
        self.store.append_outcome(&outcome)?;
        let resolved = self
            .incidents
            .resolve_auto(target.id, "Heartbeat received, service is back online")?;
        drop(last);

        tracing::debug!("Heartbeat received for {}", target.name);
        if let Some(incident) = resolved {
            tracing::info!("Incident {} auto-resolved for target {}", incident.id, target.name);
            self.notifier.notify_up(target, &incident, &outcome).await;
        }
        Ok(())
    }

    pub async fn last_signal(&self, target_id: i64) -> Option<DateTime<Utc>> {
        match self.last_signal.existing(target_id) {
            Some(slot) => *slot.lock().await,
            None => None,
        }
    }

    /// Check every active push target against its grace period.
    /// Returns the number of incidents opened.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let targets = match self.store.list_active_push_targets() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Heartbeat: Failed to get push targets: {}", e);
                return 0;
            }
        };

        // Forget targets that were deleted, paused or retyped.
        let live: HashSet<i64> = targets.iter().map(|t| t.id).collect();
        self.last_signal.retain(|id| live.contains(&id));
        tracing::debug!("Heartbeat: tracking {} push targets", self.last_signal.len());

        let mut opened = 0;
        for target in &targets {
            match self.sweep_target(target, now).await {
                Ok(true) => opened += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Heartbeat: sweep failed for {}: {}", target.name, e);
                }
            }
        }
        opened
    }

    async fn sweep_target(&self, target: &Target, now: DateTime<Utc>) -> Result<bool, DbError> {
        let slot = self.last_signal.slot(target.id);
        let mut last = slot.lock().await;
        let Some(last_at) = *last else {
            // First sighting starts the clock.
            *last = Some(now);
            return Ok(false);
        };

        let silence = now - last_at;
        let grace = ChronoDuration::milliseconds(target.grace_period().as_millis() as i64);
        if silence <= grace || self.store.find_unresolved_auto(target.id)?.is_some() {
            return Ok(false);
        }

        let silent_secs = (silence.num_milliseconds() + 500) / 1000;
        let outcome = CheckOutcome::down(target.id, format!("No heartbeat received for {}s", silent_secs))
            .with_metadata(json!({ "type": "heartbeat_missed" }))
            .with_time(now);
        self.store.append_outcome(&outcome)?;
        let incident = self.incidents.open_auto(
            target.id,
            &format!("{} heartbeat missed", target.name),
            &format!("No heartbeat received for {} seconds", silent_secs),
        )?;
        drop(last);

        tracing::warn!("Incident {} created: {} silent for {}s", incident.id, target.name, silent_secs);
        self.notifier.notify_down(target, &incident, &outcome).await;
        Ok(true)
    }

    /// Start the periodic sweep.
    pub async fn start(self: &Arc<Self>) {
        let (tx, mut rx) = broadcast::channel(1);
        if let Some(previous) = self.stop.lock().await.replace(tx) {
            let _ = previous.send(());
        }

        let tracker = Arc::clone(self);
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        tracker.sweep().await;
                    }
                }
            }
        });
    }

    /// Stop the sweep and forget every last-signal time.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop.lock().await.take() {
            let _ = tx.send(());
        }
        self.last_signal.clear();
    }
}

/// Random 48 character hex token for a new push target.
pub fn generate_push_token() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes.iter().fold(String::with_capacity(48), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}
