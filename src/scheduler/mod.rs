//! Scheduler module: one recurring check loop per active target.
//!
//! Each registered target owns a task that ticks at the target's interval,
//! re-reads the target before every dispatch and hands the outcome to the
//! incident manager. The heartbeat tracker is the passive counterpart for
//! push targets.

mod heartbeat;

pub use heartbeat::*;

use crate::db::{CheckOutcome, DbError, Storage, Target};
use crate::incident::IncidentManager;
use crate::probe::Checker;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock, Semaphore};

struct Registration {
    generation: u64,
    stop: broadcast::Sender<()>,
}

/// State shared between the scheduler handle and its per-target tasks.
struct Shared {
    store: Arc<dyn Storage>,
    checker: Arc<dyn Checker>,
    incidents: Arc<IncidentManager>,
    registry: RwLock<HashMap<i64, Registration>>,
    /// One permit per target; survives re-registration so a restart cannot double up.
    in_flight: Mutex<HashMap<i64, Arc<Semaphore>>>,
}

impl Shared {
    fn in_flight_guard(&self, target_id: i64) -> Arc<Semaphore> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(target_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Forget the target's permit once no loop or running check holds it.
    fn release_in_flight(&self, target_id: i64) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight
            .get(&target_id)
            .is_some_and(|guard| Arc::strong_count(guard) == 1)
        {
            in_flight.remove(&target_id);
        }
    }
}

/// Owns the check loops of every scheduled target.
pub struct Scheduler {
    shared: Arc<Shared>,
    next_generation: AtomicU64,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Storage>,
        checker: Arc<dyn Checker>,
        incidents: Arc<IncidentManager>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                checker,
                incidents,
                registry: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
            }),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Schedule every active, non-push target. Returns how many were added.
    pub async fn start(&self) -> Result<usize, DbError> {
        let targets = self.shared.store.list_active_targets()?;
        let mut added = 0;
        for target in targets.iter().filter(|t| t.is_schedulable()) {
            if self.add(target.id).await? {
                added += 1;
            }
        }
        tracing::info!("Starting scheduler with {} targets", added);
        Ok(added)
    }

    /// Start checking a target: once immediately, then every interval.
    ///
    /// Replaces an existing registration. Returns `false` when the target is
    /// missing, inactive or passive.
    pub async fn add(&self, target_id: i64) -> Result<bool, DbError> {
        let Some(target) = self.shared.store.get_target(target_id)? else {
            return Ok(false);
        };
        if !target.is_schedulable() {
            tracing::debug!("Scheduler: target {} is not schedulable", target.name);
            return Ok(false);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = broadcast::channel(1);
        {
            let mut registry = self.shared.registry.write().await;
            let previous = registry.insert(
                target_id,
                Registration {
                    generation,
                    stop: stop_tx,
                },
            );
            if let Some(previous) = previous {
                let _ = previous.stop.send(());
            }
        }

        tracing::info!("Scheduler: Adding target {} ({})", target.name, target.target_type);

        let shared = self.shared.clone();
        let period = target.check_interval();
        tokio::spawn(async move {
            run_check_loop(shared.clone(), target_id, period, stop_rx).await;

            // Only clean up if a newer registration has not taken our place.
            {
                let mut registry = shared.registry.write().await;
                if registry.get(&target_id).map(|r| r.generation) == Some(generation) {
                    registry.remove(&target_id);
                }
            }
            shared.release_in_flight(target_id);
        });
        Ok(true)
    }

    /// Stop checking a target. Returns whether it was scheduled.
    pub async fn remove(&self, target_id: i64) -> bool {
        let removed = self.shared.registry.write().await.remove(&target_id);
        match removed {
            Some(registration) => {
                let _ = registration.stop.send(());
                tracing::info!("Scheduler: Removed target {}", target_id);
                true
            }
            None => false,
        }
    }

    /// Remove then add, picking up interval or type changes.
    pub async fn restart(&self, target_id: i64) -> Result<bool, DbError> {
        self.remove(target_id).await;
        self.add(target_id).await
    }

    /// Tear down every loop and forget every failure counter.
    pub async fn stop_all(&self) {
        let drained: Vec<_> = self.shared.registry.write().await.drain().collect();
        for (_, registration) in &drained {
            let _ = registration.stop.send(());
        }
        self.shared.incidents.reset_all();
        tracing::info!("Scheduler: Stopped {} targets", drained.len());
    }

    /// Run the checker once with no scheduling, maintenance or incident side effects.
    pub async fn test_once(&self, target: &Target) -> CheckOutcome {
        self.shared.checker.check(target).await
    }

    pub async fn active_count(&self) -> usize {
        self.shared.registry.read().await.len()
    }

    pub async fn is_scheduled(&self, target_id: i64) -> bool {
        self.shared.registry.read().await.contains_key(&target_id)
    }
}

/// Tick loop for a single target.
async fn run_check_loop(
    shared: Arc<Shared>,
    target_id: i64,
    period: Duration,
    mut stop_rx: broadcast::Receiver<()>,
) {
    let guard = shared.in_flight_guard(target_id);

    // The first tick completes immediately.
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let target = match shared.store.get_target(target_id) {
                    Ok(Some(target)) if target.is_schedulable() => target,
                    Ok(_) => {
                        tracing::info!("Scheduler: target {} inactive or deleted, stopping", target_id);
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Scheduler: failed to load target {}: {}", target_id, e);
                        continue;
                    }
                };

                let permit = match guard.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Skipping check for {}: previous check still running", target.name);
                        continue;
                    }
                };

                let shared = shared.clone();
                tokio::spawn(async move {
                    run_check(&shared, target).await;
                    drop(permit);
                    shared.release_in_flight(target_id);
                });
            }
        }
    }
}

/// One tick: maintenance gate, check, persist, evaluate.
async fn run_check(shared: &Shared, target: Target) {
    match shared.store.is_under_maintenance(target.id, Utc::now()) {
        Ok(true) => {
            tracing::debug!("Target {} is under maintenance, skipping check", target.name);
            return;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!("Maintenance lookup failed for {}: {}", target.name, e);
        }
    }

    let outcome = shared.checker.check(&target).await;
    tracing::debug!(
        "Check for {}: {} in {}ms",
        target.name,
        outcome.status,
        outcome.response_time_ms
    );

    if let Err(e) = shared.store.append_outcome(&outcome) {
        tracing::error!("Failed to store outcome for {}: {}", target.name, e);
        return;
    }
    shared.incidents.evaluate(&target, &outcome).await;
}
