//! Notifier: fans state-change events out to a target's linked channels.
//!
//! Every channel is attempted; one channel failing or hanging never affects
//! delivery to the others. Failed deliveries are logged and not retried.

mod payload;
mod transport;

pub use payload::*;
pub use transport::*;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, warn};

use crate::db::{CheckOutcome, Incident, IncidentUpdate, NotificationChannel, Storage, Target};

/// Per-channel delivery tally for one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// `channel name: error` for each failed delivery.
    pub errors: Vec<String>,
}

impl DeliveryReport {
    /// Some channels got the event and some did not.
    pub fn is_partial(&self) -> bool {
        self.delivered > 0 && self.failed > 0
    }

    pub fn all_delivered(&self) -> bool {
        self.failed == 0
    }
}

pub struct Notifier {
    store: Arc<dyn Storage>,
    transport: Arc<dyn ChannelTransport>,
    delivery_timeout: Duration,
}

impl Notifier {
    pub fn new(
        store: Arc<dyn Storage>,
        transport: Arc<dyn ChannelTransport>,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            delivery_timeout,
        }
    }

    pub async fn notify_down(&self, target: &Target, incident: &Incident, outcome: &CheckOutcome) -> DeliveryReport {
        self.notify(target, &NotificationPayload::down(target, incident, outcome))
            .await
    }

    pub async fn notify_up(&self, target: &Target, incident: &Incident, outcome: &CheckOutcome) -> DeliveryReport {
        self.notify(target, &NotificationPayload::up(target, incident, outcome))
            .await
    }

    pub async fn notify_degraded(&self, target: &Target, outcome: &CheckOutcome) -> DeliveryReport {
        self.notify(target, &NotificationPayload::degraded(target, outcome))
            .await
    }

    /// Incident updates only go out when the incident belongs to a target.
    pub async fn notify_incident_update(
        &self,
        target: Option<&Target>,
        incident: &Incident,
        update: &IncidentUpdate,
    ) -> DeliveryReport {
        match target {
            Some(target) => {
                let payload = NotificationPayload::incident_update(Some(target), incident, update);
                self.notify(target, &payload).await
            }
            None => DeliveryReport::default(),
        }
    }

    /// Send a test event to a single channel, surfacing its error.
    pub async fn test_channel(&self, channel: &NotificationChannel) -> Result<(), DeliveryError> {
        self.deliver_one(channel, &NotificationPayload::test()).await
    }

    /// Deliver to every active channel linked to the target.
    pub async fn notify(&self, target: &Target, payload: &NotificationPayload) -> DeliveryReport {
        let channels = match self.store.channels_for_target(target.id) {
            Ok(channels) => channels,
            Err(e) => {
                error!("Failed to load channels for target {}: {}", target.id, e);
                return DeliveryReport::default();
            }
        };
        self.deliver_all(&channels, payload).await
    }

    /// All-settled fan-out over the given channels.
    pub async fn deliver_all(&self, channels: &[NotificationChannel], payload: &NotificationPayload) -> DeliveryReport {
        let results = join_all(channels.iter().map(|channel| async move {
            (channel, self.deliver_one(channel, payload).await)
        }))
        .await;

        let mut report = DeliveryReport {
            attempted: results.len(),
            ..Default::default()
        };
        for (channel, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        "Failed to send notification via {} ({}): {}",
                        channel.channel_type, channel.name, e
                    );
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", channel.name, e));
                }
            }
        }
        report
    }

    async fn deliver_one(&self, channel: &NotificationChannel, payload: &NotificationPayload) -> Result<(), DeliveryError> {
        match tokio::time::timeout(self.delivery_timeout, self.transport.deliver(channel, payload)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.delivery_timeout)),
        }
    }
}
