//! Notification event payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{
    CheckOutcome, CheckStatus, Incident, IncidentStatus, IncidentUpdate, Target, TargetType,
};

/// Kind of state change being announced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MonitorDown,
    MonitorUp,
    MonitorDegraded,
    IncidentUpdate,
    Test,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetSummary {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: TargetType,
    pub url: String,
}

impl From<&Target> for TargetSummary {
    fn from(target: &Target) -> Self {
        Self {
            id: target.id,
            name: target.name.clone(),
            target_type: target.target_type,
            url: target.address(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IncidentSummary {
    pub id: i64,
    pub title: String,
    pub status: IncidentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckSummary {
    pub status: CheckStatus,
    pub status_code: u16,
    pub response_time_ms: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

impl From<&CheckOutcome> for CheckSummary {
    fn from(outcome: &CheckOutcome) -> Self {
        Self {
            status: outcome.status,
            status_code: outcome.status_code,
            response_time_ms: outcome.response_time_ms,
            error_message: outcome.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub message: String,
    pub status: IncidentStatus,
}

/// The JSON body delivered to every channel.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<TargetSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident: Option<IncidentSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl NotificationPayload {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            monitor: None,
            incident: None,
            check: None,
            update: None,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn down(target: &Target, incident: &Incident, outcome: &CheckOutcome) -> Self {
        Self {
            monitor: Some(target.into()),
            incident: Some(IncidentSummary {
                id: incident.id,
                title: incident.title.clone(),
                status: incident.status,
            }),
            check: Some(outcome.into()),
            ..Self::new(EventKind::MonitorDown)
        }
    }

    pub fn up(target: &Target, incident: &Incident, outcome: &CheckOutcome) -> Self {
        Self {
            monitor: Some(target.into()),
            incident: Some(IncidentSummary {
                id: incident.id,
                title: incident.title.clone(),
                status: IncidentStatus::Resolved,
            }),
            check: Some(outcome.into()),
            ..Self::new(EventKind::MonitorUp)
        }
    }

    pub fn degraded(target: &Target, outcome: &CheckOutcome) -> Self {
        Self {
            monitor: Some(target.into()),
            check: Some(outcome.into()),
            ..Self::new(EventKind::MonitorDegraded)
        }
    }

    pub fn incident_update(target: Option<&Target>, incident: &Incident, update: &IncidentUpdate) -> Self {
        Self {
            monitor: target.map(TargetSummary::from),
            incident: Some(IncidentSummary {
                id: incident.id,
                title: incident.title.clone(),
                status: update.status,
            }),
            update: Some(UpdateSummary {
                message: update.message.clone(),
                status: update.status,
            }),
            ..Self::new(EventKind::IncidentUpdate)
        }
    }

    pub fn test() -> Self {
        Self {
            message: Some("This is a test notification from Waypost".to_string()),
            ..Self::new(EventKind::Test)
        }
    }

    /// One-line human summary for chat channels.
    pub fn summary(&self) -> String {
        let name = self.monitor.as_ref().map(|m| m.name.as_str()).unwrap_or("");
        let check = self.check.as_ref();
        match self.kind {
            EventKind::MonitorDown => {
                let reason = check.map(|c| c.error_message.as_str()).unwrap_or("");
                if reason.is_empty() {
                    format!("[DOWN] {} is not responding", name)
                } else {
                    format!("[DOWN] {}: {}", name, reason)
                }
            }
            EventKind::MonitorUp => format!(
                "[UP] {} is back online ({}ms)",
                name,
                check.map_or(0, |c| c.response_time_ms)
            ),
            EventKind::MonitorDegraded => format!(
                "[DEGRADED] {} responded in {}ms",
                name,
                check.map_or(0, |c| c.response_time_ms)
            ),
            EventKind::IncidentUpdate => {
                let title = self.incident.as_ref().map(|i| i.title.as_str()).unwrap_or("");
                match &self.update {
                    Some(update) => format!(
                        "[{}] {}: {}",
                        update.status.as_str().to_uppercase(),
                        title,
                        update.message
                    ),
                    None => format!("[UPDATE] {}", title),
                }
            }
            EventKind::Test => self.message.clone().unwrap_or_default(),
        }
    }
}
