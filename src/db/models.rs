//! Database model types.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A stored enum column held a value this build does not know.
#[derive(Error, Debug)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a fieldless enum stored as lowercase text, with serde, `Display`,
/// `FromStr` and rusqlite conversions derived from one table.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum! {
    /// Kind of probe run against a target.
    TargetType {
        Http => "http",
        Tcp => "tcp",
        Ping => "ping",
        Dns => "dns",
        Ssl => "ssl",
        Keyword => "keyword",
        Push => "push",
    }
}

text_enum! {
    /// How a keyword target matches the response body.
    KeywordMode {
        Contains => "contains",
        NotContains => "not_contains",
        Regex => "regex",
    }
}

text_enum! {
    /// Health classification of a single check.
    CheckStatus {
        Up => "up",
        Degraded => "degraded",
        Down => "down",
    }
}

text_enum! {
    /// Incident lifecycle. Declaration order is the only allowed direction of travel.
    IncidentStatus {
        Investigating => "investigating",
        Identified => "identified",
        Monitoring => "monitoring",
        Resolved => "resolved",
    }
}

text_enum! {
    /// Who opened an incident.
    IncidentType {
        Auto => "auto",
        Manual => "manual",
    }
}

/// A monitoring target configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub target_type: TargetType,
    pub url: String,
    pub hostname: String,
    pub port: u16,
    pub method: String,
    /// JSON object of extra request headers.
    pub headers: String,
    pub body: String,
    /// Single accepted status code, 0 when unset.
    pub expected_status: u16,
    /// Ranges and codes such as "200-299,301". Takes precedence over `expected_status`.
    pub accepted_status_codes: String,
    pub keyword: String,
    pub keyword_mode: KeywordMode,
    pub dns_record_type: String,
    pub ssl_warn_days: i64,
    #[serde(skip_serializing)]
    pub push_token: String,
    pub push_interval_seconds: i64,
    pub interval_seconds: i64,
    pub timeout_ms: i64,
    pub retries: i64,
    /// Response time above which a healthy check is degraded; 0 disables.
    pub degraded_threshold_ms: i64,
    pub max_redirects: i64,
    pub auth_user: String,
    #[serde(skip_serializing)]
    pub auth_pass: String,
    pub active: bool,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            target_type: TargetType::Http,
            url: String::new(),
            hostname: String::new(),
            port: 0,
            method: "GET".to_string(),
            headers: "{}".to_string(),
            body: String::new(),
            expected_status: 0,
            accepted_status_codes: "200-299".to_string(),
            keyword: String::new(),
            keyword_mode: KeywordMode::Contains,
            dns_record_type: "A".to_string(),
            ssl_warn_days: 30,
            push_token: String::new(),
            push_interval_seconds: 60,
            interval_seconds: 60,
            timeout_ms: 10_000,
            retries: 3,
            degraded_threshold_ms: 2_000,
            max_redirects: 5,
            auth_user: String::new(),
            auth_pass: String::new(),
            active: true,
        }
    }
}

impl Target {
    /// Whether the scheduler owns a timer for this target.
    pub fn is_schedulable(&self) -> bool {
        self.active && self.target_type != TargetType::Push
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(if self.interval_seconds <= 0 { 60 } else { self.interval_seconds as u64 })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(if self.timeout_ms <= 0 { 10_000 } else { self.timeout_ms as u64 })
    }

    /// Consecutive down outcomes needed before an auto incident opens.
    pub fn failure_threshold(&self) -> u32 {
        if self.retries <= 0 {
            3
        } else {
            u32::try_from(self.retries).unwrap_or(u32::MAX)
        }
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(if self.push_interval_seconds <= 0 {
            60
        } else {
            self.push_interval_seconds as u64
        })
    }

    /// Allowed silence for a push target: one and a half push intervals.
    pub fn grace_period(&self) -> Duration {
        self.push_interval().mul_f64(1.5)
    }

    /// Human-facing address used in notifications.
    pub fn address(&self) -> String {
        if !self.url.is_empty() {
            self.url.clone()
        } else if self.port != 0 {
            format!("{}:{}", self.hostname, self.port)
        } else {
            self.hostname.clone()
        }
    }

    /// Hostname, falling back to the host part of the URL.
    pub fn host(&self) -> Option<String> {
        if !self.hostname.is_empty() {
            return Some(self.hostname.clone());
        }
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string()))
    }
}

/// The result of one probe execution.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub target_id: i64,
    pub status: CheckStatus,
    pub response_time_ms: i64,
    /// Protocol status code, 0 when not applicable.
    pub status_code: u16,
    pub error_message: String,
    pub metadata: serde_json::Value,
    pub time: DateTime<Utc>,
}

impl CheckOutcome {
    pub fn new(target_id: i64, status: CheckStatus) -> Self {
        Self {
            target_id,
            status,
            response_time_ms: 0,
            status_code: 0,
            error_message: String::new(),
            metadata: serde_json::Value::Object(Default::default()),
            time: Utc::now(),
        }
    }

    pub fn down(target_id: i64, error_message: impl Into<String>) -> Self {
        Self {
            error_message: error_message.into(),
            ..Self::new(target_id, CheckStatus::Down)
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }
}

/// An incident, auto-opened by threshold logic or opened by an operator.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: i64,
    /// `None` for cross-cutting manual incidents.
    pub target_id: Option<i64>,
    pub title: String,
    pub incident_type: IncidentType,
    pub status: IncidentStatus,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Fields needed to open an incident.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub target_id: Option<i64>,
    pub title: String,
    pub incident_type: IncidentType,
}

/// One entry of an incident's audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentUpdate {
    pub id: i64,
    pub incident_id: i64,
    pub status: IncidentStatus,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// An outbound notification channel.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationChannel {
    pub id: i64,
    pub name: String,
    pub channel_type: String,
    pub config: serde_json::Value,
    pub active: bool,
}

/// A declared window during which probing is suppressed.
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceWindow {
    pub id: i64,
    /// `None` applies to every target.
    pub target_id: Option<i64>,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub active: bool,
}
