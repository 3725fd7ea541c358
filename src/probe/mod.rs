//! Probe module for endpoint checks.
//!
//! Supports HTTP, keyword, TCP, Ping, DNS and TLS certificate probes. Every
//! probe failure ends up as a `down` [`CheckOutcome`]; nothing here returns an
//! error to the caller.

mod dns;
mod http;
mod ping;
mod ssl;
mod tcp;

pub use dns::*;
pub use http::*;
pub use ping::*;
pub use ssl::*;
pub use tcp::*;

use crate::db::{CheckOutcome, CheckStatus, Target, TargetType};

use async_trait::async_trait;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Timeout after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("{0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// How a probe judged the response it got.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Healthy,
    /// Reachable and correct but worth flagging, e.g. a certificate close to expiry.
    Warning(String),
    /// Reachable but wrong: bad status, missing keyword, expired certificate.
    Failed(String),
}

/// What a probe observed when it got an answer.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub elapsed: Duration,
    pub status_code: u16,
    pub metadata: serde_json::Value,
    pub verdict: Verdict,
}

impl ProbeReport {
    pub fn healthy(elapsed: Duration) -> Self {
        Self {
            elapsed,
            status_code: 0,
            metadata: serde_json::Value::Object(Default::default()),
            verdict: Verdict::Healthy,
        }
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = code;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.verdict = Verdict::Failed(reason.into());
        self
    }

    pub fn warning(mut self, reason: impl Into<String>) -> Self {
        self.verdict = Verdict::Warning(reason.into());
        self
    }
}

/// Turns a target's configuration into a [`CheckOutcome`].
#[async_trait]
pub trait Checker: Send + Sync {
    /// Run one check. Must not outlive the target's timeout and must not fail.
    async fn check(&self, target: &Target) -> CheckOutcome;
}

/// The production checker: dispatches on the target type to the probes below.
#[derive(Debug, Clone)]
pub struct ProbeChecker {
    max_jitter: Duration,
}

impl ProbeChecker {
    pub fn new() -> Self {
        Self {
            max_jitter: Duration::from_millis(100),
        }
    }
}

impl Default for ProbeChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Checker for ProbeChecker {
    async fn check(&self, target: &Target) -> CheckOutcome {
        let timeout = target.timeout();
        let jitter_ms = jitter_ceiling(self.max_jitter, timeout).as_millis() as u64;
        let start = Instant::now();
        let attempt = async {
            // Start offset; counts against the timeout, not the response time.
            if jitter_ms > 0 {
                let jitter = rand::random::<u64>() % jitter_ms;
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }
            run_probe(target).await
        };
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(timeout)),
        };

        classify(target, result, start.elapsed())
    }
}

/// Upper bound for the start offset: never more than a tenth of the timeout.
fn jitter_ceiling(max_jitter: Duration, timeout: Duration) -> Duration {
    max_jitter.min(timeout / 10)
}

/// Run the probe matching the target's type.
pub async fn run_probe(target: &Target) -> Result<ProbeReport, ProbeError> {
    match target.target_type {
        TargetType::Http => run_http_probe(target).await,
        TargetType::Keyword => run_keyword_probe(target).await,
        TargetType::Tcp => run_tcp_probe(target).await,
        TargetType::Ping => run_ping_probe(target).await,
        TargetType::Dns => run_dns_probe(target).await,
        TargetType::Ssl => run_ssl_probe(target).await,
        TargetType::Push => Err(ProbeError::Config(
            "push targets are passive and have no active check".to_string(),
        )),
    }
}

/// Map a probe result onto up/degraded/down.
pub fn classify(
    target: &Target,
    result: Result<ProbeReport, ProbeError>,
    wall_time: Duration,
) -> CheckOutcome {
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            let mut outcome = CheckOutcome::down(target.id, e.to_string());
            outcome.response_time_ms = wall_time.as_millis() as i64;
            return outcome;
        }
    };

    let response_time_ms = report.elapsed.as_millis() as i64;
    let (status, error_message) = match report.verdict {
        Verdict::Failed(reason) => (CheckStatus::Down, reason),
        Verdict::Warning(reason) => (CheckStatus::Degraded, reason),
        Verdict::Healthy
            if target.degraded_threshold_ms > 0 && response_time_ms > target.degraded_threshold_ms =>
        {
            (CheckStatus::Degraded, String::new())
        }
        Verdict::Healthy => (CheckStatus::Up, String::new()),
    };

    CheckOutcome {
        response_time_ms,
        status_code: report.status_code,
        error_message,
        ..CheckOutcome::new(target.id, status)
    }
    .with_metadata(report.metadata)
}
