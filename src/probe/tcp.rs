//! TCP connect probe implementation.

use std::time::Instant;

use serde_json::json;
use tokio::net::TcpStream;

use super::{ProbeError, ProbeReport};
use crate::db::Target;

/// Open a TCP connection to `hostname:port` and close it immediately.
pub async fn run_tcp_probe(target: &Target) -> Result<ProbeReport, ProbeError> {
    let host = target
        .host()
        .ok_or_else(|| ProbeError::Config("hostname is required".to_string()))?;
    if target.port == 0 {
        return Err(ProbeError::Config("port is required".to_string()));
    }

    let timeout = target.timeout();
    let start = Instant::now();
    let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), target.port)))
        .await
        .map_err(|_| {
            ProbeError::Network(format!(
                "Connection to {}:{} timed out after {}ms",
                host,
                target.port,
                timeout.as_millis()
            ))
        })?
        .map_err(|e| {
            ProbeError::Network(format!("TCP connection to {}:{} failed: {}", host, target.port, e))
        })?;
    let elapsed = start.elapsed();
    drop(stream);

    Ok(ProbeReport::healthy(elapsed).with_metadata(json!({
        "host": host,
        "port": target.port,
    })))
}
