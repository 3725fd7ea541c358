//! Ping probe implementation with native ICMP and command fallback.
//!
//! Native echoes run on blocking sockets inside spawn_blocking so the round
//! trip is timed on a dedicated thread.

use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::json;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, ProbeReport};
use crate::db::Target;

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier and sequence for one echo request.
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW; DGRAM works unprivileged where ping_group_range allows it.
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }
    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// How an echo attempt went wrong.
enum EchoFailure {
    /// The socket could not be used at all; the command fallback may still work.
    Denied(io::Error),
    NoReply,
    Failed(ProbeError),
}

/// A successful echo.
#[derive(Debug, Clone)]
pub struct PingReply {
    pub ip: IpAddr,
    pub rtt: Duration,
    pub method: &'static str,
}

/// Send one echo request to the target host.
///
/// An unanswered echo is reported as a down verdict rather than an error so
/// the message names the host.
pub async fn run_ping_probe(target: &Target) -> Result<ProbeReport, ProbeError> {
    let host = target
        .host()
        .ok_or_else(|| ProbeError::Config("hostname is required".to_string()))?;

    // Leave headroom under the outer deadline so a silent host reads as unreachable.
    let wait = target.timeout().mul_f64(0.9);
    match ping_host(&host, wait).await? {
        Some(reply) => Ok(ProbeReport::healthy(reply.rtt).with_metadata(json!({
            "host": host,
            "ip": reply.ip.to_string(),
            "method": reply.method,
        }))),
        None => Ok(ProbeReport::healthy(wait)
            .with_metadata(json!({ "host": host }))
            .failed(format!("Host {} is unreachable", host))),
    }
}

/// Ping a host once. `Ok(None)` means no reply arrived within `wait`.
pub async fn ping_host(host: &str, wait: Duration) -> Result<Option<PingReply>, ProbeError> {
    let ip = resolve_address(host).await?;

    if *ICMP_CAPABILITY.get_or_init(detect_icmp_capability) == IcmpCapability::Native {
        let result = tokio::task::spawn_blocking(move || blocking_echo(ip, wait))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Ok(rtt) => {
                return Ok(Some(PingReply {
                    ip,
                    rtt,
                    method: "icmp",
                }))
            }
            Err(EchoFailure::NoReply) => return Ok(None),
            Err(EchoFailure::Failed(e)) => return Err(e),
            Err(EchoFailure::Denied(e)) => {
                tracing::warn!(
                    "Native ping to {} not permitted, falling back to command: {}",
                    host,
                    e
                );
            }
        }
    }

    let rtt = run_ping_command(&ip.to_string(), wait).await?;
    Ok(rtt.map(|rtt| PingReply {
        ip,
        rtt,
        method: "command",
    }))
}

async fn resolve_address(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", host, e)))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", host)))
}

fn denied_or(e: io::Error, context: &str) -> EchoFailure {
    match e.kind() {
        io::ErrorKind::PermissionDenied => EchoFailure::Denied(e),
        _ => EchoFailure::Failed(ProbeError::Network(format!("{}: {}", context, e))),
    }
}

/// One ICMP echo round trip on a blocking socket.
fn blocking_echo(ip: IpAddr, wait: Duration) -> Result<Duration, EchoFailure> {
    let (domain, protocol, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, 8u8, 0u8),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, 128u8, 129u8),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged)
    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => (socket, true),
        Err(_) => Socket::new(domain, Type::DGRAM, Some(protocol))
            .map(|socket| (socket, false))
            .map_err(|e| denied_or(e, "Failed to create ICMP socket"))?,
    };

    socket
        .set_write_timeout(Some(wait))
        .map_err(|e| denied_or(e, "Failed to set timeout"))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| denied_or(e, "Failed to connect"))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(request_type, identifier, sequence, ip.is_ipv4());

    let deadline = Instant::now() + wait;
    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| denied_or(e, "Failed to send"))?;

    // DGRAM sockets get their identifier rewritten by the kernel, so only RAW replies are matched on it.
    let expected_id = raw.then_some(identifier);
    let mut buf = [0u8; 1500];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(EchoFailure::NoReply);
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| denied_or(e, "Failed to set timeout"))?;

        let len = match (&socket).read(&mut buf) {
            Ok(len) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(EchoFailure::NoReply)
            }
            Err(e) => return Err(denied_or(e, "Failed to receive")),
        };
        let elapsed = start.elapsed();

        if is_echo_reply(&buf[..len], reply_type, expected_id, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Build an ICMP or ICMPv6 echo request. The kernel fills in the ICMPv6 checksum.
fn build_echo_request(icmp_type: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = icmp_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    for (i, byte) in packet[8..].iter_mut().enumerate() {
        *byte = i as u8;
    }

    if with_checksum {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// Whether a received packet is the reply to our request. RAW IPv4 reads include the IP header.
fn is_echo_reply(packet: &[u8], reply_type: u8, identifier: Option<u16>, sequence: u16) -> bool {
    let offset = match packet.first() {
        Some(first) if first >> 4 == 4 => usize::from(first & 0x0f) * 4,
        _ => 0,
    };
    let Some(icmp) = packet.get(offset..offset + 8) else {
        return false;
    };

    let reply_id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let reply_seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    icmp[0] == reply_type && reply_seq == sequence && identifier.map_or(true, |id| id == reply_id)
}

/// Internet checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match *pair {
            [hi, lo] => u32::from(u16::from_be_bytes([hi, lo])),
            [hi] => u32::from(hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Run the system ping binary. `Ok(None)` means the host did not answer.
async fn run_ping_command(address: &str, wait: Duration) -> Result<Option<Duration>, ProbeError> {
    let wait_secs = wait.as_secs().max(1);

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &wait_secs.to_string(), address])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("timeout")
            || stdout.contains("100% packet loss")
            || stdout.contains("100.0% packet loss")
        {
            return Ok(None);
        }
        return Err(ProbeError::Command(format!("ping failed: {}{}", stdout, stderr)));
    }

    parse_ping_output(&stdout).map(Some)
}

/// Parse ping command output for the round trip time.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    // Per-packet "time=X.XXX ms" (Linux, some macOS)
    static PER_PACKET: OnceLock<Option<Regex>> = OnceLock::new();
    // Summary "round-trip min/avg/max/stddev" (macOS) or "rtt min/avg/max/mdev" (Linux)
    static SUMMARY: OnceLock<Option<Regex>> = OnceLock::new();

    let per_packet = PER_PACKET.get_or_init(|| Regex::new(r"time[=<](?P<ms>[0-9.]+)\s*ms").ok());
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:round-trip|rtt)\s+min/avg/max/(?:stddev|mdev)\s*=\s*[0-9.]+/(?P<ms>[0-9.]+)/").ok()
    });

    [per_packet, summary]
        .into_iter()
        .flatten()
        .find_map(|re| {
            re.captures(output)
                .and_then(|caps| caps.name("ms"))
                .and_then(|m| m.as_str().parse::<f64>().ok())
        })
        .map(|ms| Duration::from_micros((ms * 1000.0).round() as u64))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
