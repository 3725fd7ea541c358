//! DNS probe implementation.
//!
//! Resolves the target's hostname with the system resolver configuration and
//! reports the records found for the configured record type.

use std::time::Instant;

use hickory_resolver::config::ResolverOpts;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioResolver;
use serde_json::json;

use super::{ProbeError, ProbeReport};
use crate::db::Target;

/// Record types a DNS target may ask for. Anything else falls back to A.
pub fn parse_record_type(raw: &str) -> RecordType {
    match raw.trim().to_ascii_uppercase().as_str() {
        "AAAA" => RecordType::AAAA,
        "MX" => RecordType::MX,
        "TXT" => RecordType::TXT,
        "CNAME" => RecordType::CNAME,
        "NS" => RecordType::NS,
        _ => RecordType::A,
    }
}

/// Render one answer as text. Returns `None` for record types not asked for.
pub fn format_record(rdata: &RData) -> Option<String> {
    let name = |n: &hickory_resolver::proto::rr::Name| n.to_utf8().trim_end_matches('.').to_string();
    match rdata {
        RData::A(a) => Some(a.to_string()),
        RData::AAAA(aaaa) => Some(aaaa.to_string()),
        RData::MX(mx) => Some(format!("{} {}", mx.preference(), name(mx.exchange()))),
        RData::TXT(txt) => Some(
            txt.iter()
                .map(|bytes| String::from_utf8_lossy(bytes).to_string())
                .collect::<Vec<String>>()
                .join(""),
        ),
        RData::CNAME(cname) => Some(name(&cname.0)),
        RData::NS(ns) => Some(name(&ns.0)),
        _ => None,
    }
}

/// Resolve the target's hostname for its configured record type.
pub async fn run_dns_probe(target: &Target) -> Result<ProbeReport, ProbeError> {
    let host = target
        .host()
        .ok_or_else(|| ProbeError::Config("hostname is required".to_string()))?;
    let record_type = parse_record_type(&target.dns_record_type);

    let mut opts = ResolverOpts::default();
    opts.timeout = target.timeout();
    opts.attempts = 1;
    let resolver = TokioResolver::builder_tokio()
        .map_err(|e| ProbeError::Config(format!("failed to load resolver configuration: {}", e)))?
        .with_options(opts)
        .build();

    let start = Instant::now();
    let lookup = resolver
        .lookup(host.as_str(), record_type)
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", host, e)))?;
    let elapsed = start.elapsed();

    let wanted = |rdata: &&RData| rdata.record_type() == record_type;
    let records: Vec<String> = lookup.iter().filter(wanted).filter_map(format_record).collect();

    let report = ProbeReport::healthy(elapsed).with_metadata(json!({
        "hostname": host,
        "record_type": record_type.to_string(),
        "records": records,
    }));
    if records.is_empty() {
        return Ok(report.failed(format!("No {} records found for {}", record_type, host)));
    }
    Ok(report)
}
