//! HTTP and keyword probe implementation.

use std::fmt;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Response};
use serde_json::json;

use super::{ProbeError, ProbeReport};
use crate::db::{KeywordMode, Target};

/// Set of status codes a target accepts, parsed from "200-299,301" style lists.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedStatus {
    ranges: Vec<RangeInclusive<u16>>,
}

impl AcceptedStatus {
    /// Parse a comma-separated list of codes and ranges. Unparsable parts are ignored.
    pub fn parse(list: &str) -> Self {
        let ranges = list
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter_map(|part| match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo = lo.trim().parse::<u16>().ok()?;
                    let hi = hi.trim().parse::<u16>().ok()?;
                    Some(lo..=hi)
                }
                None => part.parse::<u16>().ok().map(|code| code..=code),
            })
            .collect();
        Self { ranges }
    }

    /// `accepted_status_codes` wins over `expected_status`; neither means 2xx.
    pub fn for_target(target: &Target) -> Self {
        if !target.accepted_status_codes.trim().is_empty() {
            Self::parse(&target.accepted_status_codes)
        } else if target.expected_status != 0 {
            Self::parse(&target.expected_status.to_string())
        } else {
            Self { ranges: Vec::new() }
        }
    }

    pub fn accepts(&self, code: u16) -> bool {
        if self.ranges.is_empty() {
            return (200..=299).contains(&code);
        }
        self.ranges.iter().any(|range| range.contains(&code))
    }
}

impl fmt::Display for AcceptedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ranges.is_empty() {
            return f.write_str("200-299");
        }
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|r| {
                if r.start() == r.end() {
                    r.start().to_string()
                } else {
                    format!("{}-{}", r.start(), r.end())
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// Run an HTTP probe: request the URL and judge the status code.
pub async fn run_http_probe(target: &Target) -> Result<ProbeReport, ProbeError> {
    let (response, elapsed) = send_request(target).await?;
    Ok(judge_status(target, &response, elapsed))
}

/// Run a keyword probe: status check first, then match the body.
pub async fn run_keyword_probe(target: &Target) -> Result<ProbeReport, ProbeError> {
    if target.keyword.is_empty() {
        return Err(ProbeError::Config("keyword is required".to_string()));
    }

    let (response, elapsed) = send_request(target).await?;
    let mut report = judge_status(target, &response, elapsed);
    if let Some(meta) = report.metadata.as_object_mut() {
        meta.insert("keyword".to_string(), json!(target.keyword));
        meta.insert("keyword_mode".to_string(), json!(target.keyword_mode.as_str()));
    }
    if report.verdict != super::Verdict::Healthy {
        return Ok(report);
    }

    let body = response
        .text()
        .await
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    match match_keyword(&body, &target.keyword, target.keyword_mode) {
        Ok(()) => Ok(report),
        Err(reason) => Ok(report.failed(reason)),
    }
}

/// Check a body against a keyword. The error is the user-facing reason.
pub fn match_keyword(body: &str, keyword: &str, mode: KeywordMode) -> Result<(), String> {
    let not_found = || format!("Keyword \"{}\" not found in response body", keyword);
    match mode {
        KeywordMode::Contains if body.contains(keyword) => Ok(()),
        KeywordMode::Contains => Err(not_found()),
        KeywordMode::NotContains if body.contains(keyword) => {
            Err(format!("Body contains forbidden keyword: \"{}\"", keyword))
        }
        KeywordMode::NotContains => Ok(()),
        KeywordMode::Regex => {
            let re = Regex::new(keyword).map_err(|_| "Invalid regex pattern in keyword".to_string())?;
            if re.is_match(body) {
                Ok(())
            } else {
                Err(not_found())
            }
        }
    }
}

fn judge_status(target: &Target, response: &Response, elapsed: Duration) -> ProbeReport {
    let status = response.status();
    let code = status.as_u16();
    let report = ProbeReport::healthy(elapsed)
        .with_status_code(code)
        .with_metadata(json!({
            "status_code": code,
            "status_text": status.canonical_reason().unwrap_or(""),
        }));

    let accepted = AcceptedStatus::for_target(target);
    if accepted.accepts(code) {
        report
    } else {
        report.failed(format!("Expected status {}, got {}", accepted, code))
    }
}

/// Send the configured request, returning the response and time to headers.
async fn send_request(target: &Target) -> Result<(Response, Duration), ProbeError> {
    if target.url.is_empty() {
        return Err(ProbeError::Config("url is required".to_string()));
    }

    let timeout = target.timeout();
    let redirects = match target.max_redirects {
        n if n <= 0 => reqwest::redirect::Policy::none(),
        n => reqwest::redirect::Policy::limited(n as usize),
    };
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(redirects)
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))?;

    let method_name = if target.method.trim().is_empty() { "GET" } else { target.method.trim() };
    let method = Method::from_bytes(method_name.to_uppercase().as_bytes())
        .map_err(|_| ProbeError::Config(format!("invalid HTTP method {:?}", target.method)))?;
    let headers = parse_headers(&target.headers)?;
    let has_content_type = headers.contains_key(CONTENT_TYPE);

    let mut request = client.request(method.clone(), &target.url).headers(headers);
    if !target.auth_user.is_empty() {
        request = request.basic_auth(&target.auth_user, Some(&target.auth_pass));
    }
    let sends_body = matches!(method, Method::POST | Method::PUT | Method::PATCH);
    if sends_body && !target.body.is_empty() {
        if !has_content_type {
            request = request.header(CONTENT_TYPE, "application/json");
        }
        request = request.body(target.body.clone());
    }

    let start = Instant::now();
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    Ok((response, start.elapsed()))
}

/// Parse the target's JSON header object. Non-string values are stringified.
fn parse_headers(raw: &str) -> Result<HeaderMap, ProbeError> {
    let mut headers = HeaderMap::new();
    if raw.trim().is_empty() {
        return Ok(headers);
    }

    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)
        .map_err(|e| ProbeError::Config(format!("headers must be a JSON object: {}", e)))?;
    for (name, value) in object {
        let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ProbeError::Config(format!("invalid header name {:?}", name)))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|_| ProbeError::Config(format!("invalid value for header {}", name)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
