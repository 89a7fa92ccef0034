//! Line parsers for the log collector.
//!
//! All parsers stamp `time = now`, truncate the summary to 500 chars, and
//! keep the raw line (truncated to 2000) under `payload.raw`.

use crate::event::{truncate_chars, Category, Event, Severity};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;

const SUMMARY_MAX: usize = 500;
const RAW_MAX: usize = 2000;

static NGINX_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(\S+) - (\S+) \[([^\]]+)\] "(\S+) (\S+) (\S+)" (\d+) (\d+)"#).unwrap()
});

static AUTH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+\s+\d+\s+[\d:]+)\s+(\S+)\s+(\S+?)(?:\[\d+\])?: (.+)").unwrap());

/// Pick a parser for a file source from its lowercase path.
pub fn detect_parser(path: &str) -> fn(&str) -> Event {
    let lower = path.to_lowercase();
    if lower.contains("nginx") && lower.contains("access") {
        parse_nginx_access
    } else if lower.contains("auth") || lower.contains("secure") {
        parse_auth_log
    } else {
        parse_syslog
    }
}

pub fn parse_syslog(line: &str) -> Event {
    let lower = line.to_lowercase();
    let severity = if lower.contains("critical") || lower.contains("emergency") {
        Severity::Critical
    } else if lower.contains("error") || lower.contains("fail") {
        Severity::Medium
    } else {
        Severity::Info
    };

    // The text after the third space, when present, is the message
    let parts: Vec<&str> = line.splitn(4, ' ').collect();
    let summary = if parts.len() >= 4 { parts[3] } else { line };

    Event {
        time: Some(Utc::now()),
        org_id: String::new(),
        agent_id: String::new(),
        source: "syslog".to_string(),
        category: Category::System,
        severity,
        risk_score: 0.0,
        summary: truncate_chars(summary, SUMMARY_MAX),
        payload: raw_payload(line),
    }
}

pub fn parse_nginx_access(line: &str) -> Event {
    let mut severity = Severity::Info;
    let mut category = Category::Web;
    let mut payload = raw_payload(line);

    if let Some(caps) = NGINX_PATTERN.captures(line) {
        payload.insert("remote_addr".into(), caps[1].into());
        payload.insert("method".into(), caps[4].into());
        payload.insert("path".into(), caps[5].into());
        payload.insert("status".into(), caps[7].into());
        payload.insert("bytes".into(), caps[8].into());

        let status = &caps[7];
        if status.starts_with('4') {
            severity = Severity::Low;
            category = Category::WebError;
        } else if status.starts_with('5') {
            severity = Severity::Medium;
            category = Category::WebError;
        }
    }

    Event {
        time: Some(Utc::now()),
        org_id: String::new(),
        agent_id: String::new(),
        source: "nginx".to_string(),
        category,
        severity,
        risk_score: 0.0,
        summary: truncate_chars(line, SUMMARY_MAX),
        payload,
    }
}

pub fn parse_auth_log(line: &str) -> Event {
    let mut payload = raw_payload(line);

    if let Some(caps) = AUTH_PATTERN.captures(line) {
        payload.insert("hostname".into(), caps[2].into());
        payload.insert("service".into(), caps[3].into());
        payload.insert("message".into(), caps[4].into());
    }

    let lower = line.to_lowercase();
    let (category, severity) = if lower.contains("break-in") || lower.contains("repeated") {
        (Category::AuthBruteForce, Severity::High)
    } else if lower.contains("accepted") {
        (Category::AuthSuccess, Severity::Info)
    } else if lower.contains("failed") || lower.contains("invalid") {
        (Category::AuthFailure, Severity::Medium)
    } else {
        (Category::Other("auth".to_string()), Severity::Info)
    };

    Event {
        time: Some(Utc::now()),
        org_id: String::new(),
        agent_id: String::new(),
        source: "auth".to_string(),
        category,
        severity,
        risk_score: 0.0,
        summary: truncate_chars(line, SUMMARY_MAX),
        payload,
    }
}

fn raw_payload(line: &str) -> serde_json::Map<String, serde_json::Value> {
    let mut payload = serde_json::Map::new();
    payload.insert("raw".into(), truncate_chars(line, RAW_MAX).into());
    payload
}
