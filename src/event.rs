//! The event envelope shared by agents and the analysis engine.
//!
//! Events are the unit of observation: every collector produces them, the
//! agent runtime stamps and publishes them, and the engine pipelines consume
//! them. The wire form is a UTF-8 JSON object and must round-trip exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered severity level. Always from this closed set; a message carrying
/// anything else fails deserialization and is dropped by the receiver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic event class. The named variants form the taxonomy the pipelines
/// key their rules and multipliers on; unknown tokens are legal on the wire
/// and survive round-trips via [`Category::Other`], but collectors must not
/// invent them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "String", into = "String")]
pub enum Category {
    System,
    AuthFailure,
    AuthSuccess,
    AuthBruteForce,
    Web,
    WebError,
    PortScan,
    SuspiciousPort,
    HighTraffic,
    Misconfiguration,
    CredentialHygiene,
    Attack,
    Availability,
    Other(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::System => "system",
            Category::AuthFailure => "auth_failure",
            Category::AuthSuccess => "auth_success",
            Category::AuthBruteForce => "auth_brute_force",
            Category::Web => "web",
            Category::WebError => "web_error",
            Category::PortScan => "port_scan",
            Category::SuspiciousPort => "suspicious_port",
            Category::HighTraffic => "high_traffic",
            Category::Misconfiguration => "misconfiguration",
            Category::CredentialHygiene => "credential_hygiene",
            Category::Attack => "attack",
            Category::Availability => "availability",
            Category::Other(s) => s.as_str(),
        }
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        match s {
            "system" => Category::System,
            "auth_failure" => Category::AuthFailure,
            "auth_success" => Category::AuthSuccess,
            "auth_brute_force" => Category::AuthBruteForce,
            "web" => Category::Web,
            "web_error" => Category::WebError,
            "port_scan" => Category::PortScan,
            "suspicious_port" => Category::SuspiciousPort,
            "high_traffic" => Category::HighTraffic,
            "misconfiguration" => Category::Misconfiguration,
            "credential_hygiene" => Category::CredentialHygiene,
            "attack" => Category::Attack,
            "availability" => Category::Availability,
            other => Category::Other(other.to_string()),
        }
    }
}

impl From<String> for Category {
    fn from(s: String) -> Self {
        Category::from(s.as_str())
    }
}

impl From<Category> for String {
    fn from(c: Category) -> Self {
        c.as_str().to_string()
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized observation from a collector.
///
/// `org_id`, `agent_id`, and (when unset) `time` are stamped by the agent
/// runtime at publish time; producers only fill the rest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub org_id: String,
    #[serde(default)]
    pub agent_id: String,
    pub source: String,
    pub category: Category,
    pub severity: Severity,
    #[serde(default)]
    pub risk_score: f32,
    pub summary: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, Value>,
}

impl Event {
    pub fn new(
        source: impl Into<String>,
        category: Category,
        severity: Severity,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            time: Some(Utc::now()),
            org_id: String::new(),
            agent_id: String::new(),
            source: source.into(),
            category,
            severity,
            risk_score: 0.0,
            summary: summary.into(),
            payload: serde_json::Map::new(),
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = org_id.into();
        self
    }
}

/// Truncate a string to at most `max` bytes without splitting a character.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Generate a locally unique id from a millisecond timestamp, a
/// process-wide sequence number, and a short entropy tail.
pub fn unique_id(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);

    let mut entropy = [0u8; 6];
    if getrandom::getrandom(&mut entropy).is_err() {
        // No OS entropy source; the sequence number still keeps ids unique
        // within the process
        let fill = (u64::from(std::process::id())).rotate_left(33) ^ seq ^ millis;
        entropy.copy_from_slice(&fill.to_le_bytes()[..6]);
    }

    let mut id = format!("{}-{:011x}-{:04x}-", prefix, millis, seq & 0xFFFF);
    for byte in entropy {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}
