//! Alert generation: risk-threshold gate, time-windowed deduplication, and
//! fire-and-forget delivery to the API and webhook sinks.

use crate::engine::{CorrelationResult, Pipeline};
use crate::event::{unique_id, Category, Event, Severity};
use crate::metrics;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DEFAULT_RISK_THRESHOLD: f64 = 5.0;
const DEFAULT_DEDUP_WINDOW_SECS: i64 = 5 * 60;
const DEDUP_MAX_ENTRIES: usize = 10_000;
const ALERT_CHANNEL_CAP: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub org_id: String,
    pub agent_id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub category: Category,
    pub status: AlertStatus,
    pub source: String,
    pub risk_score: f64,
    pub event_count: usize,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

struct AlerterState {
    alerts: Vec<Alert>,
    dedup: LruCache<String, DateTime<Utc>>,
}

pub struct AlertGenerator {
    state: Mutex<AlerterState>,
    api_url: String,
    webhook_url: String,
    threshold: f64,
    dedup_window: ChronoDuration,
    alert_tx: mpsc::Sender<Alert>,
    alert_rx: Mutex<Option<mpsc::Receiver<Alert>>>,
    http: reqwest::Client,
}

impl AlertGenerator {
    pub fn new(api_url: &str, webhook_url: &str, threshold: f64) -> Self {
        Self::with_dedup_window(
            api_url,
            webhook_url,
            threshold,
            ChronoDuration::seconds(DEFAULT_DEDUP_WINDOW_SECS),
        )
    }

    pub fn with_dedup_window(
        api_url: &str,
        webhook_url: &str,
        threshold: f64,
        dedup_window: ChronoDuration,
    ) -> Self {
        let threshold = if threshold <= 0.0 {
            DEFAULT_RISK_THRESHOLD
        } else {
            threshold
        };
        let (alert_tx, alert_rx) = mpsc::channel(ALERT_CHANNEL_CAP);
        Self {
            state: Mutex::new(AlerterState {
                alerts: Vec::new(),
                dedup: LruCache::new(NonZeroUsize::new(DEDUP_MAX_ENTRIES).unwrap()),
            }),
            api_url: api_url.to_string(),
            webhook_url: webhook_url.to_string(),
            threshold,
            dedup_window,
            alert_tx,
            alert_rx: Mutex::new(Some(alert_rx)),
            http: reqwest::Client::new(),
        }
    }

    /// Receiver side of the bounded alert feed. Takeable once.
    pub fn take_alerts(&self) -> Option<mpsc::Receiver<Alert>> {
        self.alert_rx.lock().unwrap().take()
    }

    pub fn process_event(&self, event: &Event) {
        let risk = event_risk(event);
        if risk < self.threshold {
            return;
        }

        let alert = Alert {
            id: unique_id("alt"),
            org_id: event.org_id.clone(),
            agent_id: event.agent_id.clone(),
            title: title_for(&event.category),
            description: event.summary.clone(),
            severity: event.severity,
            category: event.category.clone(),
            status: AlertStatus::Open,
            source: event.source.clone(),
            risk_score: risk,
            event_count: 1,
            payload: event.payload.clone(),
            created_at: Utc::now(),
        };

        self.emit_alert(alert);
    }

    pub fn process_correlation(&self, result: &CorrelationResult) {
        let (org_id, agent_id) = match result.events.first() {
            Some(e) => (e.org_id.clone(), e.agent_id.clone()),
            None => (String::new(), String::new()),
        };

        let alert = Alert {
            id: unique_id("cor"),
            org_id,
            agent_id,
            title: format!("Correlated: {}", result.rule),
            description: result.summary.clone(),
            severity: result.severity,
            category: result.category.clone(),
            status: AlertStatus::Open,
            source: "correlation".to_string(),
            risk_score: correlation_risk(result),
            event_count: result.events.len(),
            payload: serde_json::Map::new(),
            created_at: Utc::now(),
        };

        self.emit_alert(alert);
    }

    fn emit_alert(&self, alert: Alert) {
        let dedup_key = format!("{}-{}-{}", alert.org_id, alert.category, alert.severity);
        let now = Utc::now();

        {
            let mut state = self.state.lock().unwrap();
            if let Some(last) = state.dedup.get(&dedup_key) {
                if now - *last < self.dedup_window {
                    debug!("alert generator: suppressing duplicate {}", dedup_key);
                    metrics::ALERTS_SUPPRESSED.inc();
                    return;
                }
            }
            state.dedup.put(dedup_key, now);
            state.alerts.push(alert.clone());
        }

        metrics::ALERTS_TOTAL
            .with_label_values(&[alert.severity.as_str()])
            .inc();
        let _ = self.alert_tx.try_send(alert.clone());

        if !self.api_url.is_empty() {
            let client = self.http.clone();
            let url = format!("{}/api/v1/alerts", self.api_url);
            let body = alert.clone();
            tokio::spawn(async move {
                if let Err(e) = client.post(&url).json(&body).send().await {
                    warn!("alert generator: failed to send to API: {}", e);
                    metrics::SINK_FAILURES.with_label_values(&["api"]).inc();
                }
            });
        }

        if !self.webhook_url.is_empty() {
            let client = self.http.clone();
            let url = self.webhook_url.clone();
            let payload = serde_json::json!({
                "text": format!("[{}] {}: {}", alert.severity, alert.title, alert.description),
                "alert": alert,
            });
            tokio::spawn(async move {
                if let Err(e) = client.post(&url).json(&payload).send().await {
                    warn!("alert generator: webhook failed: {}", e);
                    metrics::SINK_FAILURES.with_label_values(&["webhook"]).inc();
                }
            });
        }
    }

    /// Copy of every alert generated so far.
    pub fn get_alerts(&self) -> Vec<Alert> {
        self.state.lock().unwrap().alerts.clone()
    }

    pub fn alert_count(&self) -> usize {
        self.state.lock().unwrap().alerts.len()
    }
}

impl Pipeline for AlertGenerator {
    fn name(&self) -> &str {
        "alerting"
    }

    fn process(&self, event: &Event) -> Result<()> {
        self.process_event(event);
        Ok(())
    }
}

/// Alert risk for a single event. Distinct from the scorer's penalty
/// weighting: the same severity table, with the alerter's own category
/// multipliers.
fn event_risk(event: &Event) -> f64 {
    let base = match event.severity {
        Severity::Info => 0.0,
        Severity::Low => 1.0,
        Severity::Medium => 3.0,
        Severity::High => 7.0,
        Severity::Critical => 10.0,
    };

    let multiplier = match event.category.as_str() {
        "attack" | "auth_brute_force" | "port_scan" => 1.5,
        "suspicious_port" => 1.4,
        "misconfiguration" => 1.2,
        _ => 1.0,
    };

    base * multiplier
}

/// Risk for a correlated finding: severity base plus a capped per-event
/// bonus.
fn correlation_risk(result: &CorrelationResult) -> f64 {
    let base = match result.severity {
        Severity::Medium => 6.0,
        Severity::High => 8.0,
        Severity::Critical => 10.0,
        _ => 0.0,
    };
    base + 0.5 * (result.events.len().min(10) as f64)
}

fn title_for(category: &Category) -> String {
    match category.as_str() {
        "auth_failure" => "Authentication Failure Detected".to_string(),
        "auth_brute_force" => "Brute Force Attack Detected".to_string(),
        "port_scan" => "Port Scan Detected".to_string(),
        "suspicious_port" => "Suspicious Port Connection".to_string(),
        "misconfiguration" => "Cloud Misconfiguration Found".to_string(),
        "web_error" => "Web Service Errors".to_string(),
        "high_traffic" => "Abnormal Traffic Pattern".to_string(),
        other => format!("Security Event: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> AlertGenerator {
        // No sinks configured: emit_alert stays fully synchronous
        AlertGenerator::new("", "", 5.0)
    }

    fn event(org: &str, category: Category, severity: Severity) -> Event {
        Event::new("test", category, severity, "test event").with_org(org)
    }

    #[test]
    fn test_info_event_dropped() {
        let g = generator();
        g.process_event(&event("org-1", Category::System, Severity::Info));
        assert_eq!(g.alert_count(), 0);
    }

    #[test]
    fn test_medium_without_multiplier_below_threshold() {
        let g = generator();
        g.process_event(&event("org-1", Category::WebError, Severity::Medium));
        assert_eq!(g.alert_count(), 0);
    }

    #[test]
    fn test_high_brute_force_alerts() {
        let g = generator();
        g.process_event(&event("org-1", Category::AuthBruteForce, Severity::High));
        let alerts = g.get_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, "Brute Force Attack Detected");
        assert_eq!(alerts[0].status, AlertStatus::Open);
        assert_eq!(alerts[0].event_count, 1);
        assert!((alerts[0].risk_score - 10.5).abs() < 0.01); // 7 x 1.5
    }

    #[test]
    fn test_dedup_suppresses_within_window() {
        let g = generator();
        for _ in 0..5 {
            g.process_event(&event("org-1", Category::AuthBruteForce, Severity::High));
        }
        assert_eq!(g.alert_count(), 1);
    }

    #[test]
    fn test_dedup_expires_after_window() {
        let g = AlertGenerator::with_dedup_window("", "", 5.0, ChronoDuration::milliseconds(50));
        g.process_event(&event("org-1", Category::AuthBruteForce, Severity::High));
        std::thread::sleep(std::time::Duration::from_millis(80));
        g.process_event(&event("org-1", Category::AuthBruteForce, Severity::High));
        assert_eq!(g.alert_count(), 2);
    }

    #[test]
    fn test_dedup_key_includes_org_category_severity() {
        let g = generator();
        g.process_event(&event("org-1", Category::AuthBruteForce, Severity::High));
        // Different tenant, same category/severity: not a duplicate
        g.process_event(&event("org-2", Category::AuthBruteForce, Severity::High));
        // Same tenant, different severity: not a duplicate
        g.process_event(&event("org-1", Category::AuthBruteForce, Severity::Critical));
        assert_eq!(g.alert_count(), 3);
    }

    #[test]
    fn test_correlation_alert_fields() {
        let g = generator();
        let events: Vec<Event> = (0..6)
            .map(|_| {
                let mut e = event("org-1", Category::AuthFailure, Severity::Medium);
                e.agent_id = "agent-1".to_string();
                e
            })
            .collect();
        let result = CorrelationResult {
            rule: "brute_force_attack".to_string(),
            events,
            severity: Severity::High,
            category: Category::Attack,
            summary: "Multiple authentication failures detected from same source".to_string(),
            timestamp: Utc::now(),
        };

        g.process_correlation(&result);
        let alerts = g.get_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].title, "Correlated: brute_force_attack");
        assert_eq!(alerts[0].source, "correlation");
        assert_eq!(alerts[0].event_count, 6);
        assert_eq!(alerts[0].org_id, "org-1");
        assert_eq!(alerts[0].agent_id, "agent-1");
        assert!((alerts[0].risk_score - 11.0).abs() < 0.01); // 8 + 6 x 0.5
    }

    #[test]
    fn test_correlation_event_bonus_capped() {
        let g = generator();
        let events: Vec<Event> = (0..40)
            .map(|_| event("org-1", Category::WebError, Severity::Medium))
            .collect();
        let result = CorrelationResult {
            rule: "service_degradation".to_string(),
            events,
            severity: Severity::Medium,
            category: Category::Availability,
            summary: "Multiple web errors indicating service degradation".to_string(),
            timestamp: Utc::now(),
        };

        g.process_correlation(&result);
        let alerts = g.get_alerts();
        assert!((alerts[0].risk_score - 11.0).abs() < 0.01); // 6 + capped 5
    }

    #[test]
    fn test_titles() {
        assert_eq!(title_for(&Category::PortScan), "Port Scan Detected");
        assert_eq!(title_for(&Category::SuspiciousPort), "Suspicious Port Connection");
        assert_eq!(title_for(&Category::Misconfiguration), "Cloud Misconfiguration Found");
        assert_eq!(title_for(&Category::HighTraffic), "Abnormal Traffic Pattern");
        assert_eq!(
            title_for(&Category::Other("dns_tunnel".into())),
            "Security Event: dns_tunnel"
        );
    }

    #[test]
    fn test_alert_feed_channel() {
        let g = generator();
        let mut rx = g.take_alerts().unwrap();
        assert!(g.take_alerts().is_none());

        g.process_event(&event("org-1", Category::PortScan, Severity::High));
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.category, Category::PortScan);
    }

    #[test]
    fn test_alert_json_round_trip() {
        let g = generator();
        g.process_event(&event("org-1", Category::PortScan, Severity::High));
        let alert = &g.get_alerts()[0];
        let json = serde_json::to_string(alert).unwrap();
        assert!(json.contains("\"status\":\"open\""));
        let back: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, alert.id);
        assert_eq!(back.status, AlertStatus::Open);
    }
}
