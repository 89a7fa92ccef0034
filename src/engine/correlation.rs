//! Correlation pipeline: per-tenant sliding buffers and rule evaluation on
//! every event.
//!
//! Rules carry their match predicate as a value; evaluation is a pure
//! function of the time-filtered event slice. Results are not deduplicated
//! here, the alerter handles that downstream.

use crate::engine::Pipeline;
use crate::event::{Category, Event, Severity};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

const DEFAULT_MAX_BUFFER: usize = 10_000;
const RESULT_CHANNEL_CAP: usize = 100;

type Matcher = Box<dyn Fn(&[Event]) -> bool + Send + Sync>;

/// A predicate over a time-windowed event slice.
pub struct CorrelationRule {
    pub name: String,
    pub description: String,
    pub window: ChronoDuration,
    pub min_events: usize,
    pub severity: Severity,
    pub category: Category,
    matcher: Matcher,
}

impl CorrelationRule {
    pub fn new(
        name: &str,
        description: &str,
        window: ChronoDuration,
        min_events: usize,
        severity: Severity,
        category: Category,
        matcher: impl Fn(&[Event]) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            window,
            min_events,
            severity,
            category,
            matcher: Box::new(matcher),
        }
    }

    pub fn matches(&self, events: &[Event]) -> bool {
        (self.matcher)(events)
    }
}

/// A grouped finding produced by a rule.
#[derive(Debug, Clone)]
pub struct CorrelationResult {
    pub rule: String,
    pub events: Vec<Event>,
    pub severity: Severity,
    pub category: Category,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct CorrelatorState {
    buffer: HashMap<String, Vec<Event>>,
    results: Vec<CorrelationResult>,
}

pub struct Correlator {
    state: Mutex<CorrelatorState>,
    rules: Vec<CorrelationRule>,
    max_buffer: usize,
    result_tx: mpsc::Sender<CorrelationResult>,
    result_rx: Mutex<Option<mpsc::Receiver<CorrelationResult>>>,
}

impl Correlator {
    pub fn new(max_buffer: usize) -> Self {
        let max_buffer = if max_buffer == 0 {
            DEFAULT_MAX_BUFFER
        } else {
            max_buffer
        };
        let (result_tx, result_rx) = mpsc::channel(RESULT_CHANNEL_CAP);
        Self {
            state: Mutex::new(CorrelatorState::default()),
            rules: default_rules(),
            max_buffer,
            result_tx,
            result_rx: Mutex::new(Some(result_rx)),
        }
    }

    pub fn register_rule(&mut self, rule: CorrelationRule) {
        self.rules.push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Receiver side of the bounded result channel. Takeable once.
    pub fn take_results(&self) -> Option<mpsc::Receiver<CorrelationResult>> {
        self.result_rx.lock().unwrap().take()
    }

    /// Append the event to its tenant buffer and evaluate every rule over a
    /// snapshot of that buffer.
    pub fn process_event(&self, event: Event) {
        let org_id = event.org_id.clone();

        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let buffer = state.buffer.entry(org_id).or_default();
            buffer.push(event);
            if buffer.len() > self.max_buffer {
                let excess = buffer.len() - self.max_buffer;
                buffer.drain(..excess);
            }
            buffer.clone()
        };

        self.evaluate_rules(&snapshot);
    }

    fn evaluate_rules(&self, events: &[Event]) {
        let now = Utc::now();

        for rule in &self.rules {
            let cutoff = now - rule.window;
            let windowed: Vec<Event> = events
                .iter()
                .filter(|e| e.time.is_some_and(|t| t > cutoff))
                .cloned()
                .collect();

            if windowed.len() < rule.min_events {
                continue;
            }

            if rule.matches(&windowed) {
                let result = CorrelationResult {
                    rule: rule.name.clone(),
                    events: windowed,
                    severity: rule.severity,
                    category: rule.category.clone(),
                    summary: rule.description.clone(),
                    timestamp: now,
                };

                self.state.lock().unwrap().results.push(result.clone());
                let _ = self.result_tx.try_send(result);
            }
        }
    }

    /// Copy of every result since the last clear.
    pub fn get_results(&self) -> Vec<CorrelationResult> {
        self.state.lock().unwrap().results.clone()
    }

    pub fn clear_results(&self) {
        self.state.lock().unwrap().results.clear();
    }

    pub fn buffer_len(&self, org_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .buffer
            .get(org_id)
            .map(|b| b.len())
            .unwrap_or(0)
    }
}

impl Pipeline for Correlator {
    fn name(&self) -> &str {
        "correlation"
    }

    fn process(&self, event: &Event) -> Result<()> {
        self.process_event(event.clone());
        Ok(())
    }
}

fn count_category(events: &[Event], category: &Category) -> usize {
    events.iter().filter(|e| &e.category == category).count()
}

/// The built-in rule set.
pub fn default_rules() -> Vec<CorrelationRule> {
    vec![
        CorrelationRule::new(
            "brute_force_attack",
            "Multiple authentication failures detected from same source",
            ChronoDuration::minutes(5),
            5,
            Severity::High,
            Category::Attack,
            |events| count_category(events, &Category::AuthFailure) >= 5,
        ),
        CorrelationRule::new(
            "port_scan_with_exploit",
            "Port scanning followed by suspicious connection attempts",
            ChronoDuration::minutes(10),
            2,
            Severity::Critical,
            Category::Attack,
            |events| {
                let has_scan = events.iter().any(|e| e.category == Category::PortScan);
                let has_suspicious = events
                    .iter()
                    .any(|e| e.category == Category::SuspiciousPort);
                has_scan && has_suspicious
            },
        ),
        CorrelationRule::new(
            "cloud_misconfiguration_chain",
            "Multiple cloud misconfigurations detected in short window",
            ChronoDuration::minutes(30),
            3,
            Severity::High,
            Category::Misconfiguration,
            |events| {
                events
                    .iter()
                    .filter(|e| e.source == "cloud" && e.category == Category::Misconfiguration)
                    .count()
                    >= 3
            },
        ),
        CorrelationRule::new(
            "lateral_movement",
            "Auth failure followed by success from different source",
            ChronoDuration::minutes(15),
            2,
            Severity::Critical,
            Category::Attack,
            |events| {
                // A success only counts after a failure has been observed
                let mut has_failure = false;
                let mut has_success = false;
                for event in events {
                    if event.category == Category::AuthFailure {
                        has_failure = true;
                    }
                    if event.category == Category::AuthSuccess && has_failure {
                        has_success = true;
                    }
                }
                has_failure && has_success
            },
        ),
        CorrelationRule::new(
            "service_degradation",
            "Multiple web errors indicating service degradation",
            ChronoDuration::minutes(5),
            10,
            Severity::Medium,
            Category::Availability,
            |events| count_category(events, &Category::WebError) >= 10,
        ),
    ]
}

pub fn format_result(result: &CorrelationResult) -> String {
    format!(
        "[{}] {} ({}): {} - {} correlated events",
        result.severity,
        result.rule,
        result.category,
        result.summary,
        result.events.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(org: &str, category: Category, severity: Severity) -> Event {
        Event::new("test", category, severity, "test event").with_org(org)
    }

    #[test]
    fn test_default_rules_registered() {
        let correlator = Correlator::new(0);
        assert_eq!(correlator.rule_count(), 5);
    }

    #[test]
    fn test_brute_force_fires_at_five_failures() {
        let correlator = Correlator::new(0);
        for _ in 0..4 {
            correlator.process_event(event("org-1", Category::AuthFailure, Severity::Medium));
        }
        assert!(correlator.get_results().is_empty());

        correlator.process_event(event("org-1", Category::AuthFailure, Severity::Medium));
        let results = correlator.get_results();
        assert!(!results.is_empty());
        assert_eq!(results[0].rule, "brute_force_attack");
        assert_eq!(results[0].severity, Severity::High);
        assert_eq!(results[0].category, Category::Attack);
        assert_eq!(results[0].events.len(), 5);
    }

    #[test]
    fn test_window_excludes_old_events() {
        let correlator = Correlator::new(0);
        let stale = Utc::now() - ChronoDuration::minutes(10);
        for _ in 0..4 {
            correlator.process_event(
                event("org-1", Category::AuthFailure, Severity::Medium).with_time(stale),
            );
        }
        // Only one failure is inside the 5 minute window
        correlator.process_event(event("org-1", Category::AuthFailure, Severity::Medium));
        assert!(correlator.get_results().is_empty());
    }

    #[test]
    fn test_unstamped_events_excluded_from_window() {
        let correlator = Correlator::new(0);
        for _ in 0..5 {
            let mut e = event("org-1", Category::AuthFailure, Severity::Medium);
            e.time = None;
            correlator.process_event(e);
        }
        assert!(correlator.get_results().is_empty());
    }

    #[test]
    fn test_port_scan_with_exploit_pair() {
        let correlator = Correlator::new(0);
        correlator.process_event(event("org-1", Category::PortScan, Severity::High));
        assert!(correlator.get_results().is_empty());

        correlator.process_event(event("org-1", Category::SuspiciousPort, Severity::High));
        let results = correlator.get_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rule, "port_scan_with_exploit");
        assert_eq!(results[0].severity, Severity::Critical);
    }

    #[test]
    fn test_cloud_misconfiguration_chain_requires_cloud_source() {
        let correlator = Correlator::new(0);
        for _ in 0..3 {
            // Right category, wrong source
            correlator.process_event(event("org-1", Category::Misconfiguration, Severity::High));
        }
        assert!(correlator.get_results().is_empty());

        for _ in 0..3 {
            let mut e = event("org-1", Category::Misconfiguration, Severity::High);
            e.source = "cloud".to_string();
            correlator.process_event(e);
        }
        let results = correlator.get_results();
        assert!(results.iter().any(|r| r.rule == "cloud_misconfiguration_chain"));
    }

    #[test]
    fn test_lateral_movement_requires_failure_before_success() {
        // Success first, then failure: no match
        let correlator = Correlator::new(0);
        correlator.process_event(event("org-1", Category::AuthSuccess, Severity::Info));
        correlator.process_event(event("org-1", Category::AuthFailure, Severity::Medium));
        assert!(correlator
            .get_results()
            .iter()
            .all(|r| r.rule != "lateral_movement"));

        // Failure then success: match
        let correlator = Correlator::new(0);
        correlator.process_event(event("org-2", Category::AuthFailure, Severity::Medium));
        correlator.process_event(event("org-2", Category::AuthSuccess, Severity::Info));
        assert!(correlator
            .get_results()
            .iter()
            .any(|r| r.rule == "lateral_movement"));
    }

    #[test]
    fn test_service_degradation_at_ten_errors() {
        let correlator = Correlator::new(0);
        for _ in 0..10 {
            correlator.process_event(event("org-1", Category::WebError, Severity::Medium));
        }
        let results = correlator.get_results();
        assert!(results.iter().any(|r| r.rule == "service_degradation"));
    }

    #[test]
    fn test_cross_tenant_isolation() {
        let correlator = Correlator::new(0);
        // Three failures each for two tenants: neither reaches five
        for _ in 0..3 {
            correlator.process_event(event("org-a", Category::AuthFailure, Severity::Medium));
            correlator.process_event(event("org-b", Category::AuthFailure, Severity::Medium));
        }
        assert!(correlator.get_results().is_empty());
        assert_eq!(correlator.buffer_len("org-a"), 3);
        assert_eq!(correlator.buffer_len("org-b"), 3);
    }

    #[test]
    fn test_buffer_capped_with_tail_retention() {
        let correlator = Correlator::new(100);
        for i in 0..250 {
            let mut e = event("org-1", Category::System, Severity::Info);
            e.summary = format!("event {}", i);
            correlator.process_event(e);
        }
        assert_eq!(correlator.buffer_len("org-1"), 100);
        // The newest events are the ones retained
        let state = correlator.state.lock().unwrap();
        assert_eq!(state.buffer["org-1"].last().unwrap().summary, "event 249");
        assert_eq!(state.buffer["org-1"][0].summary, "event 150");
    }

    #[test]
    fn test_results_channel_and_clear() {
        let correlator = Correlator::new(0);
        let mut rx = correlator.take_results().unwrap();
        assert!(correlator.take_results().is_none());

        for _ in 0..5 {
            correlator.process_event(event("org-1", Category::AuthFailure, Severity::Medium));
        }
        let result = rx.try_recv().unwrap();
        assert_eq!(result.rule, "brute_force_attack");

        correlator.clear_results();
        assert!(correlator.get_results().is_empty());
    }

    #[test]
    fn test_custom_rule_registration() {
        let mut correlator = Correlator::new(0);
        correlator.register_rule(CorrelationRule::new(
            "critical_burst",
            "Several critical events in one minute",
            ChronoDuration::minutes(1),
            3,
            Severity::Critical,
            Category::Attack,
            |events| {
                events
                    .iter()
                    .filter(|e| e.severity == Severity::Critical)
                    .count()
                    >= 3
            },
        ));
        assert_eq!(correlator.rule_count(), 6);

        for _ in 0..3 {
            correlator.process_event(event("org-1", Category::System, Severity::Critical));
        }
        assert!(correlator
            .get_results()
            .iter()
            .any(|r| r.rule == "critical_burst"));
    }

    #[test]
    fn test_format_result() {
        let result = CorrelationResult {
            rule: "brute_force_attack".to_string(),
            events: vec![event("o", Category::AuthFailure, Severity::Medium)],
            severity: Severity::High,
            category: Category::Attack,
            summary: "Multiple authentication failures detected from same source".to_string(),
            timestamp: Utc::now(),
        };
        let formatted = format_result(&result);
        assert!(formatted.starts_with("[high] brute_force_attack (attack):"));
        assert!(formatted.ends_with("1 correlated events"));
    }
}
