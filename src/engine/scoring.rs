//! Scoring pipeline: per-tenant decaying penalty aggregate and threat-score
//! snapshots.
//!
//! Scores live in [0, 100] where 100 is clean. Each event contributes a
//! penalty weighted by severity and category and decayed by age; penalties
//! older than the scoring window fall out of the aggregate.

use crate::engine::Pipeline;
use crate::event::{Event, Severity};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

const DECAY_RATE: f64 = 0.95;
const MAX_PENALTY: f64 = 100.0;

/// Per-tenant threat posture snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatScore {
    pub score: f64,
    pub trend: f64,
    pub factors: HashMap<String, f64>,
    pub updated: DateTime<Utc>,
}

impl ThreatScore {
    fn baseline() -> Self {
        Self {
            score: 100.0,
            trend: 0.0,
            factors: HashMap::new(),
            updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
struct EventScore {
    event: Event,
    risk: f64,
}

#[derive(Default)]
struct ScorerState {
    org_scores: HashMap<String, ThreatScore>,
    event_scores: HashMap<String, Vec<EventScore>>,
}

pub struct Scorer {
    state: Mutex<ScorerState>,
    window: ChronoDuration,
}

impl Scorer {
    pub fn new(window: ChronoDuration) -> Self {
        let window = if window.is_zero() {
            ChronoDuration::hours(24)
        } else {
            window
        };
        Self {
            state: Mutex::new(ScorerState::default()),
            window,
        }
    }

    /// Risk contribution of a single event:
    /// severity weight x category multiplier x recency decay.
    pub fn score_event(&self, event: &Event) -> f64 {
        let base = severity_weight(event.severity);
        let multiplier = category_multiplier(event.category.as_str());

        let recency = match event.time {
            Some(t) => {
                let age_hours = (Utc::now() - t).num_milliseconds() as f64 / 3_600_000.0;
                DECAY_RATE.powf(age_hours)
            }
            None => 1.0,
        };

        base * multiplier * recency
    }

    pub fn process_event(&self, event: Event) {
        let risk = self.score_event(&event);

        let mut state = self.state.lock().unwrap();

        let org_id = if event.org_id.is_empty() {
            "default".to_string()
        } else {
            event.org_id.clone()
        };

        let scores = state.event_scores.entry(org_id.clone()).or_default();
        scores.push(EventScore { event, risk });

        let cutoff = Utc::now() - self.window;
        scores.retain(|es| es.event.time.is_some_and(|t| t > cutoff));

        recalculate(&mut state, &org_id);
    }

    /// Deep copy of the tenant's snapshot; unknown tenants get the clean
    /// baseline.
    pub fn threat_score(&self, org_id: &str) -> ThreatScore {
        let state = self.state.lock().unwrap();
        state
            .org_scores
            .get(org_id)
            .cloned()
            .unwrap_or_else(ThreatScore::baseline)
    }

    pub fn org_count(&self) -> usize {
        self.state.lock().unwrap().org_scores.len()
    }
}

impl Pipeline for Scorer {
    fn name(&self) -> &str {
        "scoring"
    }

    fn process(&self, event: &Event) -> Result<()> {
        self.process_event(event.clone());
        Ok(())
    }
}

fn recalculate(state: &mut ScorerState, org_id: &str) {
    let events = state.event_scores.get(org_id).map(Vec::as_slice).unwrap_or(&[]);

    if events.is_empty() {
        state
            .org_scores
            .insert(org_id.to_string(), ThreatScore::baseline());
        return;
    }

    let mut factors: HashMap<String, f64> = HashMap::new();
    let mut total_penalty = 0.0;

    for es in events {
        let category = match es.event.category.as_str() {
            "" => "unknown",
            c => c,
        };
        *factors.entry(category.to_string()).or_insert(0.0) += es.risk;
        total_penalty += es.risk;
    }

    let total_penalty = total_penalty.min(MAX_PENALTY);
    let score = (100.0 - total_penalty).max(0.0);

    let trend = match state.org_scores.get(org_id) {
        Some(prev) => score - prev.score,
        None => 0.0,
    };

    for value in factors.values_mut() {
        *value = round2(*value);
    }

    state.org_scores.insert(
        org_id.to_string(),
        ThreatScore {
            score: round2(score),
            trend: round2(trend),
            factors,
            updated: Utc::now(),
        },
    );
}

fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Info => 0.0,
        Severity::Low => 1.0,
        Severity::Medium => 3.0,
        Severity::High => 7.0,
        Severity::Critical => 10.0,
    }
}

fn category_multiplier(category: &str) -> f64 {
    match category {
        "attack" | "port_scan" | "auth_brute_force" => 2.0,
        "misconfiguration" => 1.5,
        "auth_failure" => 1.3,
        "availability" | "web_error" => 1.0,
        "credential_hygiene" => 1.2,
        _ => 1.0,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Category;

    fn scorer() -> Scorer {
        Scorer::new(ChronoDuration::hours(24))
    }

    fn event(org: &str, category: Category, severity: Severity) -> Event {
        Event::new("test", category, severity, "test event").with_org(org)
    }

    #[test]
    fn test_baseline_for_unknown_tenant() {
        let s = scorer();
        let ts = s.threat_score("nobody");
        assert_eq!(ts.score, 100.0);
        assert_eq!(ts.trend, 0.0);
        assert!(ts.factors.is_empty());
    }

    #[test]
    fn test_event_risk_weighting() {
        let s = scorer();
        // Fresh events: recency factor is ~1.0
        let risk = s.score_event(&event("o", Category::AuthBruteForce, Severity::High));
        assert!((risk - 14.0).abs() < 0.01); // 7 x 2.0

        let risk = s.score_event(&event("o", Category::Misconfiguration, Severity::Critical));
        assert!((risk - 15.0).abs() < 0.01); // 10 x 1.5

        let risk = s.score_event(&event("o", Category::System, Severity::Info));
        assert_eq!(risk, 0.0);
    }

    #[test]
    fn test_unknown_category_uses_default_multiplier() {
        let s = scorer();
        let risk = s.score_event(&event("o", Category::Other("weird".into()), Severity::Medium));
        assert!((risk - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_recency_decay() {
        let s = scorer();
        let old = event("o", Category::Attack, Severity::High)
            .with_time(Utc::now() - ChronoDuration::hours(10));
        let risk = s.score_event(&old);
        // 7 x 2.0 x 0.95^10
        let expected = 14.0 * 0.95f64.powf(10.0);
        assert!((risk - expected).abs() < 0.05);
    }

    #[test]
    fn test_unstamped_event_gets_full_weight() {
        let s = scorer();
        let mut e = event("o", Category::Attack, Severity::High);
        e.time = None;
        assert!((s.score_event(&e) - 14.0).abs() < 0.01);
    }

    #[test]
    fn test_score_drops_and_factors_accumulate() {
        let s = scorer();
        s.process_event(event("org-1", Category::AuthFailure, Severity::Medium));
        let ts = s.threat_score("org-1");
        assert!(ts.score < 100.0);
        assert!((ts.factors["auth_failure"] - 3.9).abs() < 0.05); // 3 x 1.3

        s.process_event(event("org-1", Category::PortScan, Severity::High));
        let ts = s.threat_score("org-1");
        assert!(ts.factors.contains_key("port_scan"));
        assert!(ts.trend < 0.0);
    }

    #[test]
    fn test_monotonic_under_worsening_input() {
        let s = scorer();
        let mut prev = 100.0;
        for _ in 0..20 {
            s.process_event(event("org-1", Category::Attack, Severity::High));
            let score = s.threat_score("org-1").score;
            assert!(score <= prev);
            prev = score;
        }
    }

    #[test]
    fn test_score_floor_at_zero() {
        let s = scorer();
        for _ in 0..50 {
            s.process_event(event("org-1", Category::Attack, Severity::Critical));
        }
        assert_eq!(s.threat_score("org-1").score, 0.0);
    }

    #[test]
    fn test_info_events_leave_score_clean() {
        let s = scorer();
        s.process_event(event("org-1", Category::System, Severity::Info));
        let ts = s.threat_score("org-1");
        assert_eq!(ts.score, 100.0);
        assert_eq!(ts.factors["system"], 0.0);
    }

    #[test]
    fn test_cross_tenant_isolation() {
        let s = scorer();
        s.process_event(event("org-a", Category::Attack, Severity::Critical));
        assert!(s.threat_score("org-a").score < 100.0);
        assert_eq!(s.threat_score("org-b").score, 100.0);
        assert_eq!(s.org_count(), 1);
    }

    #[test]
    fn test_empty_org_keyed_default() {
        let s = scorer();
        s.process_event(Event::new(
            "test",
            Category::Attack,
            Severity::High,
            "no tenant",
        ));
        assert!(s.threat_score("default").score < 100.0);
    }

    #[test]
    fn test_events_outside_window_pruned() {
        let s = Scorer::new(ChronoDuration::hours(1));
        let stale = event("org-1", Category::Attack, Severity::Critical)
            .with_time(Utc::now() - ChronoDuration::hours(2));
        s.process_event(stale);
        // The stale event is pruned in the same pass, leaving a clean score
        assert_eq!(s.threat_score("org-1").score, 100.0);
    }

    #[test]
    fn test_deep_copy_on_read() {
        let s = scorer();
        s.process_event(event("org-1", Category::Attack, Severity::High));
        let mut ts = s.threat_score("org-1");
        ts.factors.insert("tampered".to_string(), 999.0);
        assert!(!s.threat_score("org-1").factors.contains_key("tampered"));
    }

    #[test]
    fn test_rounding_to_two_decimals() {
        let s = scorer();
        s.process_event(event("org-1", Category::AuthFailure, Severity::Medium));
        let ts = s.threat_score("org-1");
        let scaled = ts.score * 100.0;
        assert!((scaled - scaled.round()).abs() < 1e-9);
    }
}
