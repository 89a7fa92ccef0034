//! End-to-end pipeline scenarios: events injected into the engine flow
//! through correlation, scoring, and alerting exactly as they do off the
//! bus, minus the transport.

use skopos::engine::{AlertGenerator, Correlator, Engine, Scorer};
use skopos::event::{Category, Event, Severity};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

fn event(org: &str, category: Category, severity: Severity) -> Event {
    Event::new("test", category, severity, "scenario event").with_org(org)
}

struct TestStack {
    engine: Arc<Engine>,
    correlator: Arc<Correlator>,
    scorer: Arc<Scorer>,
    alerter: Arc<AlertGenerator>,
    forwarder: tokio::task::JoinHandle<()>,
}

/// Wire the three pipelines into a bus-less engine, with correlation
/// results forwarded to the alerter as the engine binary does.
async fn start_stack() -> TestStack {
    let correlator = Arc::new(Correlator::new(10_000));
    let scorer = Arc::new(Scorer::new(chrono::Duration::hours(24)));
    let alerter = Arc::new(AlertGenerator::new("", "", 5.0));

    let mut engine = Engine::new(None);
    engine.register_pipeline(correlator.clone());
    engine.register_pipeline(scorer.clone());
    engine.register_pipeline(alerter.clone());
    let engine = Arc::new(engine);

    let mut results = correlator.take_results().unwrap();
    let forwarder = {
        let alerter = alerter.clone();
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                alerter.process_correlation(&result);
            }
        })
    };

    engine.start().await.unwrap();

    TestStack {
        engine,
        correlator,
        scorer,
        alerter,
        forwarder,
    }
}

impl TestStack {
    async fn shutdown(self) {
        self.engine.stop().await;
        self.forwarder.abort();
    }
}

#[tokio::test]
async fn test_brute_force_scenario() {
    let stack = start_stack().await;

    for _ in 0..6 {
        stack
            .engine
            .inject_event(event("org-bf", Category::AuthFailure, Severity::Medium));
    }

    sleep(Duration::from_millis(500)).await;

    // One brute-force correlation fired (possibly more than once as the
    // buffer grew; the alerter deduplicates downstream)
    let results = stack.correlator.get_results();
    assert!(results.iter().any(|r| r.rule == "brute_force_attack"));
    let result = results
        .iter()
        .find(|r| r.rule == "brute_force_attack")
        .unwrap();
    assert_eq!(result.severity, Severity::High);

    // Exactly one correlation alert after dedup; single auth_failure events
    // stay below the risk threshold
    let alerts = stack.alerter.get_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].source, "correlation");
    assert_eq!(alerts[0].title, "Correlated: brute_force_attack");
    assert!(alerts[0].event_count >= 5);

    // The tenant's score dropped
    let score = stack.scorer.threat_score("org-bf");
    assert!(score.score < 100.0);
    assert_eq!(stack.engine.processed_count(), 6);

    stack.shutdown().await;
}

#[tokio::test]
async fn test_dedup_scenario() {
    let stack = start_stack().await;

    for _ in 0..5 {
        stack
            .engine
            .inject_event(event("org-dd", Category::AuthBruteForce, Severity::High));
    }

    sleep(Duration::from_millis(500)).await;

    // Five identical over-threshold events in one window: one alert
    let alerts = stack.alerter.get_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].title, "Brute Force Attack Detected");

    stack.shutdown().await;
}

#[tokio::test]
async fn test_low_severity_drop_scenario() {
    let stack = start_stack().await;

    stack
        .engine
        .inject_event(event("org-ls", Category::System, Severity::Info));

    sleep(Duration::from_millis(300)).await;

    assert!(stack.alerter.get_alerts().is_empty());
    // Still processed and scored (at zero risk)
    assert_eq!(stack.engine.processed_count(), 1);
    assert_eq!(stack.scorer.threat_score("org-ls").score, 100.0);

    stack.shutdown().await;
}

#[tokio::test]
async fn test_cross_tenant_isolation_through_engine() {
    let stack = start_stack().await;

    // org-a suffers an attack; org-b only sees routine events
    for _ in 0..6 {
        stack
            .engine
            .inject_event(event("org-a", Category::AuthFailure, Severity::Medium));
        stack
            .engine
            .inject_event(event("org-b", Category::System, Severity::Info));
    }

    sleep(Duration::from_millis(500)).await;

    assert!(stack.scorer.threat_score("org-a").score < 100.0);
    assert_eq!(stack.scorer.threat_score("org-b").score, 100.0);
    assert!(stack
        .alerter
        .get_alerts()
        .iter()
        .all(|a| a.org_id == "org-a"));

    stack.shutdown().await;
}

#[tokio::test]
async fn test_ingress_channel_bounded() {
    // Workers are not started yet, so injected events pile up in the
    // ingress channel; everything past its capacity is dropped
    let mut engine = Engine::new(None);

    struct Noop;
    impl skopos::engine::Pipeline for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn process(&self, _event: &Event) -> anyhow::Result<()> {
            Ok(())
        }
    }
    engine.register_pipeline(Arc::new(Noop));
    let engine = Arc::new(engine);

    for _ in 0..6000 {
        engine.inject_event(event("org-ch", Category::System, Severity::Info));
    }

    engine.start().await.unwrap();

    // Wait for the workers to drain the backlog
    let mut waited = 0;
    while engine.processed_count() < 5000 && waited < 50 {
        sleep(Duration::from_millis(100)).await;
        waited += 1;
    }
    sleep(Duration::from_millis(200)).await;
    engine.stop().await;

    // The channel capacity is 5000: the surplus 1000 events were dropped
    assert_eq!(engine.processed_count(), 5000);
}

#[tokio::test]
async fn test_malformed_category_still_flows() {
    // Unknown categories are legal end to end: default weights, default
    // title, no rule matches
    let stack = start_stack().await;

    let mut e = event("org-uk", Category::Other("quantum_leak".into()), Severity::Critical);
    e.summary = "something new".to_string();
    stack.engine.inject_event(e);

    sleep(Duration::from_millis(300)).await;

    let alerts = stack.alerter.get_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].title, "Security Event: quantum_leak");

    let score = stack.scorer.threat_score("org-uk");
    assert!(score.factors.contains_key("quantum_leak"));

    stack.shutdown().await;
}
