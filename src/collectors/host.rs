//! Host metric sampling feeding the anomaly detector.
//!
//! Samples load average and memory utilization from /proc on a fixed tick
//! and emits one event per triggered anomaly test. Hosts without /proc
//! sample nothing.

use crate::anomaly::{Anomaly, AnomalyDetector};
use crate::collectors::emit;
use crate::event::{Category, Event, Severity};
use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::info;

const SAMPLE_INTERVAL_SECS: u64 = 10;

pub struct HostMetricsCollector {
    detector: AnomalyDetector,
    interval: tokio::time::Duration,
    tx: mpsc::Sender<Event>,
}

impl HostMetricsCollector {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self {
            detector: AnomalyDetector::new(),
            interval: tokio::time::Duration::from_secs(SAMPLE_INTERVAL_SECS),
            tx,
        }
    }

    pub fn name(&self) -> &'static str {
        "metrics"
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("host metrics collector: sampling every {:?}", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticker.tick() => self.sample(),
            }
        }
    }

    fn sample(&self) {
        let now = Utc::now();
        for (name, value) in read_host_metrics() {
            for anomaly in self.detector.record(name, now, value) {
                emit(&self.tx, "metrics", anomaly_event(&anomaly));
            }
        }
    }
}

fn anomaly_event(anomaly: &Anomaly) -> Event {
    // Doubling the trigger threshold is treated as a stronger signal
    let severity = if anomaly.score >= anomaly.threshold * 2.0 {
        Severity::High
    } else {
        Severity::Medium
    };

    Event::new(
        "metrics",
        Category::System,
        severity,
        format!(
            "Metric {} anomaly ({}): {}",
            anomaly.metric,
            anomaly.kind.as_str(),
            anomaly.message
        ),
    )
    .with_time(anomaly.time)
    .with_payload("metric", anomaly.metric.clone())
    .with_payload("value", anomaly.value)
    .with_payload("score", anomaly.score)
    .with_payload("kind", anomaly.kind.as_str())
    .with_payload("threshold", anomaly.threshold)
}

#[cfg(target_os = "linux")]
fn read_host_metrics() -> Vec<(&'static str, f64)> {
    let mut metrics = Vec::new();

    if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
        if let Some(load1) = parse_loadavg(&loadavg) {
            metrics.push(("load1", load1));
        }
    }

    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        if let Some(used_pct) = parse_mem_used_pct(&meminfo) {
            metrics.push(("mem_used_pct", used_pct));
        }
    }

    metrics
}

#[cfg(not(target_os = "linux"))]
fn read_host_metrics() -> Vec<(&'static str, f64)> {
    Vec::new()
}

/// First field of /proc/loadavg: the 1-minute load average.
fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// Used-memory percentage from MemTotal and MemAvailable (kB lines).
fn parse_mem_used_pct(content: &str) -> Option<f64> {
    let mut total = None;
    let mut available = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.split_whitespace().next()?.parse::<f64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.split_whitespace().next()?.parse::<f64>().ok();
        }
    }
    let (total, available) = (total?, available?);
    if total == 0.0 {
        return None;
    }
    Some((total - available) / total * 100.0)
}
