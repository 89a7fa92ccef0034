//! Prometheus counters and the health/readiness/metrics HTTP surface.
//!
//! Metrics register lazily on first use, so a counter that never fires does
//! not appear in scrapes. Built without the `metrics` feature, every
//! counter collapses to a no-op and the server does nothing.

#[cfg(feature = "metrics")]
mod inner {
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use once_cell::sync::Lazy;
    use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
    use serde::Serialize;
    use std::net::SocketAddr;
    use std::time::Instant;
    use tokio::sync::watch;
    use tracing::info;

    pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

    fn counter(name: &str, help: &str) -> IntCounter {
        let c = IntCounter::new(name, help).unwrap();
        REGISTRY.register(Box::new(c.clone())).unwrap();
        c
    }

    fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
        let c = IntCounterVec::new(Opts::new(name, help), labels).unwrap();
        REGISTRY.register(Box::new(c.clone())).unwrap();
        c
    }

    fn gauge(name: &str, help: &str) -> IntGauge {
        let g = IntGauge::new(name, help).unwrap();
        REGISTRY.register(Box::new(g.clone())).unwrap();
        g
    }

    pub static EVENTS_EMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
        counter_vec(
            "skopos_events_emitted_total",
            "Events emitted by collectors, by source",
            &["source"],
        )
    });

    pub static EVENTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
        counter_vec(
            "skopos_events_dropped_total",
            "Events dropped on full channels, by component",
            &["component"],
        )
    });

    pub static EVENTS_PUBLISHED: Lazy<IntCounter> =
        Lazy::new(|| counter("skopos_events_published_total", "Events published to the bus"));

    pub static EVENTS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
        counter(
            "skopos_events_processed_total",
            "Events run through all engine pipelines",
        )
    });

    pub static PIPELINE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
        counter_vec(
            "skopos_pipeline_errors_total",
            "Pipeline failures, by pipeline",
            &["pipeline"],
        )
    });

    pub static ALERTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        counter_vec(
            "skopos_alerts_total",
            "Alerts generated, by severity",
            &["severity"],
        )
    });

    pub static ALERTS_SUPPRESSED: Lazy<IntCounter> = Lazy::new(|| {
        counter(
            "skopos_alerts_suppressed_total",
            "Alerts suppressed by deduplication",
        )
    });

    pub static SINK_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
        counter_vec(
            "skopos_sink_failures_total",
            "Failed alert deliveries, by sink",
            &["sink"],
        )
    });

    pub static ACTIVE_COLLECTORS: Lazy<IntGauge> =
        Lazy::new(|| gauge("skopos_active_collectors", "Number of running collectors"));

    pub static START_TIME: Lazy<IntGauge> = Lazy::new(|| {
        gauge(
            "skopos_start_time_seconds",
            "Unix timestamp of process start",
        )
    });

    #[derive(Clone)]
    struct ProbeState {
        ready_rx: watch::Receiver<bool>,
        started: Instant,
    }

    #[derive(Serialize)]
    struct HealthReport {
        status: &'static str,
        uptime_seconds: u64,
    }

    async fn health(State(probe): State<ProbeState>) -> Json<HealthReport> {
        Json(HealthReport {
            status: "ok",
            uptime_seconds: probe.started.elapsed().as_secs(),
        })
    }

    async fn readiness(State(probe): State<ProbeState>) -> StatusCode {
        if *probe.ready_rx.borrow() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }

    async fn scrape() -> Result<String, StatusCode> {
        TextEncoder::new()
            .encode_to_string(&REGISTRY.gather())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Serve `/health`, `/ready`, and `/metrics` until the process exits.
    /// Bind and serve failures propagate to the caller.
    pub async fn start_server(
        addr: SocketAddr,
        ready_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        START_TIME.set(chrono::Utc::now().timestamp());

        let probe = ProbeState {
            ready_rx,
            started: Instant::now(),
        };
        let app = Router::new()
            .route("/health", get(health))
            .route("/ready", get(readiness))
            .route("/metrics", get(scrape))
            .with_state(probe);

        info!("metrics endpoint on http://{}/metrics", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

#[cfg(feature = "metrics")]
pub use inner::*;

#[cfg(not(feature = "metrics"))]
mod disabled {
    use std::net::SocketAddr;
    use tokio::sync::watch;

    /// Stand-in for counters and gauges in builds without the `metrics`
    /// feature.
    pub struct Disabled;

    impl Disabled {
        pub fn inc(&self) {}
        pub fn set(&self, _value: i64) {}
        pub fn with_label_values(&self, _labels: &[&str]) -> &Self {
            self
        }
    }

    pub static EVENTS_EMITTED: Disabled = Disabled;
    pub static EVENTS_DROPPED: Disabled = Disabled;
    pub static EVENTS_PUBLISHED: Disabled = Disabled;
    pub static EVENTS_PROCESSED: Disabled = Disabled;
    pub static PIPELINE_ERRORS: Disabled = Disabled;
    pub static ALERTS_TOTAL: Disabled = Disabled;
    pub static ALERTS_SUPPRESSED: Disabled = Disabled;
    pub static SINK_FAILURES: Disabled = Disabled;
    pub static ACTIVE_COLLECTORS: Disabled = Disabled;

    pub async fn start_server(
        _addr: SocketAddr,
        _ready_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(not(feature = "metrics"))]
pub use disabled::*;
