use anyhow::Result;
use clap::Parser;
use skopos::config::{parse_scoring_window, EngineConfig};
use skopos::engine::{AlertGenerator, AnthropicProvider, Correlator, Engine, Scorer};
use skopos::event::{Event, Severity};
use skopos::{bus, metrics};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, Level};
use tracing_subscriber::EnvFilter;

const MAX_CORRELATION_BUFFER: usize = 10_000;
const ALERT_RISK_THRESHOLD: f64 = 5.0;

#[derive(Parser, Debug)]
#[command(name = "skopos-engine", author = "REIUK LTD", version)]
#[command(about = "Skopos analysis engine - correlation, scoring, and alerting")]
#[command(long_about = r#"
Skopos analysis engine.

Subscribes to the agent event stream, fans each event through the
correlation, scoring, and alerting pipelines, and delivers deduplicated
alerts to the API and webhook sinks. Configuration is environment-driven
(NATS_URL, API_URL, ALERT_WEBHOOK, SCORING_WINDOW, ...).
"#)]
struct Args {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    json: bool,

    /// Metrics/health endpoint address
    #[arg(long, default_value = "127.0.0.1:9092")]
    metrics_addr: SocketAddr,

    /// Disable metrics/health endpoint
    #[arg(long)]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json {
        subscriber.json().init();
    } else {
        subscriber.with_target(false).init();
    }

    let config = EngineConfig::from_env();

    let (ready_tx, ready_rx) = watch::channel(false);

    if !args.no_metrics {
        let metrics_addr = args.metrics_addr;
        let metrics_ready_rx = ready_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_server(metrics_addr, metrics_ready_rx).await {
                error!("metrics server error: {}", e);
            }
        });
    }

    if config.database_url.is_some() {
        info!("database persistence is handled by the API service");
    } else {
        debug!("no database configured; engine state is in-memory only");
    }

    let client = bus::connect(&config.nats_url, &config.nats_token).await?;

    let correlator = Arc::new(Correlator::new(MAX_CORRELATION_BUFFER));
    let scorer = Arc::new(Scorer::new(parse_scoring_window(&config.scoring_window)));
    let alerter = Arc::new(AlertGenerator::new(
        &config.api_url,
        &config.alert_webhook,
        ALERT_RISK_THRESHOLD,
    ));

    let mut engine = Engine::new(Some(client));
    engine.register_pipeline(correlator.clone());
    engine.register_pipeline(scorer.clone());
    engine.register_pipeline(alerter.clone());
    let engine = Arc::new(engine);

    // Correlation results feed the alerter on their own task
    let mut forwarders = Vec::new();
    if let Some(mut results) = correlator.take_results() {
        let alerter = alerter.clone();
        forwarders.push(tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                alerter.process_correlation(&result);
            }
        }));
    }

    // High-severity alerts get an explanation logged; with no API key the
    // provider answers locally
    if config.llm_provider == "anthropic" {
        let provider = AnthropicProvider::new(&config.llm_api_key, &config.llm_model);
        if provider.is_remote() {
            info!("LLM explanations enabled (model {})", provider.model());
        } else {
            info!("LLM key not configured; using local explanations");
        }
        if let Some(mut alerts) = alerter.take_alerts() {
            forwarders.push(tokio::spawn(async move {
                while let Some(alert) = alerts.recv().await {
                    if alert.severity < Severity::High {
                        continue;
                    }
                    let event = Event::new(
                        alert.source.clone(),
                        alert.category.clone(),
                        alert.severity,
                        alert.description.clone(),
                    );
                    match provider.explain(&event, &alert.title).await {
                        Ok(text) => info!(alert_id = %alert.id, "alert explanation: {}", text),
                        Err(e) => error!(alert_id = %alert.id, "explanation failed: {}", e),
                    }
                }
            }));
        }
    }

    engine.start().await?;

    let _ = ready_tx.send(true);
    info!("Skopos analysis engine started");

    tokio::signal::ctrl_c().await?;

    info!("shutting down engine...");
    let _ = ready_tx.send(false);
    engine.stop().await;
    for forwarder in forwarders {
        forwarder.abort();
    }

    info!("engine stopped");
    Ok(())
}
