use anyhow::{bail, Result};
use clap::Parser;
use skopos::agent::Agent;
use skopos::config::AgentConfig;
use skopos::{bus, metrics};
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skopos-agent", author = "REIUK LTD", version)]
#[command(about = "Skopos collection agent - host, network, and cloud telemetry")]
#[command(long_about = r#"
Skopos collection agent.

Observes host logs, network flows, cloud posture, and host metrics, and
publishes a normalized event stream to the bus for the analysis engine.
Configuration is environment-driven (AGENT_ID, ORG_ID, NATS_URL, ...).
"#)]
struct Args {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output logs as JSON
    #[arg(long)]
    json: bool,

    /// Metrics/health endpoint address
    #[arg(long, default_value = "127.0.0.1:9091")]
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

    let config = AgentConfig::from_env();
    if config.agent_id.is_empty() || config.org_id.is_empty() {
        bail!("AGENT_ID and ORG_ID must be set");
    }

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

    let client = bus::connect(&config.nats_url, &config.nats_token).await?;

    let agent = Agent::new(&config, client);
    agent.start(&config)?;

    let _ = ready_tx.send(true);
    info!(
        "Skopos agent started (id={}, org={})",
        config.agent_id, config.org_id
    );

    tokio::signal::ctrl_c().await?;

    info!("shutting down agent...");
    let _ = ready_tx.send(false);
    agent.stop().await;

    info!("agent stopped");
    Ok(())
}
