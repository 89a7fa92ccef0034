//! Agent runtime: owns the shared event channel, starts collectors, stamps
//! and publishes events to the bus, and drives the heartbeat loop.

use crate::bus;
use crate::collectors::{CloudCollector, HostMetricsCollector, LogCollector, NetworkCollector};
use crate::config::AgentConfig;
use crate::event::Event;
use crate::metrics;
use anyhow::Result;
use chrono::Utc;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const EVENT_CHANNEL_CAP: usize = 1000;
const HEARTBEAT_TIMEOUT_SECS: u64 = 5;

pub struct Agent {
    id: String,
    org_id: String,
    api_url: String,
    client: async_nats::Client,
    event_tx: mpsc::Sender<Event>,
    event_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    heartbeat: tokio::time::Duration,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(config: &AgentConfig, client: async_nats::Client) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAP);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id: config.agent_id.clone(),
            org_id: config.org_id.clone(),
            api_url: config.api_url.clone(),
            client,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            heartbeat: tokio::time::Duration::from_secs(config.heartbeat_interval.max(1)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the enabled collectors, the bus forwarder, and the heartbeat
    /// loop. Idempotent only in the sense that a second call finds the
    /// event receiver already taken and fails.
    pub fn start(&self, config: &AgentConfig) -> Result<()> {
        let event_rx = self
            .event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("agent already started"))?;

        let mut tasks = self.tasks.lock().unwrap();

        if config.enable_logs {
            let mut collector = LogCollector::new(
                config.log_sources.clone(),
                config.syslog_addr.clone(),
                self.event_tx.clone(),
            );
            let shutdown = self.shutdown_tx.subscribe();
            metrics::ACTIVE_COLLECTORS.inc();
            info!("starting collector: {}", collector.name());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = collector.run(shutdown).await {
                    error!("log collector error: {}", e);
                }
            }));
        }

        if config.enable_network {
            let mut collector =
                NetworkCollector::new(config.network_interface.clone(), self.event_tx.clone());
            let shutdown = self.shutdown_tx.subscribe();
            metrics::ACTIVE_COLLECTORS.inc();
            info!("starting collector: {}", collector.name());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = collector.run(shutdown).await {
                    error!("network collector error: {}", e);
                }
            }));
        }

        if config.enable_cloud {
            let mut collector =
                CloudCollector::new(&config.cloud_provider, 0, self.event_tx.clone());
            let shutdown = self.shutdown_tx.subscribe();
            metrics::ACTIVE_COLLECTORS.inc();
            info!(
                "starting collector: {} (provider {})",
                collector.name(),
                config.cloud_provider
            );
            tasks.push(tokio::spawn(async move {
                if let Err(e) = collector.run(shutdown).await {
                    error!("cloud collector error: {}", e);
                }
            }));
        }

        if config.enable_anomaly {
            let mut collector = HostMetricsCollector::new(self.event_tx.clone());
            let shutdown = self.shutdown_tx.subscribe();
            metrics::ACTIVE_COLLECTORS.inc();
            info!("starting collector: {}", collector.name());
            tasks.push(tokio::spawn(async move {
                if let Err(e) = collector.run(shutdown).await {
                    error!("host metrics collector error: {}", e);
                }
            }));
        }

        tasks.push(tokio::spawn(event_forwarder(
            event_rx,
            self.client.clone(),
            self.org_id.clone(),
            self.id.clone(),
            self.shutdown_tx.subscribe(),
        )));

        tasks.push(tokio::spawn(heartbeat_loop(
            self.api_url.clone(),
            self.id.clone(),
            self.heartbeat,
            self.shutdown_tx.subscribe(),
        )));

        Ok(())
    }

    /// Signal every task to stop, wait for them, and flush the bus.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        if let Err(e) = self.client.flush().await {
            warn!("agent: failed to flush bus connection: {}", e);
        }
    }
}

/// Drain the event channel: stamp tenant identity and time, serialize, and
/// publish. Publish failures are logged, never retried.
async fn event_forwarder(
    mut event_rx: mpsc::Receiver<Event>,
    client: async_nats::Client,
    org_id: String,
    agent_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let subject = bus::event_subject(&org_id, &agent_id);

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => return,
            event = event_rx.recv() => match event {
                Some(e) => e,
                None => return,
            },
        };

        let mut event = event;
        event.org_id = org_id.clone();
        event.agent_id = agent_id.clone();
        if event.time.is_none() {
            event.time = Some(Utc::now());
        }

        let data = match serde_json::to_vec(&event) {
            Ok(d) => d,
            Err(e) => {
                error!("agent: failed to serialize event: {}", e);
                continue;
            }
        };

        match client.publish(subject.clone(), data.into()).await {
            Ok(()) => metrics::EVENTS_PUBLISHED.inc(),
            Err(e) => error!("agent: failed to publish event: {}", e),
        }
    }
}

async fn heartbeat_loop(
    api_url: String,
    agent_id: String,
    interval: tokio::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder()
        .timeout(tokio::time::Duration::from_secs(HEARTBEAT_TIMEOUT_SECS))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!("agent: failed to build heartbeat client: {}", e);
            return;
        }
    };

    let url = format!("{}/api/v1/agents/{}/heartbeat", api_url, agent_id);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                match client
                    .patch(&url)
                    .header("Content-Type", "application/json")
                    .body("{}")
                    .send()
                    .await
                {
                    Ok(resp) if !resp.status().is_success() => {
                        warn!("agent: heartbeat returned status {}", resp.status());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("agent: heartbeat failed: {}", e),
                }
            }
        }
    }
}
