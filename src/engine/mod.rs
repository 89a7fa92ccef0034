//! Engine dispatcher: bus subscriber, bounded ingress channel, and a fixed
//! worker pool fanning each event out to the registered pipelines.

pub mod alerts;
pub mod correlation;
pub mod llm;
pub mod scoring;

pub use alerts::{Alert, AlertGenerator, AlertStatus};
pub use correlation::{CorrelationResult, CorrelationRule, Correlator};
pub use llm::AnthropicProvider;
pub use scoring::{Scorer, ThreatScore};

use crate::bus;
use crate::event::Event;
use crate::metrics;
use anyhow::Result;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const INGRESS_CHANNEL_CAP: usize = 5000;
const WORKER_COUNT: usize = 4;

/// An engine-side consumer invoked once per event. Implementations must be
/// safe for concurrent invocation; the built-ins hold one lock over their
/// aggregate state.
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;
    fn process(&self, event: &Event) -> Result<()>;
}

pub struct Engine {
    client: Option<async_nats::Client>,
    pipelines: Vec<Arc<dyn Pipeline>>,
    ingress_tx: mpsc::Sender<Event>,
    ingress_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    processed: Arc<AtomicU64>,
}

impl Engine {
    /// Build an engine. `client` may be `None` for a bus-less engine whose
    /// only input is [`Engine::inject_event`].
    pub fn new(client: Option<async_nats::Client>) -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CHANNEL_CAP);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            client,
            pipelines: Vec::new(),
            ingress_tx,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a pipeline. Pipelines run sequentially per event, in
    /// registration order.
    pub fn register_pipeline(&mut self, pipeline: Arc<dyn Pipeline>) {
        self.pipelines.push(pipeline);
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Subscribe to the wildcard subject and start the worker pool.
    pub async fn start(&self) -> Result<()> {
        let ingress_rx = self
            .ingress_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("engine already started"))?;

        let subscriber = match &self.client {
            Some(client) => Some(client.subscribe(bus::EVENTS_WILDCARD).await?),
            None => None,
        };

        let mut tasks = self.tasks.lock().unwrap();

        if let Some(subscriber) = subscriber {
            tasks.push(tokio::spawn(subscription_reader(
                subscriber,
                self.ingress_tx.clone(),
                self.shutdown_tx.subscribe(),
            )));
        }

        let shared_rx = Arc::new(tokio::sync::Mutex::new(ingress_rx));
        for _ in 0..WORKER_COUNT {
            let pipelines = self.pipelines.clone();
            let processed = Arc::clone(&self.processed);
            let rx = Arc::clone(&shared_rx);
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(worker_loop(pipelines, processed, rx, shutdown)));
        }

        info!("engine: started with {} pipelines", self.pipelines.len());
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Push an event straight onto the ingress channel, bypassing the bus.
    /// Full channel drops the event, as on the bus path.
    pub fn inject_event(&self, event: Event) {
        let _ = self.ingress_tx.try_send(event);
    }

    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

/// Consume the shared ingress channel and run every pipeline for each
/// event.
async fn worker_loop(
    pipelines: Vec<Arc<dyn Pipeline>>,
    processed: Arc<AtomicU64>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => return,
                event = rx.recv() => match event {
                    Some(e) => e,
                    None => return,
                },
            }
        };

        for pipeline in &pipelines {
            if let Err(e) = pipeline.process(&event) {
                error!("engine: pipeline {} error: {}", pipeline.name(), e);
                metrics::PIPELINE_ERRORS
                    .with_label_values(&[pipeline.name()])
                    .inc();
            }
        }

        processed.fetch_add(1, Ordering::Relaxed);
        metrics::EVENTS_PROCESSED.inc();
    }
}

/// Deserialize each bus message and push it onto the ingress channel.
/// Malformed payloads and overflow are logged and dropped.
async fn subscription_reader(
    mut subscriber: async_nats::Subscriber,
    ingress_tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => {
                let _ = subscriber.unsubscribe().await;
                return;
            }
            message = subscriber.next() => match message {
                Some(m) => m,
                None => return,
            },
        };

        let event: Event = match serde_json::from_slice(&message.payload) {
            Ok(e) => e,
            Err(e) => {
                warn!("engine: failed to deserialize event: {}", e);
                continue;
            }
        };

        if ingress_tx.try_send(event).is_err() {
            warn!("engine: event channel full, dropping event");
            metrics::EVENTS_DROPPED.with_label_values(&["engine"]).inc();
        }
    }
}
