//! Agent-side collectors: long-lived producer tasks feeding the shared
//! bounded event channel. Sends never block; when the channel is full the
//! event is dropped and counted.

pub mod cloud;
pub mod host;
pub mod logs;
pub mod network;

pub use cloud::CloudCollector;
pub use host::HostMetricsCollector;
pub use logs::LogCollector;
pub use network::NetworkCollector;

use crate::event::Event;
use crate::metrics;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Non-blocking send shared by all collectors: drop-newest on a full
/// channel, silent on a closed one (shutdown in progress).
pub(crate) fn emit(tx: &mpsc::Sender<Event>, component: &str, event: Event) {
    match tx.try_send(event) {
        Ok(()) => {
            metrics::EVENTS_EMITTED.with_label_values(&[component]).inc();
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("{} collector: event channel full, dropping event", component);
            metrics::EVENTS_DROPPED.with_label_values(&[component]).inc();
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("{} collector: event channel closed", component);
        }
    }
}
