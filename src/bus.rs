//! Bus transport: subject scheme and connection setup.
//!
//! Agents publish each event to `events.{org_id}.{agent_id}`; the engine
//! subscribes to the wildcard. Authentication is a static token when one is
//! configured.

use anyhow::{Context, Result};

/// Wildcard subject the engine subscribes to.
pub const EVENTS_WILDCARD: &str = "events.>";

/// Subject an agent publishes its events to.
pub fn event_subject(org_id: &str, agent_id: &str) -> String {
    format!("events.{}.{}", org_id, agent_id)
}

/// Connect to the bus. A failure here is fatal to the caller: neither binary
/// can do useful work without the transport.
pub async fn connect(url: &str, token: &str) -> Result<async_nats::Client> {
    let mut opts = async_nats::ConnectOptions::new();
    if !token.is_empty() {
        opts = opts.token(token.to_string());
    }
    opts.connect(url)
        .await
        .with_context(|| format!("failed to connect to bus at {}", url))
}
