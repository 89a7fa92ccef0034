//! Environment-driven configuration for the agent and engine binaries.

use chrono::Duration;

/// Configuration for the collection agent, read from the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub org_id: String,
    pub api_url: String,
    pub nats_url: String,
    pub nats_token: String,
    /// Heartbeat period in seconds.
    pub heartbeat_interval: u64,
    pub enable_logs: bool,
    pub enable_network: bool,
    pub enable_cloud: bool,
    pub enable_anomaly: bool,
    pub cloud_provider: String,
    /// Log source URIs (`syslog://host:port`, `file:///path`, or bare paths).
    pub log_sources: Vec<String>,
    pub syslog_addr: String,
    /// Informational only; connection snapshots are host-wide.
    pub network_interface: String,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            agent_id: env_or("AGENT_ID", ""),
            org_id: env_or("ORG_ID", ""),
            api_url: env_or("API_URL", "http://localhost:8080"),
            nats_url: env_or("NATS_URL", "nats://localhost:4222"),
            nats_token: env_or("NATS_TOKEN", ""),
            heartbeat_interval: env_or("HEARTBEAT_INTERVAL", "30").parse().unwrap_or(30),
            enable_logs: env_bool("ENABLE_LOGS", true),
            enable_network: env_bool("ENABLE_NETWORK", true),
            enable_cloud: env_bool("ENABLE_CLOUD", false),
            enable_anomaly: env_bool("ENABLE_ANOMALY", true),
            cloud_provider: env_or("CLOUD_PROVIDER", ""),
            log_sources: split_list(&env_or("LOG_SOURCES", "")),
            syslog_addr: env_or("SYSLOG_ADDR", "0.0.0.0:1514"),
            network_interface: env_or("NETWORK_INTERFACE", ""),
        }
    }
}

/// Configuration for the analysis engine, read from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub nats_url: String,
    pub nats_token: String,
    /// Persistence belongs to the API service; the engine only records this.
    pub database_url: Option<String>,
    pub api_url: String,
    pub llm_provider: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub alert_webhook: String,
    /// One of `1h`, `6h`, `24h`, `7d`, `30d`.
    pub scoring_window: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            nats_url: env_or("NATS_URL", "nats://localhost:4222"),
            nats_token: env_or("NATS_TOKEN", ""),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            api_url: env_or("API_URL", "http://localhost:8080"),
            llm_provider: env_or("LLM_PROVIDER", "anthropic"),
            llm_api_key: env_or("LLM_API_KEY", ""),
            llm_model: env_or("LLM_MODEL", ""),
            alert_webhook: env_or("ALERT_WEBHOOK", ""),
            scoring_window: env_or("SCORING_WINDOW", "24h"),
        }
    }
}

/// Parse a scoring-window token. Unknown tokens fall back to 24 hours.
pub fn parse_scoring_window(s: &str) -> Duration {
    match s {
        "1h" => Duration::hours(1),
        "6h" => Duration::hours(6),
        "24h" => Duration::hours(24),
        "7d" => Duration::days(7),
        "30d" => Duration::days(30),
        _ => Duration::hours(24),
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() => val,
        _ => fallback.to_string(),
    }
}

fn env_bool(key: &str, fallback: bool) -> bool {
    match std::env::var(key) {
        Ok(val) if !val.is_empty() => val == "true",
        _ => fallback,
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}
