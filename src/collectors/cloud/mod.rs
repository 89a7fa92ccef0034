//! Cloud posture scanning: a periodic driver invoking provider scanners and
//! translating their findings into events.
//!
//! Scanners shell out to the provider CLI (`aws`, `az`, `gcloud`/`gsutil`)
//! and parse only the JSON fields their rules need. A scanner that cannot
//! execute (missing CLI or credentials) yields nothing; it never fails the
//! collector. Findings are not deduplicated here.

mod aws;
mod azure;
mod gcp;

pub use aws::AwsScanner;
pub use azure::AzureScanner;
pub use gcp::GcpScanner;

use crate::collectors::emit;
use crate::event::{Category, Event, Severity};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::info;

const DEFAULT_SCAN_INTERVAL_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Azure => "azure",
            Provider::Gcp => "gcp",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured posture finding, translated 1:1 into an event.
#[derive(Debug, Clone)]
pub struct Finding {
    pub provider: Provider,
    pub resource: String,
    pub resource_id: String,
    pub category: Category,
    pub severity: Severity,
    pub description: String,
    pub remediation: String,
    pub metadata: serde_json::Map<String, Value>,
}

impl Finding {
    pub fn new(
        provider: Provider,
        resource: &str,
        resource_id: impl Into<String>,
        category: Category,
        severity: Severity,
        description: impl Into<String>,
        remediation: &str,
    ) -> Self {
        Self {
            provider,
            resource: resource.to_string(),
            resource_id: resource_id.into(),
            category,
            severity,
            description: description.into(),
            remediation: remediation.to_string(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Provider scanner set. A closed variant set rather than a trait object:
/// each arm knows its CLI and its rules.
pub enum CloudScanner {
    Aws(AwsScanner),
    Azure(AzureScanner),
    Gcp(GcpScanner),
}

impl CloudScanner {
    pub fn name(&self) -> &'static str {
        match self {
            CloudScanner::Aws(_) => "aws",
            CloudScanner::Azure(_) => "azure",
            CloudScanner::Gcp(_) => "gcp",
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            CloudScanner::Aws(_) => Provider::Aws,
            CloudScanner::Azure(_) => Provider::Azure,
            CloudScanner::Gcp(_) => Provider::Gcp,
        }
    }

    pub async fn scan(&self) -> Vec<Finding> {
        match self {
            CloudScanner::Aws(s) => s.scan().await,
            CloudScanner::Azure(s) => s.scan().await,
            CloudScanner::Gcp(s) => s.scan().await,
        }
    }
}

pub struct CloudCollector {
    scanners: Vec<CloudScanner>,
    interval: tokio::time::Duration,
    tx: mpsc::Sender<Event>,
    state: Mutex<ScanState>,
}

#[derive(Default)]
struct ScanState {
    findings: Vec<Finding>,
    last_scan: Option<DateTime<Utc>>,
}

impl CloudCollector {
    pub fn new(provider: &str, interval_secs: u64, tx: mpsc::Sender<Event>) -> Self {
        let interval_secs = if interval_secs == 0 {
            DEFAULT_SCAN_INTERVAL_SECS
        } else {
            interval_secs
        };

        let scanner = match provider {
            "azure" => CloudScanner::Azure(AzureScanner::new()),
            "gcp" => CloudScanner::Gcp(GcpScanner::new()),
            _ => CloudScanner::Aws(AwsScanner::new()),
        };

        Self {
            scanners: vec![scanner],
            interval: tokio::time::Duration::from_secs(interval_secs),
            tx,
            state: Mutex::new(ScanState::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        "cloud"
    }

    pub fn register_scanner(&mut self, scanner: CloudScanner) {
        self.scanners.push(scanner);
    }

    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.run_scan().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticker.tick() => self.run_scan().await,
            }
        }
    }

    async fn run_scan(&self) {
        let mut all_findings = Vec::new();
        for scanner in &self.scanners {
            info!("cloud collector: starting {} scan", scanner.name());
            all_findings.extend(scanner.scan().await);
        }

        {
            let mut state = self.state.lock().unwrap();
            state.findings = all_findings.clone();
            state.last_scan = Some(Utc::now());
        }

        let count = all_findings.len();
        for finding in all_findings {
            emit(&self.tx, "cloud", finding_to_event(finding));
        }

        info!("cloud collector: scan complete, {} findings", count);
    }

    pub fn get_findings(&self) -> Vec<Finding> {
        self.state.lock().unwrap().findings.clone()
    }

    pub fn last_scan_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().last_scan
    }
}

pub fn finding_to_event(f: Finding) -> Event {
    Event::new("cloud", f.category, f.severity, f.description)
        .with_payload("provider", f.provider.as_str())
        .with_payload("resource", f.resource)
        .with_payload("resource_id", f.resource_id)
        .with_payload("remediation", f.remediation)
        .with_payload("metadata", Value::Object(f.metadata))
}

/// Look for an executable on PATH.
pub(crate) fn cli_available(name: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(name).is_file())
}

/// Run a CLI command and return stdout on success.
pub(crate) async fn run_cli(cmd: &str, args: &[&str]) -> Option<Vec<u8>> {
    let output = tokio::process::Command::new(cmd)
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finding_to_event_shape() {
        let finding = Finding::new(
            Provider::Aws,
            "s3",
            "my-bucket",
            Category::Misconfiguration,
            Severity::Critical,
            "S3 bucket my-bucket has public access via ACL",
            "Remove public access grants",
        )
        .with_metadata("grantee_uri", "http://acs.amazonaws.com/groups/global/AllUsers");

        let event = finding_to_event(finding);
        assert_eq!(event.source, "cloud");
        assert_eq!(event.category, Category::Misconfiguration);
        assert_eq!(event.severity, Severity::Critical);
        assert_eq!(event.payload["provider"], "aws");
        assert_eq!(event.payload["resource"], "s3");
        assert_eq!(event.payload["resource_id"], "my-bucket");
        assert!(event.payload["metadata"]["grantee_uri"]
            .as_str()
            .unwrap()
            .contains("AllUsers"));
    }

    #[test]
    fn test_provider_selection() {
        let (tx, _rx) = mpsc::channel(4);
        let c = CloudCollector::new("azure", 0, tx.clone());
        assert_eq!(c.scanners[0].provider(), Provider::Azure);

        let c = CloudCollector::new("gcp", 0, tx.clone());
        assert_eq!(c.scanners[0].provider(), Provider::Gcp);

        // Unknown providers fall back to AWS
        let c = CloudCollector::new("", 0, tx);
        assert_eq!(c.scanners[0].provider(), Provider::Aws);
        assert_eq!(c.interval, tokio::time::Duration::from_secs(900));
    }

    #[test]
    fn test_register_additional_scanner() {
        let (tx, _rx) = mpsc::channel(4);
        let mut c = CloudCollector::new("aws", 0, tx);
        c.register_scanner(CloudScanner::Gcp(GcpScanner::new()));
        assert_eq!(c.scanners.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_cli_yields_no_findings() {
        // Scanners degrade to zero findings when their CLI is absent; the
        // scan pass itself still completes and records its time
        let (tx, mut rx) = mpsc::channel(4);
        let c = CloudCollector::new("gcp", 0, tx);
        if cli_available("gcloud") {
            return;
        }
        c.run_scan().await;
        assert!(c.get_findings().is_empty());
        assert!(c.last_scan_time().is_some());
        assert!(rx.try_recv().is_err());
    }
}
