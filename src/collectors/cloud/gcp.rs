//! GCP posture rules over `gcloud`/`gsutil` output.

use super::{cli_available, run_cli, Finding, Provider};
use crate::event::{Category, Severity};
use serde::Deserialize;
use tracing::info;

pub struct GcpScanner;

impl GcpScanner {
    pub fn new() -> Self {
        Self
    }

    pub async fn scan(&self) -> Vec<Finding> {
        if !cli_available("gcloud") {
            info!("gcp scanner: gcloud CLI not available, skipping");
            return Vec::new();
        }

        let mut findings = check_firewall_rules().await;
        findings.extend(check_storage_buckets().await);
        findings.extend(check_service_accounts().await);
        findings
    }
}

impl Default for GcpScanner {
    fn default() -> Self {
        Self::new()
    }
}

async fn check_firewall_rules() -> Vec<Finding> {
    let Some(out) = run_cli("gcloud", &["compute", "firewall-rules", "list", "--format=json"]).await
    else {
        return Vec::new();
    };
    firewall_findings(&out)
}

#[derive(Deserialize)]
struct FirewallRule {
    #[serde(default)]
    name: String,
    #[serde(default)]
    direction: String,
    #[serde(rename = "sourceRanges", default)]
    source_ranges: Vec<String>,
    #[serde(default)]
    allowed: Vec<AllowedEntry>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Deserialize)]
struct AllowedEntry {
    #[serde(rename = "IPProtocol", default)]
    protocol: String,
    #[serde(default)]
    ports: Vec<String>,
}

/// World-open ingress rules; SSH/RDP ports or all-protocol allowances are
/// critical.
fn firewall_findings(raw: &[u8]) -> Vec<Finding> {
    let Ok(rules) = serde_json::from_slice::<Vec<FirewallRule>>(raw) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for rule in &rules {
        if rule.disabled || rule.direction != "INGRESS" {
            continue;
        }
        if !rule.source_ranges.iter().any(|s| s == "0.0.0.0/0") {
            continue;
        }

        for allow in &rule.allowed {
            let mut severity = Severity::Medium;
            if allow.ports.iter().any(|p| p == "22" || p == "3389") {
                severity = Severity::Critical;
            }
            if allow.protocol == "all" {
                severity = Severity::Critical;
            }

            let ports = if allow.ports.is_empty() {
                "all".to_string()
            } else {
                allow.ports.join(",")
            };

            findings.push(
                Finding::new(
                    Provider::Gcp,
                    "firewall",
                    rule.name.clone(),
                    Category::Misconfiguration,
                    severity,
                    format!("Firewall rule {} allows ingress from 0.0.0.0/0", rule.name),
                    "Restrict source ranges to specific IP addresses or CIDR blocks",
                )
                .with_metadata("protocol", allow.protocol.clone())
                .with_metadata("ports", ports),
            );
        }
    }
    findings
}

async fn check_storage_buckets() -> Vec<Finding> {
    let Some(out) = run_cli("gsutil", &["ls"]).await else {
        return Vec::new();
    };
    let listing = String::from_utf8_lossy(&out);

    let mut findings = Vec::new();
    for bucket in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some(iam) = run_cli("gsutil", &["iam", "get", bucket]).await else {
            continue;
        };
        findings.extend(bucket_iam_findings(bucket, &String::from_utf8_lossy(&iam)));
    }
    findings
}

/// Buckets granting roles to allUsers / allAuthenticatedUsers.
fn bucket_iam_findings(bucket: &str, iam_policy: &str) -> Vec<Finding> {
    if !iam_policy.contains("allUsers") && !iam_policy.contains("allAuthenticatedUsers") {
        return Vec::new();
    }

    let name = bucket.trim_start_matches("gs://").trim_end_matches('/');
    vec![Finding::new(
        Provider::Gcp,
        "storage",
        name,
        Category::Misconfiguration,
        Severity::Critical,
        format!("Storage bucket {} is publicly accessible", name),
        "Remove allUsers and allAuthenticatedUsers from the bucket IAM policy",
    )]
}

async fn check_service_accounts() -> Vec<Finding> {
    let Some(out) = run_cli("gcloud", &["iam", "service-accounts", "list", "--format=json"]).await
    else {
        return Vec::new();
    };
    let Ok(accounts) = serde_json::from_slice::<Vec<ServiceAccount>>(&out) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for acct in accounts.iter().filter(|a| !a.disabled) {
        let Some(keys) = run_cli(
            "gcloud",
            &[
                "iam", "service-accounts", "keys", "list",
                "--iam-account", &acct.email,
                "--format=json",
            ],
        )
        .await
        else {
            continue;
        };
        findings.extend(service_account_key_findings(&acct.email, &keys));
    }
    findings
}

#[derive(Deserialize)]
struct ServiceAccount {
    #[serde(default)]
    email: String,
    #[serde(default)]
    disabled: bool,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    #[serde(rename = "keyType", default)]
    key_type: String,
}

/// Service accounts carrying user-managed keys.
fn service_account_key_findings(email: &str, raw: &[u8]) -> Vec<Finding> {
    let Ok(keys) = serde_json::from_slice::<Vec<ServiceAccountKey>>(raw) else {
        return Vec::new();
    };

    let user_keys = keys.iter().filter(|k| k.key_type == "USER_MANAGED").count();
    if user_keys == 0 {
        return Vec::new();
    }

    vec![Finding::new(
        Provider::Gcp,
        "iam-sa",
        email,
        Category::CredentialHygiene,
        Severity::Medium,
        format!("Service account {} has {} user-managed key(s)", email, user_keys),
        "Use workload identity or short-lived credentials instead of user-managed keys",
    )]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_firewall_severities() {
        let raw = br#"[
            {"name":"allow-ssh","direction":"INGRESS","sourceRanges":["0.0.0.0/0"],
             "allowed":[{"IPProtocol":"tcp","ports":["22"]}],"disabled":false},
            {"name":"allow-http","direction":"INGRESS","sourceRanges":["0.0.0.0/0"],
             "allowed":[{"IPProtocol":"tcp","ports":["80","443"]}],"disabled":false},
            {"name":"allow-everything","direction":"INGRESS","sourceRanges":["0.0.0.0/0"],
             "allowed":[{"IPProtocol":"all","ports":[]}],"disabled":false},
            {"name":"internal-only","direction":"INGRESS","sourceRanges":["10.0.0.0/8"],
             "allowed":[{"IPProtocol":"tcp","ports":["22"]}],"disabled":false},
            {"name":"disabled-rule","direction":"INGRESS","sourceRanges":["0.0.0.0/0"],
             "allowed":[{"IPProtocol":"tcp","ports":["22"]}],"disabled":true},
            {"name":"egress","direction":"EGRESS","sourceRanges":["0.0.0.0/0"],
             "allowed":[{"IPProtocol":"tcp","ports":["22"]}],"disabled":false}
        ]"#;
        let findings = firewall_findings(raw);
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].severity, Severity::Critical); // ssh
        assert_eq!(findings[1].severity, Severity::Medium); // http
        assert_eq!(findings[2].severity, Severity::Critical); // all protocols
        assert_eq!(findings[2].metadata["ports"], "all");
    }

    #[test]
    fn test_public_bucket_iam() {
        let policy = r#"{"bindings":[{"members":["allUsers"],"role":"roles/storage.objectViewer"}]}"#;
        let findings = bucket_iam_findings("gs://public-assets/", policy);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].resource_id, "public-assets");

        let private = r#"{"bindings":[{"members":["user:alice@example.com"],"role":"roles/storage.admin"}]}"#;
        assert!(bucket_iam_findings("gs://private/", private).is_empty());
    }

    #[test]
    fn test_user_managed_keys() {
        let raw = br#"[
            {"keyType":"USER_MANAGED"},
            {"keyType":"USER_MANAGED"},
            {"keyType":"SYSTEM_MANAGED"}
        ]"#;
        let findings = service_account_key_findings("svc@proj.iam.gserviceaccount.com", raw);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, Category::CredentialHygiene);
        assert!(findings[0].description.contains("2 user-managed"));

        let system_only = br#"[{"keyType":"SYSTEM_MANAGED"}]"#;
        assert!(service_account_key_findings("svc@p", system_only).is_empty());
    }
}
