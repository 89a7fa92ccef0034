//! Azure posture rules over `az` CLI JSON output.

use super::{cli_available, run_cli, Finding, Provider};
use crate::event::{Category, Severity};
use serde::Deserialize;
use tracing::info;

pub struct AzureScanner;

impl AzureScanner {
    pub fn new() -> Self {
        Self
    }

    pub async fn scan(&self) -> Vec<Finding> {
        if !cli_available("az") {
            info!("azure scanner: Azure CLI not available, skipping");
            return Vec::new();
        }

        let mut findings = check_nsgs().await;
        findings.extend(check_storage_accounts().await);
        findings.extend(check_sql_servers().await);
        findings
    }
}

impl Default for AzureScanner {
    fn default() -> Self {
        Self::new()
    }
}

async fn check_nsgs() -> Vec<Finding> {
    let Some(out) = run_cli("az", &["network", "nsg", "list", "--output", "json"]).await else {
        return Vec::new();
    };
    nsg_findings(&out)
}

#[derive(Deserialize)]
struct Nsg {
    #[serde(default)]
    name: String,
    #[serde(rename = "securityRules", default)]
    security_rules: Vec<NsgRule>,
}

#[derive(Deserialize)]
struct NsgRule {
    #[serde(default)]
    name: String,
    #[serde(default)]
    access: String,
    #[serde(default)]
    direction: String,
    #[serde(rename = "sourceAddressPrefix", default)]
    source_address_prefix: String,
    #[serde(rename = "destinationPortRange", default)]
    destination_port_range: String,
    #[serde(default)]
    protocol: String,
}

/// Inbound allow rules open to any source. SSH/RDP or any-port rules are
/// critical.
fn nsg_findings(raw: &[u8]) -> Vec<Finding> {
    let Ok(nsgs) = serde_json::from_slice::<Vec<Nsg>>(raw) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for nsg in &nsgs {
        for rule in &nsg.security_rules {
            let open_source = matches!(
                rule.source_address_prefix.as_str(),
                "*" | "0.0.0.0/0" | "Internet"
            );
            if rule.direction != "Inbound" || rule.access != "Allow" || !open_source {
                continue;
            }

            let severity = match rule.destination_port_range.as_str() {
                "22" | "3389" | "*" => Severity::Critical,
                _ => Severity::Medium,
            };

            findings.push(
                Finding::new(
                    Provider::Azure,
                    "nsg",
                    nsg.name.clone(),
                    Category::Misconfiguration,
                    severity,
                    format!(
                        "NSG {} rule {} allows inbound from any source",
                        nsg.name, rule.name
                    ),
                    "Restrict the source address prefix to specific IP ranges",
                )
                .with_metadata("rule_name", rule.name.clone())
                .with_metadata("port_range", rule.destination_port_range.clone())
                .with_metadata("protocol", rule.protocol.clone()),
            );
        }
    }
    findings
}

async fn check_storage_accounts() -> Vec<Finding> {
    let Some(out) = run_cli("az", &["storage", "account", "list", "--output", "json"]).await else {
        return Vec::new();
    };
    storage_account_findings(&out)
}

#[derive(Deserialize)]
struct StorageAccount {
    #[serde(default)]
    name: String,
    #[serde(rename = "enableHttpsTrafficOnly", default)]
    https_only: bool,
    #[serde(rename = "allowBlobPublicAccess", default)]
    allow_blob_public: bool,
    #[serde(rename = "networkRuleSet", default)]
    network_rule_set: NetworkRuleSet,
}

#[derive(Deserialize, Default)]
struct NetworkRuleSet {
    #[serde(rename = "defaultAction", default)]
    default_action: String,
}

fn storage_account_findings(raw: &[u8]) -> Vec<Finding> {
    let Ok(accounts) = serde_json::from_slice::<Vec<StorageAccount>>(raw) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for acct in &accounts {
        if !acct.https_only {
            findings.push(Finding::new(
                Provider::Azure,
                "storage",
                acct.name.clone(),
                Category::Misconfiguration,
                Severity::High,
                format!("Storage account {} does not enforce HTTPS-only traffic", acct.name),
                "Enable 'Secure transfer required' on the storage account",
            ));
        }

        if acct.allow_blob_public {
            findings.push(Finding::new(
                Provider::Azure,
                "storage",
                acct.name.clone(),
                Category::Misconfiguration,
                Severity::Critical,
                format!("Storage account {} allows public blob access", acct.name),
                "Disable public blob access on the storage account",
            ));
        }

        if acct.network_rule_set.default_action.to_lowercase() == "allow" {
            findings.push(Finding::new(
                Provider::Azure,
                "storage",
                acct.name.clone(),
                Category::Misconfiguration,
                Severity::Medium,
                format!("Storage account {} network rules default to allow", acct.name),
                "Set the default network rule action to Deny and add specific allow rules",
            ));
        }
    }
    findings
}

async fn check_sql_servers() -> Vec<Finding> {
    let Some(out) = run_cli("az", &["sql", "server", "list", "--output", "json"]).await else {
        return Vec::new();
    };
    let Ok(servers) = serde_json::from_slice::<Vec<SqlServer>>(&out) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for srv in &servers {
        let Some(rules) = run_cli(
            "az",
            &[
                "sql", "server", "firewall-rule", "list",
                "--server", &srv.name,
                "--resource-group", &srv.resource_group,
                "--output", "json",
            ],
        )
        .await
        else {
            continue;
        };
        findings.extend(sql_firewall_findings(&srv.name, &rules));
    }
    findings
}

#[derive(Deserialize)]
struct SqlServer {
    #[serde(default)]
    name: String,
    #[serde(rename = "resourceGroup", default)]
    resource_group: String,
}

#[derive(Deserialize)]
struct SqlFirewallRule {
    #[serde(rename = "startIpAddress", default)]
    start_ip: String,
    #[serde(rename = "endIpAddress", default)]
    end_ip: String,
}

/// All-address firewall ranges are critical; the 0.0.0.0–0.0.0.0 range is
/// the Azure-services allowance and only medium.
fn sql_firewall_findings(server: &str, raw: &[u8]) -> Vec<Finding> {
    let Ok(rules) = serde_json::from_slice::<Vec<SqlFirewallRule>>(raw) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for rule in &rules {
        if rule.start_ip == "0.0.0.0" && rule.end_ip == "255.255.255.255" {
            findings.push(Finding::new(
                Provider::Azure,
                "sql-server",
                server,
                Category::Misconfiguration,
                Severity::Critical,
                format!("SQL Server {} has a firewall rule allowing all IP addresses", server),
                "Remove the overly permissive firewall rule and restrict access",
            ));
        }
        if rule.start_ip == "0.0.0.0" && rule.end_ip == "0.0.0.0" {
            findings.push(Finding::new(
                Provider::Azure,
                "sql-server",
                server,
                Category::Misconfiguration,
                Severity::Medium,
                format!("SQL Server {} allows access from Azure services", server),
                "Review if Azure service access is needed; disable if not required",
            ));
        }
    }
    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_ssh_rule_critical() {
        let raw = br#"[{"name":"prod-nsg","securityRules":[
            {"name":"allow-ssh","access":"Allow","direction":"Inbound","sourceAddressPrefix":"*","destinationPortRange":"22","protocol":"Tcp"},
            {"name":"allow-web","access":"Allow","direction":"Inbound","sourceAddressPrefix":"Internet","destinationPortRange":"443","protocol":"Tcp"},
            {"name":"deny-all","access":"Deny","direction":"Inbound","sourceAddressPrefix":"*","destinationPortRange":"*","protocol":"*"},
            {"name":"outbound","access":"Allow","direction":"Outbound","sourceAddressPrefix":"*","destinationPortRange":"*","protocol":"*"}
        ]}]"#;
        let findings = nsg_findings(raw);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].metadata["port_range"], "22");
        assert_eq!(findings[1].severity, Severity::Medium);
    }

    #[test]
    fn test_any_port_rule_critical() {
        let raw = br#"[{"name":"n","securityRules":[
            {"name":"wide-open","access":"Allow","direction":"Inbound","sourceAddressPrefix":"0.0.0.0/0","destinationPortRange":"*","protocol":"*"}
        ]}]"#;
        let findings = nsg_findings(raw);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[test]
    fn test_storage_account_rules() {
        let raw = br#"[{
            "name":"proddata",
            "enableHttpsTrafficOnly":false,
            "allowBlobPublicAccess":true,
            "networkRuleSet":{"defaultAction":"Allow"}
        },{
            "name":"lockeddown",
            "enableHttpsTrafficOnly":true,
            "allowBlobPublicAccess":false,
            "networkRuleSet":{"defaultAction":"Deny"}
        }]"#;
        let findings = storage_account_findings(raw);
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].severity, Severity::High); // https off
        assert_eq!(findings[1].severity, Severity::Critical); // public blobs
        assert_eq!(findings[2].severity, Severity::Medium); // default allow
        assert!(findings.iter().all(|f| f.resource_id == "proddata"));
    }

    #[test]
    fn test_sql_firewall_ranges() {
        let raw = br#"[
            {"name":"allow-all","startIpAddress":"0.0.0.0","endIpAddress":"255.255.255.255"},
            {"name":"azure-services","startIpAddress":"0.0.0.0","endIpAddress":"0.0.0.0"},
            {"name":"office","startIpAddress":"198.51.100.1","endIpAddress":"198.51.100.10"}
        ]"#;
        let findings = sql_firewall_findings("sqlprod", raw);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[1].severity, Severity::Medium);
    }

    #[test]
    fn test_malformed_json_is_skipped() {
        assert!(nsg_findings(b"oops").is_empty());
        assert!(storage_account_findings(b"{}").is_empty());
        assert!(sql_firewall_findings("s", b"null").is_empty());
    }
}
