//! AWS posture rules over `aws` CLI JSON output.

use super::{cli_available, run_cli, Finding, Provider};
use crate::event::{Category, Severity};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

const KEY_MAX_AGE_DAYS: i64 = 90;

pub struct AwsScanner;

impl AwsScanner {
    pub fn new() -> Self {
        Self
    }

    pub async fn scan(&self) -> Vec<Finding> {
        if !self.is_available() {
            info!("aws scanner: AWS CLI not available, skipping");
            return Vec::new();
        }

        let mut findings = check_s3_buckets().await;
        findings.extend(check_security_groups().await);
        findings.extend(check_iam_users().await);
        findings
    }

    fn is_available(&self) -> bool {
        if !cli_available("aws") {
            return false;
        }
        if std::env::var("AWS_ACCESS_KEY_ID").is_ok() || std::env::var("AWS_PROFILE").is_ok() {
            return true;
        }
        match std::env::var("HOME") {
            Ok(home) if !home.is_empty() => {
                std::path::Path::new(&home).join(".aws/credentials").exists()
            }
            _ => false,
        }
    }
}

impl Default for AwsScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct BucketList {
    #[serde(rename = "Buckets", default)]
    buckets: Vec<BucketEntry>,
}

#[derive(Deserialize)]
struct BucketEntry {
    #[serde(rename = "Name")]
    name: String,
}

async fn check_s3_buckets() -> Vec<Finding> {
    let Some(out) = run_cli("aws", &["s3api", "list-buckets", "--output", "json"]).await else {
        return Vec::new();
    };
    let Ok(list) = serde_json::from_slice::<BucketList>(&out) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for bucket in &list.buckets {
        if let Some(acl) = run_cli(
            "aws",
            &["s3api", "get-bucket-acl", "--bucket", &bucket.name, "--output", "json"],
        )
        .await
        {
            findings.extend(acl_findings(&bucket.name, &acl));
        }

        if let Some(policy) = run_cli(
            "aws",
            &["s3api", "get-bucket-policy", "--bucket", &bucket.name, "--output", "json"],
        )
        .await
        {
            findings.extend(policy_findings(&bucket.name, &String::from_utf8_lossy(&policy)));
        }
    }
    findings
}

#[derive(Deserialize)]
struct BucketAcl {
    #[serde(rename = "Grants", default)]
    grants: Vec<Grant>,
}

#[derive(Deserialize)]
struct Grant {
    #[serde(rename = "Grantee", default)]
    grantee: Grantee,
    #[serde(rename = "Permission", default)]
    permission: String,
}

#[derive(Deserialize, Default)]
struct Grantee {
    #[serde(rename = "URI", default)]
    uri: String,
}

/// Public ACL grants (AllUsers / AuthenticatedUsers) on a bucket.
fn acl_findings(bucket: &str, raw: &[u8]) -> Vec<Finding> {
    let Ok(acl) = serde_json::from_slice::<BucketAcl>(raw) else {
        return Vec::new();
    };

    acl.grants
        .iter()
        .filter(|g| g.grantee.uri.contains("AllUsers") || g.grantee.uri.contains("AuthenticatedUsers"))
        .map(|g| {
            Finding::new(
                Provider::Aws,
                "s3",
                bucket,
                Category::Misconfiguration,
                Severity::Critical,
                format!("S3 bucket {} has public access via ACL", bucket),
                "Remove public access grants from the bucket ACL and enable Block Public Access",
            )
            .with_metadata("grant_permission", g.permission.clone())
            .with_metadata("grantee_uri", g.grantee.uri.clone())
        })
        .collect()
}

/// Wildcard-principal allow statements in a bucket policy. The CLI wraps
/// the policy document in an outer `{"Policy": "<json string>"}` envelope.
fn policy_findings(bucket: &str, policy: &str) -> Vec<Finding> {
    #[derive(Deserialize)]
    struct PolicyEnvelope {
        #[serde(rename = "Policy", default)]
        policy: String,
    }

    let document = match serde_json::from_str::<PolicyEnvelope>(policy) {
        Ok(env) if !env.policy.is_empty() => env.policy,
        _ => policy.to_string(),
    };

    let Ok(doc) = serde_json::from_str::<serde_json::Value>(&document) else {
        return Vec::new();
    };

    let statements = match doc.get("Statement").and_then(|s| s.as_array()) {
        Some(s) => s.clone(),
        None => return Vec::new(),
    };

    let wildcard_allow = statements.iter().any(|stmt| {
        let allow = stmt.get("Effect").and_then(|e| e.as_str()) == Some("Allow");
        let principal = stmt.get("Principal");
        let wildcard = match principal {
            Some(serde_json::Value::String(s)) => s == "*",
            Some(serde_json::Value::Object(map)) => {
                map.values().any(|v| v.as_str() == Some("*"))
            }
            _ => false,
        };
        allow && wildcard
    });

    if wildcard_allow {
        return vec![Finding::new(
            Provider::Aws,
            "s3",
            bucket,
            Category::Misconfiguration,
            Severity::High,
            format!("S3 bucket {} has an overly permissive bucket policy", bucket),
            "Review and restrict the bucket policy to specific principals",
        )];
    }
    Vec::new()
}

async fn check_security_groups() -> Vec<Finding> {
    let Some(out) = run_cli("aws", &["ec2", "describe-security-groups", "--output", "json"]).await
    else {
        return Vec::new();
    };
    security_group_findings(&out)
}

#[derive(Deserialize)]
struct SecurityGroupList {
    #[serde(rename = "SecurityGroups", default)]
    groups: Vec<SecurityGroup>,
}

#[derive(Deserialize)]
struct SecurityGroup {
    #[serde(rename = "GroupId", default)]
    group_id: String,
    #[serde(rename = "GroupName", default)]
    group_name: String,
    #[serde(rename = "IpPermissions", default)]
    permissions: Vec<IpPermission>,
}

#[derive(Deserialize)]
struct IpPermission {
    #[serde(rename = "FromPort", default)]
    from_port: i64,
    #[serde(rename = "ToPort", default)]
    to_port: i64,
    #[serde(rename = "IpProtocol", default)]
    protocol: String,
    #[serde(rename = "IpRanges", default)]
    ranges: Vec<IpRange>,
}

#[derive(Deserialize)]
struct IpRange {
    #[serde(rename = "CidrIp", default)]
    cidr: String,
}

/// World-open ingress rules. SSH/RDP or all-protocol rules are critical.
fn security_group_findings(raw: &[u8]) -> Vec<Finding> {
    let Ok(list) = serde_json::from_slice::<SecurityGroupList>(raw) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for sg in &list.groups {
        for perm in &sg.permissions {
            for range in &perm.ranges {
                if range.cidr != "0.0.0.0/0" {
                    continue;
                }
                let severity = if perm.from_port == 22 || perm.from_port == 3389 || perm.protocol == "-1" {
                    Severity::Critical
                } else {
                    Severity::Medium
                };

                findings.push(
                    Finding::new(
                        Provider::Aws,
                        "ec2-sg",
                        sg.group_id.clone(),
                        Category::Misconfiguration,
                        severity,
                        format!("Security group {} allows inbound from 0.0.0.0/0", sg.group_name),
                        "Restrict inbound rules to specific IP ranges or security groups",
                    )
                    .with_metadata("from_port", perm.from_port)
                    .with_metadata("to_port", perm.to_port)
                    .with_metadata("protocol", perm.protocol.clone()),
                );
            }
        }
    }
    findings
}

async fn check_iam_users() -> Vec<Finding> {
    let Some(out) = run_cli("aws", &["iam", "list-users", "--output", "json"]).await else {
        return Vec::new();
    };
    let Ok(list) = serde_json::from_slice::<UserList>(&out) else {
        return Vec::new();
    };

    let mut findings = Vec::new();
    for user in &list.users {
        if let Some(keys) = run_cli(
            "aws",
            &["iam", "list-access-keys", "--user-name", &user.user_name, "--output", "json"],
        )
        .await
        {
            findings.extend(access_key_findings(&user.user_name, &keys, Utc::now()));
        }

        if let Some(mfa) = run_cli(
            "aws",
            &["iam", "list-mfa-devices", "--user-name", &user.user_name, "--output", "json"],
        )
        .await
        {
            findings.extend(mfa_findings(&user.user_name, &mfa));
        }
    }
    findings
}

#[derive(Deserialize)]
struct UserList {
    #[serde(rename = "Users", default)]
    users: Vec<User>,
}

#[derive(Deserialize)]
struct User {
    #[serde(rename = "UserName", default)]
    user_name: String,
}

#[derive(Deserialize)]
struct AccessKeyList {
    #[serde(rename = "AccessKeyMetadata", default)]
    keys: Vec<AccessKey>,
}

#[derive(Deserialize)]
struct AccessKey {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "CreateDate", default)]
    create_date: String,
}

/// Active access keys older than 90 days.
fn access_key_findings(user: &str, raw: &[u8], now: DateTime<Utc>) -> Vec<Finding> {
    let Ok(list) = serde_json::from_slice::<AccessKeyList>(raw) else {
        return Vec::new();
    };

    list.keys
        .iter()
        .filter(|k| k.status == "Active" && is_older_than(&k.create_date, now, KEY_MAX_AGE_DAYS))
        .map(|_| {
            Finding::new(
                Provider::Aws,
                "iam",
                user,
                Category::CredentialHygiene,
                Severity::Medium,
                format!("IAM user {} has access keys older than 90 days", user),
                "Rotate the access key and update any applications using it",
            )
        })
        .collect()
}

#[derive(Deserialize)]
struct MfaDeviceList {
    #[serde(rename = "MFADevices", default)]
    devices: Vec<serde_json::Value>,
}

fn mfa_findings(user: &str, raw: &[u8]) -> Vec<Finding> {
    let Ok(list) = serde_json::from_slice::<MfaDeviceList>(raw) else {
        return Vec::new();
    };
    if !list.devices.is_empty() {
        return Vec::new();
    }
    vec![Finding::new(
        Provider::Aws,
        "iam",
        user,
        Category::CredentialHygiene,
        Severity::High,
        format!("IAM user {} does not have MFA enabled", user),
        "Enable MFA for the IAM user to add an extra layer of security",
    )]
}

fn is_older_than(date: &str, now: DateTime<Utc>, days: i64) -> bool {
    match DateTime::parse_from_rfc3339(date) {
        Ok(t) => now - t.with_timezone(&Utc) > chrono::Duration::days(days),
        Err(_) => false,
    }
}
