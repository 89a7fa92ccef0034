//! Language-model explanations for security events.
//!
//! The provider is a narrow collaborator: `explain` and `summarize` call
//! the Anthropic API when a key is configured and fall back to
//! deterministic local text otherwise, so the engine works without one.

use crate::event::Event;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 500;
const REQUEST_TIMEOUT_SECS: u64 = 30;
const SUMMARY_EVENT_LIMIT: usize = 20;

pub struct AnthropicProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: &str) -> Self {
        let model = if model.is_empty() { DEFAULT_MODEL } else { model };
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// True when calls go to the API rather than the local fallback.
    pub fn is_remote(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Human-readable explanation of one event.
    pub async fn explain(&self, event: &Event, context: &str) -> Result<String> {
        if self.api_key.is_empty() {
            return Ok(local_explanation(event));
        }

        let prompt = format!(
            "You are a cybersecurity analyst. Analyze this security event and provide a brief, \
             actionable explanation suitable for both technical and non-technical audiences.\n\n\
             Event Details:\n\
             - Source: {}\n\
             - Category: {}\n\
             - Severity: {}\n\
             - Summary: {}\n\
             - Risk Score: {:.1}\n\n\
             Additional Context: {}\n\n\
             Provide:\n\
             1. What happened (1-2 sentences, plain language)\n\
             2. Why it matters (1-2 sentences)\n\
             3. Recommended action (1-2 sentences)\n\n\
             Keep your response concise and focused.",
            event.source, event.category, event.severity, event.summary, event.risk_score, context
        );

        self.call(&prompt).await
    }

    /// Executive summary over a batch of events.
    pub async fn summarize(&self, events: &[Event]) -> Result<String> {
        if self.api_key.is_empty() {
            return Ok(local_summary(events));
        }

        let mut descriptions = String::new();
        for (i, event) in events.iter().enumerate() {
            if i >= SUMMARY_EVENT_LIMIT {
                descriptions.push_str(&format!(
                    "\n... and {} more events",
                    events.len() - SUMMARY_EVENT_LIMIT
                ));
                break;
            }
            descriptions.push_str(&format!(
                "\n- [{}] {}: {} (severity: {})",
                event.source, event.category, event.summary, event.severity
            ));
        }

        let prompt = format!(
            "You are a cybersecurity analyst. Summarize these {} security events into a brief \
             executive summary suitable for a business owner.\n\n\
             Events:{}\n\n\
             Provide:\n\
             1. Overall threat assessment (1 sentence)\n\
             2. Key findings (2-3 bullet points)\n\
             3. Priority actions (2-3 bullet points)\n\n\
             Keep it concise and actionable.",
            events.len(),
            descriptions
        );

        self.call(&prompt).await
    }

    async fn call(&self, prompt: &str) -> Result<String> {
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(API_URL)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!("API error (status {}): {}", status, body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)?;
        parsed
            .content
            .first()
            .map(|c| c.text.clone())
            .ok_or_else(|| anyhow!("empty response from API"))
    }
}

fn local_explanation(event: &Event) -> String {
    match event.category.as_str() {
        "auth_failure" => format!(
            "A failed authentication attempt was detected from {}. This could indicate a brute \
             force attack or unauthorized access attempt. Monitor for repeated failures and \
             consider implementing rate limiting.",
            event.source
        ),
        "auth_brute_force" => format!(
            "Multiple repeated authentication failures detected, suggesting a brute force attack. \
             This is a {} severity event. Immediately review access logs, block the source IP, \
             and consider enabling account lockout policies.",
            event.severity
        ),
        "port_scan" => "Port scanning activity detected, which is often a precursor to an attack. \
             An external entity is probing your network for open services. Review firewall rules \
             and ensure only necessary ports are exposed."
            .to_string(),
        "suspicious_port" => "A connection to a port commonly associated with malicious activity \
             was detected. This may indicate malware communication or a compromised system. \
             Investigate the source system immediately and check for malware."
            .to_string(),
        "misconfiguration" => format!(
            "A cloud resource misconfiguration was found in {}. Misconfigurations are a leading \
             cause of data breaches. Review and remediate the identified issue promptly.",
            event.source
        ),
        "web_error" => "Multiple web server errors detected, indicating potential service \
             degradation. This could be caused by an attack, misconfiguration, or resource \
             exhaustion. Check server logs and resource utilization."
            .to_string(),
        "high_traffic" => "Unusually high network traffic volume detected. This could indicate a \
             DDoS attack, data exfiltration, or legitimate traffic spike. Monitor traffic \
             patterns and investigate the source."
            .to_string(),
        _ => format!(
            "Security event detected: {} (category: {}, severity: {}). Review the event details \
             and take appropriate action based on your security policies.",
            event.summary, event.category, event.severity
        ),
    }
}

fn local_summary(events: &[Event]) -> String {
    if events.is_empty() {
        return "No security events to summarize.".to_string();
    }

    let mut severity_counts: std::collections::HashMap<&str, usize> = Default::default();
    let mut category_counts: std::collections::BTreeMap<String, usize> = Default::default();

    for event in events {
        *severity_counts.entry(event.severity.as_str()).or_insert(0) += 1;
        *category_counts
            .entry(event.category.as_str().to_string())
            .or_insert(0) += 1;
    }

    let mut summary = format!("Security Summary: {} events detected. ", events.len());

    if let Some(critical) = severity_counts.get("critical") {
        summary.push_str(&format!(
            "{} critical events require immediate attention. ",
            critical
        ));
    }
    if let Some(high) = severity_counts.get("high") {
        summary.push_str(&format!(
            "{} high severity events should be investigated. ",
            high
        ));
    }

    summary.push_str("Categories: ");
    for (category, count) in &category_counts {
        summary.push_str(&format!("{} ({}), ", category, count));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Category, Severity};

    fn event(category: Category, severity: Severity) -> Event {
        Event::new("network", category, severity, "test summary")
    }

    #[tokio::test]
    async fn test_local_fallback_without_key() {
        let provider = AnthropicProvider::new("", "");
        assert!(!provider.is_remote());
        assert_eq!(provider.model(), DEFAULT_MODEL);

        let text = provider
            .explain(&event(Category::PortScan, Severity::High), "")
            .await
            .unwrap();
        assert!(text.contains("Port scanning activity detected"));
    }

    #[tokio::test]
    async fn test_local_explanations_keyed_by_category() {
        let provider = AnthropicProvider::new("", "");

        let brute = provider
            .explain(&event(Category::AuthBruteForce, Severity::High), "")
            .await
            .unwrap();
        assert!(brute.contains("brute force attack"));
        assert!(brute.contains("high severity"));

        let unknown = provider
            .explain(&event(Category::Other("dns_tunnel".into()), Severity::Low), "")
            .await
            .unwrap();
        assert!(unknown.contains("dns_tunnel"));
    }

    #[tokio::test]
    async fn test_local_summary_counts() {
        let provider = AnthropicProvider::new("", "");

        let events = vec![
            event(Category::PortScan, Severity::Critical),
            event(Category::PortScan, Severity::High),
            event(Category::WebError, Severity::Medium),
        ];
        let summary = provider.summarize(&events).await.unwrap();
        assert!(summary.contains("3 events detected"));
        assert!(summary.contains("1 critical events"));
        assert!(summary.contains("1 high severity"));
        assert!(summary.contains("port_scan (2)"));

        let empty = provider.summarize(&[]).await.unwrap();
        assert_eq!(empty, "No security events to summarize.");
    }
}
