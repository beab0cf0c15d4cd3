//! Slack and webhook alert egress
//!
//! Alerts are fire-and-log: delivery failures are logged and never
//! propagate into remediation or scaling paths. Every configured webhook
//! receives a JSON document; a Slack incoming webhook additionally gets
//! a coloured-attachment message.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, error};

use crate::config::AlertingConfig;

/// HTTP timeout for alert delivery
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Footer shown on Slack attachments
const SLACK_FOOTER: &str = "Node Lifecycle Manager";

/// Alert severity, ordered from informational to page-worthy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine lifecycle events (drain completed, cluster scaled)
    Info,
    /// A node entered remediation
    Warning,
    /// Manual intervention is required
    Critical,
}

impl Severity {
    /// Slack attachment colour for this severity
    fn color(self) -> &'static str {
        match self {
            Severity::Info => "#36a64f",
            Severity::Warning => "#ff9800",
            Severity::Critical => "#f44336",
        }
    }
}

/// One alert to deliver
#[derive(Debug, Clone)]
pub struct Alert {
    /// How urgent the alert is
    pub severity: Severity,
    /// Short headline
    pub title: String,
    /// Human-readable body
    pub message: String,
    /// Routing labels, typically the node or pool involved
    pub labels: BTreeMap<String, String>,
}

impl Alert {
    /// Build an alert with a single label
    pub fn new(
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
        label_key: &str,
        label_value: &str,
    ) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(label_key.to_string(), label_value.to_string());
        Self {
            severity,
            title: title.into(),
            message: message.into(),
            labels,
        }
    }
}

/// JSON document posted to generic webhooks
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    severity: Severity,
    title: &'a str,
    message: &'a str,
    labels: &'a BTreeMap<String, String>,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct SlackMessage {
    #[serde(skip_serializing_if = "String::is_empty")]
    channel: String,
    attachments: Vec<SlackAttachment>,
}

#[derive(Debug, Serialize)]
struct SlackAttachment {
    color: &'static str,
    title: String,
    text: String,
    footer: &'static str,
    ts: i64,
    fields: Vec<SlackField>,
}

#[derive(Debug, Serialize)]
struct SlackField {
    title: String,
    value: String,
    short: bool,
}

/// Delivers alerts to the configured sinks
pub struct Alerter {
    config: AlertingConfig,
    http: reqwest::Client,
}

impl Alerter {
    /// Build the alerter; with alerting disabled every send is a no-op
    pub fn new(config: AlertingConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { config, http }
    }

    /// Deliver one alert to every configured sink
    ///
    /// Failures are logged; the caller never sees them.
    pub async fn send(&self, alert: Alert) {
        if !self.config.enabled {
            debug!(title = %alert.title, "alerting disabled, dropping alert");
            return;
        }

        let now = Utc::now();

        if !self.config.slack_url.is_empty() {
            let body = slack_message(&alert, &self.config.slack_channel, now);
            if let Err(e) = self.post(&self.config.slack_url, &body).await {
                error!(error = %e, "failed to send slack alert");
            }
        }

        for url in &self.config.webhook_urls {
            let body = webhook_payload(&alert, now);
            if let Err(e) = self.post(url, &body).await {
                error!(url = %url, error = %e, "failed to send webhook alert");
            }
        }
    }

    async fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<(), String> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status().as_u16() >= 400 {
            return Err(format!("bad response: {}", resp.status().as_u16()));
        }
        Ok(())
    }
}

fn webhook_payload(alert: &Alert, now: DateTime<Utc>) -> WebhookPayload<'_> {
    WebhookPayload {
        severity: alert.severity,
        title: &alert.title,
        message: &alert.message,
        labels: &alert.labels,
        timestamp: now.to_rfc3339_opts(SecondsFormat::Secs, true),
    }
}

fn slack_message(alert: &Alert, channel: &str, now: DateTime<Utc>) -> SlackMessage {
    let fields = alert
        .labels
        .iter()
        .map(|(k, v)| SlackField {
            title: k.clone(),
            value: v.clone(),
            short: true,
        })
        .collect();

    SlackMessage {
        channel: channel.to_string(),
        attachments: vec![SlackAttachment {
            color: alert.severity.color(),
            title: alert.title.clone(),
            text: alert.message.clone(),
            footer: SLACK_FOOTER,
            ts: now.timestamp(),
            fields,
        }],
    }
}
