//! Outage and recovery notifications
//!
//! Delivery is best-effort per recipient: `broadcast` calls the notifier once
//! per recipient and collects failures without aborting the batch.

use crate::config::NotifyConfig;
use crate::fleet::Server;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Transport(String),

    #[error("delivery rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Delivers one message to one recipient
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, recipient: &str, text: &str) -> Result<(), NotifyError>;
}

/// Who receives fleet notifications
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn recipients(&self) -> Result<Vec<String>, NotifyError>;
}

/// Fixed recipient list from configuration
pub struct StaticRecipients {
    recipients: Vec<String>,
}

impl StaticRecipients {
    pub fn new(recipients: Vec<String>) -> Self {
        Self { recipients }
    }
}

#[async_trait]
impl RecipientDirectory for StaticRecipients {
    async fn recipients(&self) -> Result<Vec<String>, NotifyError> {
        Ok(self.recipients.clone())
    }
}

/// Upper bound on one delivery attempt
pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

fn delivery_client(timeout: Duration) -> reqwest::Client {
    match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Failed to build notification HTTP client, using default");
            reqwest::Client::new()
        }
    }
}

async fn check_response(response: reqwest::Response) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Rejected {
        status: status.as_u16(),
        body: body.chars().take(200).collect(),
    })
}

/// POSTs `{recipient, text}` as JSON to a fixed URL
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    recipient: &'a str,
    text: &'a str,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DELIVERY_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: delivery_client(timeout),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { recipient, text })
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        check_response(response).await
    }
}

/// Sends through the Telegram Bot API (`sendMessage`)
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

impl TelegramNotifier {
    pub fn new(bot_token: impl Into<String>) -> Self {
        Self::with_api_base("https://api.telegram.org", bot_token)
    }

    pub fn with_api_base(api_base: impl Into<String>, bot_token: impl Into<String>) -> Self {
        Self {
            client: delivery_client(DELIVERY_TIMEOUT),
            api_base: api_base.into(),
            bot_token: bot_token.into(),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn deliver(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        );
        let response = self
            .client
            .post(url)
            .json(&SendMessage {
                chat_id: recipient,
                text,
            })
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.without_url().to_string()))?;
        check_response(response).await
    }
}

/// Logs notifications instead of delivering them
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        info!(recipient = %recipient, text = %text, "notification (no delivery channel configured)");
        Ok(())
    }
}

/// Pick the delivery channel: Telegram, then webhook, then log only
pub fn notifier_from_config(config: &NotifyConfig) -> Arc<dyn Notifier> {
    if let Some(token) = &config.telegram_bot_token {
        info!("notifications via Telegram bot");
        return Arc::new(TelegramNotifier::new(token.clone()));
    }
    if let Some(url) = &config.webhook_url {
        info!(url = %url, "notifications via webhook");
        return Arc::new(WebhookNotifier::new(url.clone()));
    }
    warn!("no notification channel configured, notifications are only logged");
    Arc::new(LogNotifier)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Recipients whose delivery failed
    pub failed: Vec<String>,
}

/// Deliver `text` to every recipient, one at a time
pub async fn broadcast(notifier: &dyn Notifier, recipients: &[String], text: &str) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    for recipient in recipients {
        match notifier.deliver(recipient, text).await {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(recipient = %recipient, error = %e, "notification delivery failed");
                report.failed.push(recipient.clone());
            }
        }
    }
    report
}

/// Outage alert naming the alternatives
pub fn alert_message(server: &Server, others: &[Server]) -> String {
    let alternatives = if others.is_empty() {
        "no other servers".to_string()
    } else {
        others
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "⚠️ Server {} has connection problems. Use other servers: {}",
        server.name, alternatives
    )
}

pub fn recovery_message(server: &Server) -> String {
    format!("✅ Server {} is back online", server.name)
}

/// Records every delivery; recipients in `fail_for` fail
#[cfg(test)]
pub struct RecordingNotifier {
    sent: std::sync::Mutex<Vec<(String, String)>>,
    fail_for: std::collections::HashSet<String>,
    delay: Option<std::time::Duration>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            sent: std::sync::Mutex::new(Vec::new()),
            fail_for: std::collections::HashSet::new(),
            delay: None,
        }
    }

    pub fn failing_for(mut self, recipient: &str) -> Self {
        self.fail_for.insert(recipient.to_string());
        self
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Messages containing `needle`, one entry per recipient
    pub fn count_containing(&self, needle: &str) -> usize {
        self.sent().iter().filter(|(_, text)| text.contains(needle)).count()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, recipient: &str, text: &str) -> Result<(), NotifyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_for.contains(recipient) {
            return Err(NotifyError::Transport("chat not found".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.to_string(), text.to_string()));
        Ok(())
    }
}
