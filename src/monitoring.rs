// src/monitoring.rs

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("no alert webhook configured")]
    NotConfigured,

    #[error("alert webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("alert webhook responded with status {0}")]
    Status(u16),
}

/// Sink for operator alerts such as analyzer panics.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, message: &str) -> Result<(), AlertError>;
}

/// Posts alerts to a Slack-compatible incoming webhook as `{"text": ...}`.
pub struct SlackWebhookAlerter {
    url: Option<String>,
    client: reqwest::Client,
}

impl SlackWebhookAlerter {
    pub fn new(url: Option<String>) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Alerter for SlackWebhookAlerter {
    async fn alert(&self, message: &str) -> Result<(), AlertError> {
        let url = self.url.as_deref().ok_or(AlertError::NotConfigured)?;
        let response = self
            .client
            .post(url)
            .json(&json!({ "text": message }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status(status.as_u16()));
        }
        debug!("Alert delivered.");
        Ok(())
    }
}

/// Drops every alert.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAlerter;

#[async_trait]
impl Alerter for NoopAlerter {
    async fn alert(&self, _message: &str) -> Result<(), AlertError> {
        Ok(())
    }
}
