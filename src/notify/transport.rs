//! Channel transports: how a payload actually leaves the process.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::json;
use thiserror::Error;

use super::NotificationPayload;
use crate::db::NotificationChannel;

/// Delivery error types.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("delivery timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Webhook failed ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("unsupported channel type: {0}")]
    Unsupported(String),
    #[error("invalid channel config: {0}")]
    Config(String),
}

/// Delivers one payload to one channel.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn deliver(
        &self,
        channel: &NotificationChannel,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError>;
}

/// HTTP transport for `webhook`, `slack` and `discord` channels.
pub struct WebhookTransport {
    client: reqwest::Client,
}

impl WebhookTransport {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("Waypost-Webhook/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn send(&self, method: Method, url: &str, body: &serde_json::Value) -> Result<(), DeliveryError> {
        let response = self.client.request(method, url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body: text.chars().take(200).collect(),
            });
        }

        tracing::debug!("Webhook sent to {}", url);
        Ok(())
    }
}

fn config_str<'a>(channel: &'a NotificationChannel, key: &str) -> Option<&'a str> {
    channel
        .config
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

fn required<'a>(channel: &'a NotificationChannel, key: &str) -> Result<&'a str, DeliveryError> {
    config_str(channel, key).ok_or_else(|| {
        DeliveryError::Config(format!("{} channel {:?} has no {}", channel.channel_type, channel.name, key))
    })
}

#[async_trait]
impl ChannelTransport for WebhookTransport {
    async fn deliver(
        &self,
        channel: &NotificationChannel,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError> {
        match channel.channel_type.as_str() {
            "webhook" => {
                let url = required(channel, "url")?;
                let method = match config_str(channel, "method") {
                    Some(m) => Method::from_bytes(m.to_uppercase().as_bytes())
                        .map_err(|_| DeliveryError::Config(format!("invalid method {:?}", m)))?,
                    None => Method::POST,
                };
                let body = serde_json::to_value(payload)
                    .map_err(|e| DeliveryError::Config(e.to_string()))?;
                self.send(method, url, &body).await
            }
            "slack" => {
                let url = required(channel, "webhook_url")?;
                self.send(Method::POST, url, &json!({ "text": payload.summary() })).await
            }
            "discord" => {
                let url = required(channel, "webhook_url")?;
                self.send(Method::POST, url, &json!({ "content": payload.summary() })).await
            }
            other => Err(DeliveryError::Unsupported(other.to_string())),
        }
    }
}
