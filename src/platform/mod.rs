pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A message fetched from the watched channel
#[derive(Debug, Clone)]
pub struct SourceMessage {
    /// Identifier assigned by the source, increasing and never reused
    pub id: i64,
    /// The message text; `None` for media-only posts
    pub text: Option<String>,
    /// Channel the message was posted to
    pub channel_id: i64,
    pub date: DateTime<Utc>,
}

/// Display information for the watched channel
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub name: String,
}

/// Errors from a single outbound delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The delivery service rejected the request.
    #[error("API error: {0}")]
    Api(String),

    /// Anything else: network, decoding, closed session.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Where relayed messages come from
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn get_entity(&self, channel_id: i64) -> Result<ChannelInfo>;

    /// The most recent `limit` messages of the channel, newest first
    async fn get_messages(&self, channel_id: i64, limit: usize) -> Result<Vec<SourceMessage>>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self);
}

/// Where relayed messages go
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send_message(&self, recipient_id: i64, text: &str) -> Result<(), DeliveryError>;

    async fn close(&self);
}
