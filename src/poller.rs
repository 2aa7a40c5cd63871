use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{PollerConfig, SourceConfig};
use crate::platform::{MessageSource, SourceMessage};
use crate::relay::{escape_for_log, Relay};

/// Polls the watched channel and hands every unseen message to the relay.
///
/// Only the newest `poll_limit` messages are looked at per tick, so a burst
/// of more than `poll_limit` posts between two ticks loses the oldest ones.
pub struct Poller {
    source: Arc<dyn MessageSource>,
    relay: Arc<Relay>,
    channel_id: i64,
    poll_interval: Duration,
    poll_limit: usize,
    processed_ids: HashSet<i64>,
}

impl Poller {
    pub fn new(
        source: Arc<dyn MessageSource>,
        relay: Arc<Relay>,
        source_config: &SourceConfig,
        poller_config: &PollerConfig,
    ) -> Self {
        Self {
            source,
            relay,
            channel_id: source_config.channel_id,
            poll_interval: Duration::from_millis(poller_config.poll_interval_ms),
            poll_limit: poller_config.poll_limit,
            processed_ids: HashSet::new(),
        }
    }

    pub fn is_processed(&self, id: i64) -> bool {
        self.processed_ids.contains(&id)
    }

    pub fn processed_count(&self) -> usize {
        self.processed_ids.len()
    }

    /// Display name of the watched channel, or "unknown" if it can't be resolved.
    pub async fn channel_name(&self) -> String {
        match self.source.get_entity(self.channel_id).await {
            Ok(info) => info.name,
            Err(e) => {
                error!("Failed to resolve channel name: {:#}", e);
                "unknown".to_string()
            }
        }
    }

    /// Seed the dedup set with the current window so history is not replayed.
    pub async fn initialize(&mut self) -> Result<()> {
        debug!(
            "Initialization: fetching the last {} messages",
            self.poll_limit
        );

        let messages = self
            .source
            .get_messages(self.channel_id, self.poll_limit)
            .await
            .context("Failed to fetch the initial message window")?;

        match (messages.last(), messages.first()) {
            (Some(oldest), Some(newest)) => {
                self.processed_ids.extend(messages.iter().map(|m| m.id));
                info!(
                    "Initialization: recorded {} message ids ({} to {})",
                    messages.len(),
                    oldest.id,
                    newest.id
                );
            }
            _ => info!("Initialization: channel is empty"),
        }

        Ok(())
    }

    /// Fetch the current window and relay whatever is new, oldest first.
    /// Returns the ids that were newly marked as processed.
    pub async fn poll_once(&mut self) -> Result<Vec<i64>> {
        debug!("Polling: fetching the last {} messages", self.poll_limit);

        let messages = self
            .source
            .get_messages(self.channel_id, self.poll_limit)
            .await
            .context("Failed to fetch messages")?;

        if messages.is_empty() {
            debug!("Polling: channel is empty");
            return Ok(Vec::new());
        }

        debug!(
            "Polling: fetched {} messages, ids: {:?}",
            messages.len(),
            messages.iter().map(|m| m.id).collect::<Vec<_>>()
        );

        let mut new_messages: Vec<SourceMessage> = messages
            .into_iter()
            .filter(|m| !self.is_processed(m.id))
            .collect();

        if new_messages.is_empty() {
            debug!("Polling: no new messages");
            return Ok(Vec::new());
        }

        // Ids grow with age, so ascending id order is oldest first even if
        // the window arrives out of order.
        new_messages.sort_by_key(|m| m.id);
        let new_ids: Vec<i64> = new_messages.iter().map(|m| m.id).collect();
        debug!(
            "Polling: found {} new messages, ids: {:?}",
            new_ids.len(),
            new_ids
        );

        for message in &new_messages {
            // Marked before relaying: an interrupted relay is never repeated.
            if !self.processed_ids.insert(message.id) {
                continue;
            }
            self.handle_message(message).await;
        }

        Ok(new_ids)
    }

    async fn handle_message(&self, message: &SourceMessage) {
        let text = match message.text.as_deref() {
            Some(text) if !text.is_empty() => text,
            _ => {
                debug!("Message {} has no text, skipping", message.id);
                return;
            }
        };

        info!(
            "New message [channel={}, id={}, posted {}]: {}",
            message.channel_id,
            message.id,
            message.date.format("%Y-%m-%d %H:%M:%S"),
            escape_for_log(text)
        );

        let result = self.relay.deliver(text).await;
        info!("Relay finished for message {}: {}", message.id, result);
    }

    async fn tick(&mut self) -> Result<Vec<i64>> {
        tokio::time::sleep(self.poll_interval).await;
        self.poll_once().await
    }

    /// Poll until `cancel` fires. A failed tick is logged and the next one
    /// runs as usual; cancellation drops whatever tick is in progress.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.tick() => {
                    if let Err(e) = result {
                        error!("Poll failed: {:#}", e);
                    }
                }
            }
        }

        info!("Poller stopped ({} message ids tracked)", self.processed_count());
    }
}
