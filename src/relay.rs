use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{DeliveryConfig, RelayConfig};
use crate::platform::{DeliveryChannel, DeliveryError};

/// Longest message preview written to the log
const PREVIEW_CHARS: usize = 100;

/// Outcome of one broadcast. Counts cover the whitelist only; the operator's
/// attempt is made and logged but not tallied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastResult {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

impl fmt::Display for BroadcastResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} success={} failed={}",
            self.total, self.success, self.failed
        )
    }
}

/// Escape newlines so a message body stays on one log line.
pub fn escape_for_log(text: &str) -> String {
    text.replace('\n', "\\n")
}

fn preview(text: &str) -> String {
    escape_for_log(text).chars().take(PREVIEW_CHARS).collect()
}

/// Fans a message out to the operator and every whitelisted recipient
pub struct Relay {
    channel: Arc<dyn DeliveryChannel>,
    operator_id: i64,
    whitelist: Vec<i64>,
    limiter: Semaphore,
}

impl Relay {
    pub fn new(
        channel: Arc<dyn DeliveryChannel>,
        delivery: &DeliveryConfig,
        relay: &RelayConfig,
    ) -> Self {
        Self {
            channel,
            operator_id: delivery.operator_id,
            whitelist: delivery.whitelist_ids.clone(),
            limiter: Semaphore::new(relay.max_concurrent),
        }
    }

    pub fn whitelist_len(&self) -> usize {
        self.whitelist.len()
    }

    pub fn operator_id(&self) -> i64 {
        self.operator_id
    }

    /// Send `text` to every recipient and wait for all attempts to finish.
    pub async fn deliver(&self, text: &str) -> BroadcastResult {
        if text.is_empty() {
            warn!("Broadcast: empty message, nothing sent");
            return BroadcastResult::default();
        }

        if self.whitelist.is_empty() {
            warn!("Broadcast: whitelist is empty, nothing sent");
            return BroadcastResult::default();
        }

        info!(
            "Broadcast: sending \"{}...\" to {} recipients",
            preview(text),
            self.whitelist.len()
        );

        // Operator first, so its outcome is always at index 0.
        let recipients = std::iter::once(self.operator_id).chain(self.whitelist.iter().copied());
        let attempts = recipients.map(|recipient_id| self.send_limited(recipient_id, text));
        let outcomes = join_all(attempts).await;

        let success = outcomes[1..].iter().filter(|ok| **ok).count();
        let result = BroadcastResult {
            total: self.whitelist.len(),
            success,
            failed: self.whitelist.len() - success,
        };

        info!(
            "Broadcast: done. Delivered {}/{}, failed {}",
            result.success, result.total, result.failed
        );
        result
    }

    async fn send_limited(&self, recipient_id: i64, text: &str) -> bool {
        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("Broadcast: {} - limiter unavailable: {}", recipient_id, e);
                return false;
            }
        };
        self.send_one(recipient_id, text).await
    }

    async fn send_one(&self, recipient_id: i64, text: &str) -> bool {
        match self.channel.send_message(recipient_id, text).await {
            Ok(()) => {
                debug!("Broadcast: delivered to {}", recipient_id);
                true
            }
            Err(DeliveryError::Api(description)) => {
                error!("Broadcast: {} - API error: {}", recipient_id, description);
                false
            }
            Err(DeliveryError::Transport(e)) => {
                error!("Broadcast: {} - {:#}", recipient_id, e);
                false
            }
        }
    }
}
