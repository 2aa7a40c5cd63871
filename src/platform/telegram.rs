use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, Update, UpdateKind};
use teloxide::RequestError;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::platform::{ChannelInfo, DeliveryChannel, DeliveryError, MessageSource, SourceMessage};

/// Channel posts remembered for the watched channel. The Bot API has no
/// "read history" call, so the window served by `get_messages` is built from
/// `channel_post` updates.
pub const HISTORY_CAPACITY: usize = 100;

/// Largest batch `getUpdates` hands out per call
const UPDATES_PAGE: u8 = 100;

/// Posts of the watched channel, oldest first
#[derive(Debug, Default)]
struct History {
    posts: VecDeque<SourceMessage>,
}

impl History {
    fn push(&mut self, message: SourceMessage) {
        if self.posts.iter().any(|m| m.id == message.id) {
            return;
        }
        self.posts.push_back(message);
        while self.posts.len() > HISTORY_CAPACITY {
            self.posts.pop_front();
        }
    }

    /// Newest `limit` posts, newest first
    fn latest(&self, limit: usize) -> Vec<SourceMessage> {
        self.posts.iter().rev().take(limit).cloned().collect()
    }
}

#[derive(Default)]
struct UpdateState {
    offset: i32,
    history: History,
}

/// Reads a channel through a bot that is a member of it
pub struct TelegramSource {
    bot: Bot,
    channel_id: i64,
    state: Mutex<UpdateState>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl TelegramSource {
    /// Authorize with the source bot token. Failure here is fatal at startup.
    pub async fn connect(credentials: &str, channel_id: i64) -> Result<Self> {
        let bot = Bot::new(credentials);
        let me = bot
            .get_me()
            .await
            .context("Failed to authorize the source bot")?;
        info!("Source bot authorized (id {})", me.id.0);

        Ok(Self::with_bot(bot, channel_id))
    }

    /// Watch `channel_id` with an already configured bot.
    pub fn with_bot(bot: Bot, channel_id: i64) -> Self {
        Self {
            bot,
            channel_id,
            state: Mutex::new(UpdateState::default()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    async fn fetch_page(&self, offset: i32) -> Result<Vec<Update>> {
        match self
            .bot
            .get_updates()
            .offset(offset)
            .limit(UPDATES_PAGE)
            .timeout(0)
            .allowed_updates(vec![AllowedUpdate::ChannelPost])
            .await
        {
            Ok(updates) => {
                self.set_connected(true);
                Ok(updates)
            }
            Err(e) => {
                self.set_connected(false);
                Err(e).context("Failed to fetch channel updates")
            }
        }
    }

    /// Drain every pending page so the history ends at the newest post.
    async fn drain_updates(&self, state: &mut UpdateState) -> Result<()> {
        loop {
            let updates = self.fetch_page(state.offset).await?;
            let page_len = updates.len();

            for update in updates {
                state.offset = (update.id.0 as i32).wrapping_add(1);

                let UpdateKind::ChannelPost(post) = update.kind else {
                    continue;
                };
                let chat_id = post.chat.id.0;
                if chat_id != self.channel_id {
                    debug!("Ignoring post {} from unwatched chat {}", post.id.0, chat_id);
                    continue;
                }
                debug!("Channel post {} in {}", post.id.0, chat_id);
                state.history.push(SourceMessage {
                    id: i64::from(post.id.0),
                    text: post.text().map(str::to_owned),
                    channel_id: chat_id,
                    date: post.date,
                });
            }

            if page_len < usize::from(UPDATES_PAGE) {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl MessageSource for TelegramSource {
    async fn get_entity(&self, channel_id: i64) -> Result<ChannelInfo> {
        let chat = self
            .bot
            .get_chat(ChatId(channel_id))
            .await
            .with_context(|| format!("Failed to resolve channel {}", channel_id))?;

        let name = chat
            .title()
            .or_else(|| chat.username())
            .or_else(|| chat.first_name())
            .unwrap_or("unknown")
            .to_string();

        Ok(ChannelInfo { name })
    }

    async fn get_messages(&self, channel_id: i64, limit: usize) -> Result<Vec<SourceMessage>> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("Source connection is closed");
        }
        if channel_id != self.channel_id {
            anyhow::bail!(
                "Channel {} is not watched (watching {})",
                channel_id,
                self.channel_id
            );
        }

        let mut state = self.state.lock().await;
        self.drain_updates(&mut state).await?;

        Ok(state.history.latest(limit))
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_connected(false);
        info!("Source connection closed");
    }
}

/// Sends relayed messages from the delivery bot
pub struct TelegramDelivery {
    bot: Bot,
    closed: AtomicBool,
}

impl TelegramDelivery {
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
            closed: AtomicBool::new(false),
        }
    }
}

fn classify(err: RequestError) -> DeliveryError {
    match err {
        RequestError::Api(api) => DeliveryError::Api(api.to_string()),
        other => DeliveryError::Transport(anyhow::Error::new(other).context("sendMessage failed")),
    }
}

#[async_trait]
impl DeliveryChannel for TelegramDelivery {
    async fn send_message(&self, recipient_id: i64, text: &str) -> Result<(), DeliveryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("Delivery session is closed").into());
        }

        self.bot
            .send_message(ChatId(recipient_id), text)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!("Delivery session already closed");
            return;
        }
        info!("Delivery session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Value};
    use teloxide::ApiError;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    const WATCHED: i64 = -100;

    fn post(id: i64) -> SourceMessage {
        SourceMessage {
            id,
            text: Some(format!("post {}", id)),
            channel_id: -100,
            date: Utc::now(),
        }
    }

    #[test]
    fn test_history_latest_is_newest_first() {
        let mut history = History::default();
        for id in 1..=5 {
            history.push(post(id));
        }
        let ids: Vec<i64> = history.latest(3).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history = History::default();
        for id in 1..=(HISTORY_CAPACITY as i64 + 5) {
            history.push(post(id));
        }
        assert_eq!(history.posts.len(), HISTORY_CAPACITY);
        assert_eq!(history.posts.front().map(|m| m.id), Some(6));
    }

    #[test]
    fn test_history_ignores_repeated_post() {
        let mut history = History::default();
        history.push(post(1));
        history.push(post(1));
        assert_eq!(history.latest(10).len(), 1);
    }

    #[test]
    fn test_api_errors_are_classified() {
        let err = classify(RequestError::Api(ApiError::BotBlocked));
        assert!(matches!(err, DeliveryError::Api(_)));
    }

    #[tokio::test]
    async fn test_closed_delivery_rejects_sends() {
        let delivery = TelegramDelivery::new("123:fake");
        delivery.close().await;
        let err = delivery.send_message(1, "hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));
    }

    fn channel_post(update_id: i64, chat_id: i64) -> Value {
        json!({
            "update_id": update_id,
            "channel_post": {
                "message_id": update_id,
                "date": 1_700_000_000,
                "chat": {"id": chat_id, "type": "channel", "title": "News"},
                "text": format!("post {}", update_id)
            }
        })
    }

    async fn mount_page(server: &MockServer, offset: i64, updates: Vec<Value>) {
        Mock::given(matchers::method("POST"))
            .and(matchers::path_regex(r"(?i)/bot.*/getUpdates"))
            .and(matchers::body_partial_json(json!({ "offset": offset })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": updates})),
            )
            .mount(server)
            .await;
    }

    fn source_for_mock(server: &MockServer) -> TelegramSource {
        let url = reqwest::Url::parse(&server.uri()).unwrap();
        TelegramSource::with_bot(Bot::new("test-token").set_api_url(url), WATCHED)
    }

    #[tokio::test]
    async fn test_backlog_window_ends_at_newest_post() {
        let server = MockServer::start().await;
        mount_page(&server, 0, (1..=100).map(|id| channel_post(id, WATCHED)).collect()).await;
        mount_page(&server, 101, (101..=200).map(|id| channel_post(id, WATCHED)).collect()).await;
        mount_page(&server, 201, vec![]).await;

        let source = source_for_mock(&server);

        let first: Vec<i64> = source
            .get_messages(WATCHED, 10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(first, (191..=200).rev().collect::<Vec<_>>());

        let second: Vec<i64> = source
            .get_messages(WATCHED, 10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(second, first);
        assert!(source.is_connected());
    }

    #[tokio::test]
    async fn test_posts_from_other_chats_are_dropped() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            0,
            vec![
                channel_post(1, WATCHED),
                channel_post(2, -200),
                channel_post(3, WATCHED),
            ],
        )
        .await;
        mount_page(&server, 4, vec![]).await;

        let source = source_for_mock(&server);

        let ids: Vec<i64> = source
            .get_messages(WATCHED, 10)
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![3, 1]);
        assert!(source.get_messages(-200, 10).await.is_err());
    }
}
