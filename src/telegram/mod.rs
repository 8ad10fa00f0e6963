//! Telegram Bot API access: delivery and subscriber discovery.
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use teloxide::payloads::{GetUpdatesSetters, SendMessageSetters};
use teloxide::prelude::*;
use teloxide::types::{ParseMode, UpdateKind};
use teloxide::RequestError;
use thiserror::Error;
use tracing::debug;

pub mod recipients;
pub mod sender;

pub use recipients::RecipientManager;
pub use sender::TelegramSender;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Retrying cannot help (chat not found, bot blocked, bad request).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
    #[error("retryable delivery failure: {0}")]
    Retryable(String),
    /// Flood control: the server named how long to back off.
    #[error("rate limited by telegram; retry after {0:?}")]
    RetryAfter(Duration),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Retryable(_) | DeliveryError::RetryAfter(_))
    }
}

/// The chat a message arrived from, flattened out of a `getUpdates` entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingChat {
    pub id: i64,
    pub username: Option<String>,
    pub sender_username: Option<String>,
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingUpdate {
    pub update_id: i64,
    /// None for updates that are not plain messages.
    pub chat: Option<IncomingChat>,
}

#[async_trait]
pub trait TelegramApi: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError>;
    async fn get_updates(&self, offset: i64) -> Result<Vec<IncomingUpdate>>;
}

#[derive(Clone)]
pub struct TeloxideApi {
    bot: Bot,
}

impl TeloxideApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }
}

fn classify(err: RequestError) -> DeliveryError {
    match err {
        RequestError::Api(api) => DeliveryError::Permanent(api.to_string()),
        RequestError::MigrateToChatId(id) => {
            DeliveryError::Permanent(format!("group migrated to supergroup {id}"))
        }
        RequestError::RetryAfter(secs) => DeliveryError::RetryAfter(secs.duration()),
        other => DeliveryError::Retryable(other.to_string()),
    }
}

#[async_trait]
impl TelegramApi for TeloxideApi {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
        let id: i64 = chat_id
            .trim()
            .parse()
            .map_err(|_| DeliveryError::Permanent(format!("invalid chat id {chat_id:?}")))?;
        #[allow(deprecated)]
        let mode = ParseMode::Markdown;
        self.bot
            .send_message(ChatId(id), text)
            .parse_mode(mode)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<IncomingUpdate>> {
        let offset = i32::try_from(offset)?;
        let updates = self.bot.get_updates().offset(offset).timeout(0).await?;
        debug!(count = updates.len(), "fetched telegram updates");
        Ok(updates
            .into_iter()
            .map(|update| {
                let chat = match &update.kind {
                    UpdateKind::Message(msg) => Some(IncomingChat {
                        id: msg.chat.id.0,
                        username: msg.chat.username().map(str::to_string),
                        sender_username: msg.from().and_then(|u| u.username.clone()),
                        title: msg.chat.title().map(str::to_string),
                        first_name: msg.chat.first_name().map(str::to_string),
                        last_name: msg.chat.last_name().map(str::to_string),
                    }),
                    _ => None,
                };
                IncomingUpdate {
                    update_id: i64::from(update.id.0),
                    chat,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::Seconds;

    #[test]
    fn flood_control_keeps_the_server_wait() {
        let err = classify(RequestError::RetryAfter(Seconds::from_seconds(17)));
        assert_eq!(err, DeliveryError::RetryAfter(Duration::from_secs(17)));
        assert!(err.is_retryable());
        assert!(!DeliveryError::Permanent("chat not found".into()).is_retryable());
    }
}
