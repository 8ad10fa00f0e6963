use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

use super::{IncomingChat, TelegramApi};
use crate::model::{Recipient, State};
use crate::pipeline::RecipientResolver;

/// Keeps the subscriber list in [`State`] up to date.
pub struct RecipientManager {
    api: Arc<dyn TelegramApi>,
    auto_subscribe: bool,
}

impl RecipientManager {
    pub fn new(api: Arc<dyn TelegramApi>, auto_subscribe: bool) -> Self {
        Self { api, auto_subscribe }
    }
}

fn display_name(chat: &IncomingChat) -> String {
    let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    if let Some(name) = non_empty(&chat.username)
        .or_else(|| non_empty(&chat.sender_username))
        .or_else(|| non_empty(&chat.title))
    {
        return name;
    }
    let full = format!(
        "{} {}",
        chat.first_name.as_deref().unwrap_or_default(),
        chat.last_name.as_deref().unwrap_or_default()
    );
    match full.trim() {
        "" => format!("chat-{}", chat.id),
        name => name.to_string(),
    }
}

#[async_trait]
impl RecipientResolver for RecipientManager {
    #[instrument(skip_all, fields(auto_subscribe = self.auto_subscribe))]
    async fn resolve(&self, state: &mut State) -> Result<Vec<Recipient>> {
        let mut by_chat: BTreeMap<String, Recipient> = state
            .recipients
            .iter()
            .filter(|r| !r.chat_id.trim().is_empty())
            .map(|r| (r.chat_id.clone(), r.clone()))
            .collect();

        if self.auto_subscribe {
            let offset = state.telegram.last_update_id + 1;
            let updates = self.api.get_updates(offset).await.context("get updates")?;
            let mut max_id = state.telegram.last_update_id;
            let now = Utc::now();
            for update in updates {
                max_id = max_id.max(update.update_id);
                let Some(chat) = update.chat.filter(|c| c.id != 0) else {
                    continue;
                };
                let chat_id = chat.id.to_string();
                if !by_chat.contains_key(&chat_id) {
                    info!(chat_id = %chat_id, "new subscriber");
                }
                by_chat.insert(
                    chat_id.clone(),
                    Recipient {
                        name: display_name(&chat),
                        chat_id,
                        updated_at: now,
                    },
                );
            }
            state.telegram.last_update_id = max_id;
        }

        let mut recipients: Vec<Recipient> = by_chat.into_values().collect();
        recipients.sort_by(|a, b| a.name.cmp(&b.name));
        state.recipients = recipients.clone();
        info!(count = recipients.len(), "recipients resolved");
        Ok(recipients)
    }
}
