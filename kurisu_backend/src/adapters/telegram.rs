//! Telegram front-end.
//!
//! When `TELEGRAM_BOT_TOKEN` is set, long-polls `getUpdates`, publishes messages
//! from whitelisted creators onto the inbound topic, and sends replies for
//! envelopes it originated back to the chat they came from.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::task::JoinHandle;

use super::replies_for;
use crate::bus::{Handler, MessageBus};
use crate::config::KurisuConfig;
use crate::http_client::build_http_client;
use crate::message::{Content, Envelope, Sender};

pub const TELEGRAM_ORIGIN: &str = "telegram";

// Telegram enforces a 4096-character limit per message.
const MAX_MESSAGE_CHARS: usize = 4096;
const POLL_TIMEOUT_SECS: u64 = 30;

// ─── Telegram API types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    from: Option<TelegramUser>,
    text: Option<String>,
    #[serde(default)]
    photo: Vec<PhotoSize>,
    voice: Option<Voice>,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
    username: Option<String>,
}

#[derive(Deserialize)]
struct PhotoSize {
    file_id: String,
    #[serde(default)]
    file_size: Option<i64>,
}

#[derive(Deserialize)]
struct Voice {
    file_id: String,
}

#[derive(Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
}

/// What a whitelisted update asks the adapter to publish.
#[derive(Debug, PartialEq, Eq)]
enum Inbound {
    Text(String),
    Photo(String),
    Voice(String),
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct TelegramAdapter {
    api_base: String,
    file_base: String,
    client: reqwest::Client,
    bus: MessageBus,
    creator_ids: Vec<i64>,
    inbound_topic: String,
    outbound_topic: String,
    reply_listener: Mutex<Option<Handler>>,
}

impl TelegramAdapter {
    /// Build the adapter if `TELEGRAM_BOT_TOKEN` is set and at least one creator is whitelisted.
    pub fn from_env(bus: MessageBus, config: &KurisuConfig) -> Result<Option<Arc<Self>>> {
        let token = match std::env::var("TELEGRAM_BOT_TOKEN") {
            Ok(t) if !t.trim().is_empty() => t.trim().to_string(),
            _ => return Ok(None),
        };
        if config.telegram.creator_id.is_empty() {
            tracing::warn!("TELEGRAM_BOT_TOKEN is set but no creator_id is whitelisted; Telegram stays off");
            return Ok(None);
        }
        Ok(Some(Arc::new(Self::new(&token, bus, config)?)))
    }

    pub fn new(token: &str, bus: MessageBus, config: &KurisuConfig) -> Result<Self> {
        let timeout = std::time::Duration::from_secs(POLL_TIMEOUT_SECS + 15);
        Ok(Self {
            api_base: format!("https://api.telegram.org/bot{}", token),
            file_base: format!("https://api.telegram.org/file/bot{}", token),
            client: build_http_client(timeout).context("Telegram HTTP client")?,
            bus,
            creator_ids: config.telegram.creator_id.clone(),
            inbound_topic: config.inbound_topic.clone(),
            outbound_topic: config.outbound_topic.clone(),
            reply_listener: Mutex::new(None),
        })
    }

    /// Subscribe to replies and start the polling task on the current runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        self.attach_replies();
        let adapter = self.clone();
        tokio::spawn(async move {
            tracing::info!("Telegram bot active (creators: {:?})", adapter.creator_ids);
            adapter.run().await;
        })
    }

    pub fn detach(&self) {
        let listener = match self.reply_listener.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(listener) = listener {
            self.bus.unsubscribe(&self.outbound_topic, &listener);
        }
    }

    fn attach_replies(self: &Arc<Self>) {
        let adapter = Arc::downgrade(self);
        let listener = replies_for(TELEGRAM_ORIGIN, move |envelope: Envelope| {
            let adapter = adapter.clone();
            async move {
                let Some(adapter) = adapter.upgrade() else {
                    return anyhow::Ok(());
                };
                let chat_id: i64 = envelope
                    .sender
                    .id
                    .parse()
                    .with_context(|| format!("Bad Telegram chat id '{}'", envelope.sender.id))?;
                let reply = envelope.response().unwrap_or_default();
                if !reply.trim().is_empty() {
                    adapter.send_message(chat_id, reply).await;
                }
                anyhow::Ok(())
            }
        });

        self.bus.subscribe(&self.outbound_topic, listener.clone());
        if let Ok(mut slot) = self.reply_listener.lock() {
            *slot = Some(listener);
        }
    }

    async fn run(&self) {
        let mut offset: i64 = 0;
        loop {
            let updates = match self.poll_updates(offset).await {
                Some(u) => u,
                None => continue,
            };

            for update in updates {
                offset = update.update_id + 1;
                let Some(msg) = update.message else {
                    continue;
                };
                let chat_id = msg.chat.id;
                let sender = sender_of(&msg);

                let Some(inbound) = self.classify(msg) else {
                    continue;
                };
                let content = match inbound {
                    Inbound::Text(text) => {
                        tracing::info!("Telegram [chat {}]: {:?}", chat_id, text);
                        Content::Text(text)
                    }
                    Inbound::Photo(file_id) => match self.download_file(&file_id).await {
                        Some(bytes) => Content::Photo(bytes),
                        None => continue,
                    },
                    Inbound::Voice(file_id) => match self.download_file(&file_id).await {
                        Some(bytes) => Content::Voice(bytes),
                        None => continue,
                    },
                };

                self.send_typing(chat_id).await;
                let envelope = Envelope::new(
                    TELEGRAM_ORIGIN,
                    Sender {
                        id: chat_id.to_string(),
                        name: sender,
                    },
                    content,
                );
                if !self.bus.publish(&self.inbound_topic, envelope) {
                    tracing::warn!("Telegram: nobody listens on '{}'", self.inbound_topic);
                }
            }
        }
    }

    /// Whitelist check and content extraction.
    fn classify(&self, msg: TelegramMessage) -> Option<Inbound> {
        let user_id = msg.from.as_ref().map(|user| user.id);
        if !user_id.map(|id| self.creator_ids.contains(&id)).unwrap_or(false) {
            tracing::debug!(
                "Telegram: ignoring message from non-whitelisted user {:?} in chat {}",
                user_id,
                msg.chat.id
            );
            return None;
        }

        if let Some(text) = msg.text {
            let text = text.trim();
            return (!text.is_empty()).then(|| Inbound::Text(text.to_string()));
        }
        if let Some(voice) = msg.voice {
            return Some(Inbound::Voice(voice.file_id));
        }
        // Telegram lists every resolution; take the largest.
        msg.photo
            .into_iter()
            .max_by_key(|size| size.file_size.unwrap_or(0))
            .map(|size| Inbound::Photo(size.file_id))
    }

    async fn poll_updates(&self, offset: i64) -> Option<Vec<Update>> {
        let url = format!("{}/getUpdates", self.api_base);
        let params = serde_json::json!({
            "offset": offset,
            "timeout": POLL_TIMEOUT_SECS,
            "allowed_updates": ["message"]
        });

        let resp = match self.client.post(&url).json(&params).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                return None;
            }
        };

        let body: TelegramResponse<Vec<Update>> = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Telegram getUpdates parse error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                return None;
            }
        };

        if !body.ok {
            tracing::warn!("Telegram API returned ok=false");
            tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
            return None;
        }

        Some(body.result.unwrap_or_default())
    }

    async fn download_file(&self, file_id: &str) -> Option<Vec<u8>> {
        let url = format!("{}/getFile", self.api_base);
        let lookup = async {
            let body: TelegramResponse<TelegramFile> = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "file_id": file_id }))
                .send()
                .await?
                .json()
                .await?;
            let path = body
                .result
                .and_then(|file| file.file_path)
                .ok_or_else(|| anyhow::anyhow!("no file_path for {}", file_id))?;
            let bytes = self
                .client
                .get(format!("{}/{}", self.file_base, path))
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            anyhow::Ok(bytes.to_vec())
        };

        match lookup.await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Telegram file download failed: {}", e);
                None
            }
        }
    }

    async fn send_typing(&self, chat_id: i64) {
        let url = format!("{}/sendChatAction", self.api_base);
        let payload = serde_json::json!({ "chat_id": chat_id, "action": "typing" });
        if let Err(e) = self.client.post(&url).json(&payload).send().await {
            tracing::debug!("Telegram sendChatAction error: {}", e);
        }
    }

    async fn send_message(&self, chat_id: i64, text: &str) {
        let text = truncate_chars(text, MAX_MESSAGE_CHARS);
        let url = format!("{}/sendMessage", self.api_base);
        let payload = serde_json::json!({ "chat_id": chat_id, "text": text });

        match self.client.post(&url).json(&payload).send().await {
            Ok(r) if r.status().is_success() => {
                tracing::debug!("Telegram: sent reply to chat {}", chat_id);
            }
            Ok(r) => {
                tracing::warn!("Telegram sendMessage failed: HTTP {}", r.status());
            }
            Err(e) => {
                tracing::error!("Telegram sendMessage error: {}", e);
            }
        }
    }
}

fn sender_of(msg: &TelegramMessage) -> String {
    msg.from
        .as_ref()
        .map(|user| user.username.clone().unwrap_or_else(|| user.first_name.clone()))
        .unwrap_or_else(|| msg.chat.id.to_string())
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
