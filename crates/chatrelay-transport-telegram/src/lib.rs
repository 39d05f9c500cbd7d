// SPDX-License-Identifier: Apache-2.0
//! Long-polling ingestion and delivery over the Telegram Bot HTTP API.
//!
//! Telegram's `getUpdates` long-poll is the transport's only ingestion
//! path — no webhook server. [`TelegramTransport::run`] loops forever,
//! advancing its `offset` past every update it has seen (Telegram redelivers
//! anything at or above the last acknowledged `update_id`), and pushes each
//! parsed message onto the channel the caller provides. The offset is
//! written through to the session store on every advance (under the
//! `"telegram"` cursor name), so a process restart resumes polling from the
//! last acknowledged update instead of redelivering or skipping a window.
//! [`TelegramTransport`] also implements [`ChatPort`] directly, so the same
//! value both ingests and delivers.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chatrelay_core::{
    ChatPort, InboundUpdate, OutboundMessage, SessionStoreLike, ThreadFallback, TransportError,
};

/// Telegram enforces this as the hard per-message text limit.
pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

/// Name this transport persists its long-poll offset under, via
/// `SessionStoreLike::get_cursor`/`set_cursor`.
const CURSOR_NAME: &str = "telegram";

pub struct TelegramTransport {
    client: reqwest::Client,
    base_url: String,
    poll_timeout_secs: u64,
    offset: AtomicI64,
    store: Arc<dyn SessionStoreLike>,
}

impl TelegramTransport {
    pub fn new(bot_token: &str, poll_timeout_secs: u64, store: Arc<dyn SessionStoreLike>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            poll_timeout_secs,
            offset: AtomicI64::new(0),
            store,
        }
    }

    /// Run the long-poll loop until `cancel` fires, pushing every received
    /// message onto `tx`. Network errors are logged and retried with a
    /// short backoff rather than aborting the loop, since a transient
    /// connectivity blip must not take the whole worker down.
    pub async fn run(&self, tx: mpsc::Sender<InboundUpdate>, cancel: CancellationToken) {
        let initial_offset = match self.store.get_cursor(CURSOR_NAME).await {
            Ok(cursor) => cursor.unwrap_or(0),
            Err(err) => {
                warn!(error = %err, "failed to load persisted telegram cursor, starting from 0");
                0
            }
        };
        self.offset.store(initial_offset, Ordering::SeqCst);

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let offset = self.offset.load(Ordering::SeqCst);
            let poll = self.get_updates(offset);

            let updates = tokio::select! {
                _ = cancel.cancelled() => return,
                result = poll => result,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        let next_offset = update.update_id + 1;
                        if next_offset > self.offset.load(Ordering::SeqCst) {
                            self.offset.store(next_offset, Ordering::SeqCst);
                            if let Err(err) = self.store.set_cursor(CURSOR_NAME, next_offset).await {
                                warn!(error = %err, "failed to persist telegram cursor");
                            }
                        }
                        if let Some(inbound) = to_inbound(update) {
                            if tx.send(inbound).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "polling telegram getUpdates failed, retrying");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<TgUpdate>, anyhow::Error> {
        let url = format!("{}/getUpdates", self.base_url);
        let response: TgResponse<Vec<TgUpdate>> = self
            .client
            .get(url)
            .query(&[
                ("offset", offset.to_string()),
                ("timeout", self.poll_timeout_secs.to_string()),
            ])
            .timeout(Duration::from_secs(self.poll_timeout_secs + 10))
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            anyhow::bail!(
                "telegram getUpdates error: {}",
                response.description.unwrap_or_default()
            );
        }
        Ok(response.result.unwrap_or_default())
    }
}

#[async_trait]
impl ChatPort for TelegramTransport {
    async fn send(&self, message: OutboundMessage) -> Result<ThreadFallback, TransportError> {
        let sent = self.send_message(&message).await?;
        if sent {
            return Ok(ThreadFallback::Delivered);
        }

        // The only recoverable rejection is an unknown/closed thread; retry
        // once against the chat's root thread (no message_thread_id).
        debug!(chat_id = %message.chat_id, "retrying send against root thread");
        let root_message = OutboundMessage {
            chat_id: message.chat_id.clone(),
            thread_id: None,
            text: message.text.clone(),
        };
        let delivered = self.send_message(&root_message).await?;
        if delivered {
            Ok(ThreadFallback::FellBackToRoot)
        } else {
            Err(TransportError::Request(
                "delivery failed even against the root thread".to_string(),
            ))
        }
    }

    fn max_chunk_len(&self) -> usize {
        TELEGRAM_MAX_MESSAGE_LEN
    }
}

impl TelegramTransport {
    /// Attempt one delivery. Returns `Ok(true)` on success, `Ok(false)` for
    /// the specific "thread not found" rejection (caller decides whether to
    /// retry), and `Err` for any other failure.
    async fn send_message(&self, message: &OutboundMessage) -> Result<bool, TransportError> {
        let url = format!("{}/sendMessage", self.base_url);
        let body = TgSendMessage {
            chat_id: &message.chat_id,
            message_thread_id: message.thread_id.as_deref().and_then(|t| t.parse().ok()),
            text: &message.text,
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| TransportError::Request(err.to_string()))?;

        let status = response.status();
        let parsed: TgResponse<TgMessage> = response
            .json()
            .await
            .map_err(|err| TransportError::Malformed(err.to_string()))?;

        if parsed.ok {
            return Ok(true);
        }

        let description = parsed.description.unwrap_or_default();
        if status.as_u16() == 400 && description.to_lowercase().contains("thread not found") {
            return Ok(false);
        }
        Err(TransportError::Request(description))
    }
}

fn to_inbound(update: TgUpdate) -> Option<InboundUpdate> {
    let message = update.message?;
    let text = message.text?;
    Some(InboundUpdate {
        chat_id: message.chat.id.to_string(),
        thread_id: message.message_thread_id.map(|id| id.to_string()),
        text,
        sender_id: message.from.map(|u| u.id.to_string()),
        update_id: update.update_id,
    })
}

#[derive(Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct TgUpdate {
    update_id: i64,
    message: Option<TgMessage>,
}

#[derive(Deserialize)]
struct TgMessage {
    chat: TgChat,
    message_thread_id: Option<i64>,
    text: Option<String>,
    from: Option<TgUser>,
}

#[derive(Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Serialize)]
struct TgSendMessage<'a> {
    chat_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_thread_id: Option<i64>,
    text: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_inbound_skips_updates_with_no_text() {
        let update = TgUpdate {
            update_id: 1,
            message: Some(TgMessage {
                chat: TgChat { id: 42 },
                message_thread_id: None,
                text: None,
                from: None,
            }),
        };
        assert!(to_inbound(update).is_none());
    }

    #[test]
    fn to_inbound_maps_thread_id_to_string() {
        let update = TgUpdate {
            update_id: 5,
            message: Some(TgMessage {
                chat: TgChat { id: 42 },
                message_thread_id: Some(7),
                text: Some("hi".to_string()),
                from: Some(TgUser { id: 99 }),
            }),
        };
        let inbound = to_inbound(update).unwrap();
        assert_eq!(inbound.chat_id, "42");
        assert_eq!(inbound.thread_id.as_deref(), Some("7"));
        assert_eq!(inbound.update_id, 5);
    }

    #[test]
    fn to_inbound_without_a_thread_is_none() {
        let update = TgUpdate {
            update_id: 6,
            message: Some(TgMessage {
                chat: TgChat { id: 1 },
                message_thread_id: None,
                text: Some("hi".into()),
                from: None,
            }),
        };
        let inbound = to_inbound(update).unwrap();
        assert!(inbound.thread_id.is_none());
    }

    #[test]
    fn max_chunk_len_matches_telegram_limit() {
        let transport = TelegramTransport::new("dummy-token", 30, chatrelay_core::testsupport::InMemoryStore::new());
        assert_eq!(transport.max_chunk_len(), 4096);
    }

    #[tokio::test]
    async fn run_seeds_its_offset_from_a_persisted_cursor() {
        let store = chatrelay_core::testsupport::InMemoryStore::new();
        store.set_cursor(CURSOR_NAME, 77).await.unwrap();
        let transport = TelegramTransport::new("dummy-token", 30, store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(1);
        transport.run(tx, cancel).await;
        assert_eq!(transport.offset.load(Ordering::SeqCst), 77);
    }
}
