// SPDX-License-Identifier: Apache-2.0
//! Reliable reply delivery: chunks a long reply to fit the transport's
//! message limit and sends each chunk in order, observing and reporting
//! partial delivery if the transport falls back to the chat's root thread
//! partway through (see [`ThreadFallback`]).
//!
//! `Messenger::send` is the canonical entry point used by the turn
//! executor for every outbound reply — including single-chunk ones, which
//! just skip the footer. There is no separate "send raw, unchunked"
//! variant on the hot path; callers that genuinely need a raw send (the
//! startup-acknowledgement protocol, which sends a short fixed string) call
//! `ChatPort::send` directly instead of going through the `Messenger`.

use std::sync::Arc;

use tracing::warn;

use crate::chunk_splitter::{add_chunk_metadata, ChunkSplitter};
use crate::ports::{ChatPort, OutboundMessage, ThreadFallback, TransportError};
use crate::types::ThreadIdHint;

/// Headroom reserved per chunk for the `" (i/N)"` positional marker a
/// multi-chunk reply gets appended. Generous enough for any reply under
/// 10,000 chunks; the marker is only ever added once splitting already
/// happened, so this never shrinks a reply that fits in one chunk.
const POSITION_MARKER_RESERVE: usize = 12;

/// Outcome of delivering a (possibly multi-chunk) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub chunks_sent: usize,
    pub chunks_total: usize,
    /// `true` if any chunk fell back from its requested thread to the
    /// chat's root thread.
    pub fell_back_to_root: bool,
}

pub struct Messenger<C> {
    chat: Arc<C>,
}

impl<C: ChatPort> Messenger<C> {
    pub fn new(chat: Arc<C>) -> Self {
        Self { chat }
    }

    /// Split `text` to the transport's limit, attach `(i/N)` markers and an
    /// optional `footer`, and send every chunk in order to
    /// `(chat_id, thread_id)`.
    ///
    /// `thread_id` follows [`ThreadIdHint`]: `Unspecified` resolves to
    /// whatever the caller's last-known thread for this chat was, while
    /// `Explicit` is used as given, including `Explicit(None)` for the
    /// chat's root thread. The moment any chunk falls back to root, every
    /// subsequent chunk in this same reply is sent to root too — a reply
    /// never splits itself across two different threads mid-delivery.
    ///
    /// Stops at the first chunk that fails outright (distinct from a
    /// thread-fallback, which is not a failure) and returns the partial
    /// outcome alongside the error.
    pub async fn send(
        &self,
        chat_id: &str,
        thread_id: ThreadIdHint,
        text: &str,
        footer: Option<&str>,
        last_thread_for_chat: impl FnOnce() -> Option<String>,
    ) -> Result<DeliveryOutcome, (DeliveryOutcome, TransportError)> {
        let mut thread_id = match thread_id {
            ThreadIdHint::Explicit(id) => id,
            ThreadIdHint::Unspecified => last_thread_for_chat(),
        };

        let splitter = ChunkSplitter::new(self.chat.max_chunk_len());
        let raw_chunks = splitter.split(text, POSITION_MARKER_RESERVE);
        let chunks = add_chunk_metadata(raw_chunks, footer);
        let total = chunks.len();
        let mut fell_back = false;

        for (i, chunk) in chunks.into_iter().enumerate() {
            let message = OutboundMessage {
                chat_id: chat_id.to_string(),
                thread_id: thread_id.clone(),
                text: chunk,
            };
            match self.chat.send(message).await {
                Ok(ThreadFallback::FellBackToRoot) => {
                    fell_back = true;
                    warn!(chat_id, chunk_index = i, "fell back to root thread");
                    // The transport rejected this thread; don't keep
                    // retrying it for the remaining chunks of this reply.
                    thread_id = None;
                }
                Ok(ThreadFallback::Delivered) => {}
                Err(err) => {
                    return Err((
                        DeliveryOutcome {
                            chunks_sent: i,
                            chunks_total: total,
                            fell_back_to_root: fell_back,
                        },
                        err,
                    ));
                }
            }
        }

        Ok(DeliveryOutcome {
            chunks_sent: total,
            chunks_total: total,
            fell_back_to_root: fell_back,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct RecordingChat {
        max_len: usize,
        sent: Mutex<Vec<OutboundMessage>>,
        fail_at: Option<usize>,
        fallback_at: Option<usize>,
    }

    #[async_trait]
    impl ChatPort for RecordingChat {
        async fn send(&self, message: OutboundMessage) -> Result<ThreadFallback, TransportError> {
            let mut sent = self.sent.lock().await;
            let idx = sent.len();
            if self.fail_at == Some(idx) {
                return Err(TransportError::Request("boom".into()));
            }
            sent.push(message);
            if self.fallback_at == Some(idx) {
                Ok(ThreadFallback::FellBackToRoot)
            } else {
                Ok(ThreadFallback::Delivered)
            }
        }

        fn max_chunk_len(&self) -> usize {
            self.max_len
        }
    }

    fn chat(max_len: usize, fail_at: Option<usize>, fallback_at: Option<usize>) -> RecordingChat {
        RecordingChat {
            max_len,
            sent: Mutex::new(Vec::new()),
            fail_at,
            fallback_at,
        }
    }

    #[tokio::test]
    async fn short_message_sends_as_a_single_chunk() {
        let chat = Arc::new(chat(1000, None, None));
        let messenger = Messenger::new(chat.clone());
        let outcome = messenger
            .send("1", ThreadIdHint::Explicit(None), "hello", None, || None)
            .await
            .unwrap();
        assert_eq!(outcome.chunks_sent, 1);
        assert_eq!(outcome.chunks_total, 1);
        assert!(!outcome.fell_back_to_root);
    }

    #[tokio::test]
    async fn long_message_sends_multiple_chunks_in_order() {
        let chat = Arc::new(chat(30, None, None));
        let messenger = Messenger::new(chat.clone());
        let text = "x".repeat(100);
        let outcome = messenger
            .send("1", ThreadIdHint::Explicit(Some("5".into())), &text, None, || None)
            .await
            .unwrap();
        assert!(outcome.chunks_sent > 1);
        assert_eq!(outcome.chunks_sent, outcome.chunks_total);
    }

    #[tokio::test]
    async fn fallback_on_one_chunk_is_reported_but_not_fatal() {
        let chat = Arc::new(chat(30, None, Some(0)));
        let messenger = Messenger::new(chat.clone());
        let text = "x".repeat(100);
        let outcome = messenger
            .send("1", ThreadIdHint::Explicit(Some("5".into())), &text, None, || None)
            .await
            .unwrap();
        assert!(outcome.fell_back_to_root);
        assert_eq!(outcome.chunks_sent, outcome.chunks_total);
    }

    #[tokio::test]
    async fn failure_midway_returns_partial_outcome() {
        let chat = Arc::new(chat(30, Some(1), None));
        let messenger = Messenger::new(chat.clone());
        let text = "x".repeat(100);
        let err = messenger
            .send("1", ThreadIdHint::Explicit(None), &text, None, || None)
            .await
            .unwrap_err();
        assert_eq!(err.0.chunks_sent, 1);
        assert!(err.0.chunks_total > 1);
    }

    #[tokio::test]
    async fn unspecified_thread_resolves_from_the_caller_supplied_lookup() {
        let chat = Arc::new(chat(1000, None, None));
        let messenger = Messenger::new(chat.clone());
        messenger
            .send("1", ThreadIdHint::Unspecified, "hello", None, || Some("9".to_string()))
            .await
            .unwrap();
        let sent = chat.sent.lock().await;
        assert_eq!(sent[0].thread_id.as_deref(), Some("9"));
    }

    #[tokio::test]
    async fn footer_is_appended_on_the_final_chunk() {
        let chat = Arc::new(chat(1000, None, None));
        let messenger = Messenger::new(chat.clone());
        messenger
            .send("1", ThreadIdHint::Explicit(None), "hello", Some("— via bot"), || None)
            .await
            .unwrap();
        let sent = chat.sent.lock().await;
        assert!(sent[0].text.ends_with("— via bot"));
    }
}
