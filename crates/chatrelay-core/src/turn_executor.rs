// SPDX-License-Identifier: Apache-2.0
//! The per-turn state machine: Resolve → Dispatch → classify → Deliver.
//!
//! 1. **Resolve** — look up (or start) the session for this topic via
//!    [`crate::session_cache::SessionCache`].
//! 2. **Dispatch** — call the model adapter with a bounded timeout, paced
//!    by a [`crate::progress_pacer::ProgressPacer`] while it's in flight.
//! 3. **Classify** — on failure, run [`crate::error_classifier::classify`]
//!    to decide whether a fresh-session retry applies.
//! 4. **Deliver** — on success, hand the reply to
//!    [`crate::messenger::Messenger`]; on a non-retryable or exhausted
//!    failure, deliver a user-facing error message instead.
//!
//! The fresh-session retry is exactly-once per turn, and only ever granted
//! when a session had actually been resumed (a cold start has nothing to
//! retry fresh against) and the configured retry budget allows it. A
//! timeout does *not* mark the prior session stale — the adapter call may
//! still be running server-side — but is otherwise eligible for the same
//! single retry. The spent retry is recorded durably so a process restart
//! mid-turn can't grant a second retry for the same logical turn.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error_classifier::{classify, classify_elapsed_timeout, is_retryable};
use crate::messenger::Messenger;
use crate::ports::{
    AdapterErrorKind, ChatPort, ModelPort, PersistedSession, SessionStatus, TurnDirection,
    TurnEventRecord, TurnRequest,
};
use crate::progress_pacer::ProgressPacer;
use crate::session_cache::SessionCache;
use crate::types::{SessionKey, ThreadIdHint};

fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Delivered,
    DeliveredWithFallback,
    Failed { kind: String },
}

/// Pacing parameters for the "still working" notifications fired while a
/// turn is in flight.
#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub first_ms: u64,
    pub every_ms: u64,
    pub max_count: u32,
}

pub struct TurnExecutor<M, C, S> {
    adapter: Arc<M>,
    chat: Arc<C>,
    messenger: Arc<Messenger<C>>,
    sessions: Arc<SessionCache<S>>,
    relay_timeout_ms: u64,
    progress: ProgressConfig,
    session_retry_attempts: u32,
}

impl<M, C, S> TurnExecutor<M, C, S>
where
    M: ModelPort + 'static,
    C: ChatPort + 'static,
    S: crate::ports::SessionStoreLike,
{
    pub fn new(
        adapter: Arc<M>,
        chat: Arc<C>,
        messenger: Arc<Messenger<C>>,
        sessions: Arc<SessionCache<S>>,
        relay_timeout_ms: u64,
        progress: ProgressConfig,
        session_retry_attempts: u32,
    ) -> Self {
        Self {
            adapter,
            chat,
            messenger,
            sessions,
            relay_timeout_ms,
            progress,
            session_retry_attempts,
        }
    }

    pub async fn execute(
        &self,
        session_key: &SessionKey,
        chat_id: &str,
        thread_id: Option<&str>,
        input: &str,
    ) -> TurnOutcome {
        let turn_id = uuid::Uuid::new_v4().to_string();
        self.record_turn_event(
            &turn_id,
            session_key,
            TurnDirection::Inbound,
            serde_json::json!({ "input": input }),
        )
        .await;

        let resolved = self.sessions.resolve(session_key).await.unwrap_or(None);
        let had_resumed_session = resolved
            .as_ref()
            .map(|s| s.status == SessionStatus::Active)
            .unwrap_or(false);
        let resume_token = resolved
            .as_ref()
            .filter(|s| s.status == SessionStatus::Active)
            .and_then(|s| s.resume_token.clone());

        let outcome = match self
            .dispatch(session_key, chat_id, thread_id, resume_token, input)
            .await
        {
            Ok(response) => {
                let _ = self
                    .sessions
                    .record_success(session_key, response.resume_token.clone())
                    .await;
                self.deliver(chat_id, thread_id, &response.output).await
            }
            Err(kind)
                if is_retryable(kind)
                    && had_resumed_session
                    && self.retry_budget_available(&resolved) =>
            {
                warn!(topic = %session_key.topic, ?kind, "retrying turn with a fresh session");
                // Timeouts don't imply the session is bad — only session/tool
                // faults mark the prior session stale before the retry.
                if !matches!(kind, AdapterErrorKind::Timeout) {
                    let _ = self.sessions.mark_stale(session_key).await;
                }
                let _ = self.sessions.record_retry_spent(session_key).await;
                let _ = self.adapter.reset_session(session_key).await;
                match self
                    .dispatch(session_key, chat_id, thread_id, None, input)
                    .await
                {
                    Ok(response) => {
                        let _ = self
                            .sessions
                            .record_success(session_key, response.resume_token.clone())
                            .await;
                        self.deliver(chat_id, thread_id, &response.output).await
                    }
                    Err(kind) => self.deliver_failure(chat_id, thread_id, kind).await,
                }
            }
            Err(kind) => self.deliver_failure(chat_id, thread_id, kind).await,
        };

        let payload = match &outcome {
            TurnOutcome::Delivered => serde_json::json!({ "outcome": "delivered" }),
            TurnOutcome::DeliveredWithFallback => {
                serde_json::json!({ "outcome": "delivered_with_fallback" })
            }
            TurnOutcome::Failed { kind } => serde_json::json!({ "outcome": "failed", "kind": kind }),
        };
        self.record_turn_event(&turn_id, session_key, TurnDirection::Outbound, payload)
            .await;

        outcome
    }

    async fn record_turn_event(
        &self,
        turn_id: &str,
        session_key: &SessionKey,
        direction: TurnDirection,
        payload: serde_json::Value,
    ) {
        let record = TurnEventRecord {
            turn_id: turn_id.to_string(),
            session_key: session_key.to_wire_tuple(),
            recorded_at: now_unix_ms(),
            direction,
            payload,
        };
        if let Err(err) = self.sessions.store().append_turn_event(&record).await {
            warn!(topic = %session_key.topic, error = %err, "failed to append turn event");
        }
    }

    fn retry_budget_available(&self, resolved: &Option<PersistedSession>) -> bool {
        if self.session_retry_attempts == 0 {
            return false;
        }
        resolved
            .as_ref()
            .map(|s| s.retry_count < self.session_retry_attempts)
            .unwrap_or(true)
    }

    async fn dispatch(
        &self,
        session_key: &SessionKey,
        chat_id: &str,
        thread_id: Option<&str>,
        resume_token: Option<String>,
        input: &str,
    ) -> Result<crate::ports::TurnResponse, AdapterErrorKind> {
        let request = TurnRequest {
            session_key: session_key.clone(),
            resume_token,
            input: input.to_string(),
        };

        let pacer = ProgressPacer::start(
            self.chat.clone(),
            chat_id.to_string(),
            thread_id.map(|s| s.to_string()),
            "Still working on it…".to_string(),
            self.progress.first_ms,
            self.progress.every_ms,
            self.progress.max_count,
        );

        let call = self.adapter.run_turn(request);
        let outcome =
            match tokio::time::timeout(Duration::from_millis(self.relay_timeout_ms), call).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(err)) => Err(classify(&err.message, None)),
                Err(_elapsed) => Err(classify_elapsed_timeout()),
            };
        pacer.stop().await;
        outcome
    }

    async fn deliver(&self, chat_id: &str, thread_id: Option<&str>, output: &str) -> TurnOutcome {
        let hint = ThreadIdHint::Explicit(thread_id.map(|s| s.to_string()));
        match self.messenger.send(chat_id, hint, output, None, || None).await {
            Ok(outcome) if outcome.fell_back_to_root => TurnOutcome::DeliveredWithFallback,
            Ok(_) => TurnOutcome::Delivered,
            Err((_, err)) => {
                warn!(chat_id, error = %err, "failed to deliver turn reply");
                TurnOutcome::Failed {
                    kind: "delivery_failed".to_string(),
                }
            }
        }
    }

    async fn deliver_failure(
        &self,
        chat_id: &str,
        thread_id: Option<&str>,
        kind: AdapterErrorKind,
    ) -> TurnOutcome {
        info!(chat_id, ?kind, "turn failed, notifying chat");
        let text = error_text(&kind);
        let hint = ThreadIdHint::Explicit(thread_id.map(|s| s.to_string()));
        let _ = self.messenger.send(chat_id, hint, &text, None, || None).await;
        TurnOutcome::Failed {
            kind: format!("{kind:?}"),
        }
    }
}

/// User-facing text for a classified failure, per the closed taxonomy.
fn error_text(kind: &AdapterErrorKind) -> String {
    match kind {
        AdapterErrorKind::Timeout => {
            "The model did not finish in time. Please retry, or increase the relay timeout for long-running tasks.".to_string()
        }
        AdapterErrorKind::EmptyOutput => {
            "The model finished without user-visible output. Please try rephrasing your request.".to_string()
        }
        AdapterErrorKind::SessionInvalid => {
            "Your previous session expired. I started a fresh session; please retry this request.".to_string()
        }
        AdapterErrorKind::ToolCallError => {
            "The model's response was rejected by the provider. I've cleared the conversation — please try again.".to_string()
        }
        AdapterErrorKind::ModelError { classification } => {
            format!("⚠️ {classification} error from the model provider. Please try again.")
        }
        AdapterErrorKind::ModelTransient => {
            "The model provider is temporarily unavailable. Please try again later.".to_string()
        }
        AdapterErrorKind::Transport => {
            "I hit a transport/delivery issue while relaying this response. Please retry now.".to_string()
        }
    }
}
