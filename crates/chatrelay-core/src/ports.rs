// SPDX-License-Identifier: Apache-2.0
//! Trait boundaries between the relay engine and the outside world: the chat
//! transport, the model adapter, and the durable session store. Concrete
//! implementations live in sibling crates (`chatrelay-transport-telegram`,
//! `chatrelay-agent`, `chatrelay-store`); this crate only depends on the
//! traits so it stays testable with in-memory doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{SessionKey, TopicKey};

/// A message received from the chat transport.
#[derive(Debug, Clone)]
pub struct InboundUpdate {
    pub chat_id: String,
    pub thread_id: Option<String>,
    pub text: String,
    pub sender_id: Option<String>,
    /// Transport-native update id, used for long-polling offset bookkeeping.
    /// Opaque to the engine.
    pub update_id: i64,
}

/// A message to be delivered back to the chat transport.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub chat_id: String,
    /// `None` lets the transport pick the chat's default (root) thread.
    pub thread_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("chat transport rejected thread id {thread_id:?}: {message}")]
    UnknownThread { thread_id: String, message: String },
    #[error("chat transport request failed: {0}")]
    Request(String),
    #[error("chat transport returned malformed response: {0}")]
    Malformed(String),
}

/// The chat-side half of the relay: receive inbound updates, send outbound
/// ones, and advertise the transport's maximum single-message length so the
/// chunk splitter can stay under it.
#[async_trait]
pub trait ChatPort: Send + Sync {
    /// Deliver a single message. Implementations that hit a "thread not
    /// found"-class error for a non-root thread should retry once against
    /// the chat's root thread before giving up, and report whether that
    /// fallback happened via the returned bool.
    async fn send(&self, message: OutboundMessage) -> Result<ThreadFallback, TransportError>;

    /// Maximum number of UTF-8 scalar values permitted in one outbound
    /// message body, excluding any transport-level envelope.
    fn max_chunk_len(&self) -> usize;
}

/// Whether `ChatPort::send` delivered to the requested thread or fell back
/// to the chat's root thread after a 400-class rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFallback {
    Delivered,
    FellBackToRoot,
}

/// A turn request sent to the stateful model adapter.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_key: SessionKey,
    /// `None` starts a fresh adapter-side session; `Some` resumes one.
    pub resume_token: Option<String>,
    pub input: String,
}

/// A successful turn response from the model adapter.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    pub output: String,
    /// Opaque token the adapter wants echoed back on the next turn in this
    /// session, for adapters that don't keep session state server-side.
    pub resume_token: Option<String>,
}

/// The upstream classification an adapter attaches to a `ModelError`, per
/// the closed taxonomy in the spec's error-classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorClass {
    Billing,
    Auth,
    Internal,
    MaxSteps,
    Aborted,
}

impl std::fmt::Display for ModelErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelErrorClass::Billing => "billing",
            ModelErrorClass::Auth => "auth",
            ModelErrorClass::Internal => "internal",
            ModelErrorClass::MaxSteps => "max_steps",
            ModelErrorClass::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// The closed taxonomy of ways a turn can fail. See
/// [`crate::error_classifier`] for how raw adapter errors map onto this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    /// A provider-classified failure (billing, auth, internal, max_steps,
    /// aborted) that isn't a tool-call rejection. Not retried.
    ModelError { classification: ModelErrorClass },
    /// The adapter reported a tool invocation failure attributable to stale
    /// session state. Eligible for exactly-once fresh-session retry.
    ToolCallError,
    /// A provider-classified transient failure (rate limit, capacity). Not
    /// retried — the spec surfaces this as a plain "try again later".
    ModelTransient,
    /// The adapter call exceeded `TurnConfig::relay_timeout_ms`. Eligible
    /// for a fresh-session retry only when a session had been resumed.
    Timeout,
    /// The adapter settled with no user-facing text. Not retried.
    EmptyOutput,
    /// The adapter reported the session/resume token as invalid, expired,
    /// or busy. Eligible for exactly-once fresh-session retry.
    SessionInvalid,
    /// Default bucket: delivery/transport-shaped failures with no more
    /// specific classification. Not retried.
    Transport,
}

#[derive(Debug, Clone, Error)]
#[error("adapter error ({kind:?}): {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// The stateful model adapter: takes a turn request, returns a turn
/// response or a classified error.
#[async_trait]
pub trait ModelPort: Send + Sync {
    async fn run_turn(&self, request: TurnRequest) -> Result<TurnResponse, AdapterError>;

    /// Discard any adapter-side state for `session_key`. Called after a
    /// `session_invalid`/`tool_call_error` classification so the retry
    /// genuinely starts fresh, for adapters that keep state server-side.
    /// Default no-op: adapters that carry no server-side state beyond the
    /// resume token the relay already drops need not override this.
    async fn reset_session(&self, _session_key: &SessionKey) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Optional readiness probe, used by the admin surface / startup checks.
    async fn ping(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Lifecycle status of a persisted session, mirrored 1:1 onto disk by
/// `chatrelay-store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Stale,
}

/// The durable record kept per [`SessionKey`], surviving process restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSession {
    pub resume_token: Option<String>,
    pub status: SessionStatus,
    pub last_active_unix_ms: i64,
    pub retry_count: u32,
}

/// A pending startup acknowledgement: recorded before a supervised restart
/// is requested, consulted on the next process start to decide whether to
/// announce "restart complete" and to whom. Survives repeated failed
/// delivery attempts — see [`crate::startup_ack`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingStartupAck {
    pub chat_id: String,
    pub thread_id: Option<String>,
    pub requested_unix_ms: i64,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Which side of the relay produced a [`TurnEventRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnDirection {
    Inbound,
    Outbound,
}

/// One row of the append-only turn-outcome audit trail the admin surface
/// reads from. Keyed by `turn_id` + `session_key` + a monotonic `recorded_at`
/// timestamp; `payload` is an opaque JSON blob so new turn metadata never
/// requires a store migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEventRecord {
    pub turn_id: String,
    pub session_key: serde_json::Value,
    pub recorded_at: i64,
    pub direction: TurnDirection,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(String),
    #[error("store serialization error: {0}")]
    Serialization(String),
}

/// Durable state the worker must survive a restart with: per-session
/// resume/status bookkeeping, the single pending startup acknowledgement
/// slot, and an append-only turn event log for the admin surface.
#[async_trait]
pub trait SessionStoreLike: Send + Sync {
    async fn load_session(
        &self,
        key: &SessionKey,
    ) -> Result<Option<PersistedSession>, StoreError>;
    async fn save_session(
        &self,
        key: &SessionKey,
        session: &PersistedSession,
    ) -> Result<(), StoreError>;
    async fn delete_session(&self, key: &SessionKey) -> Result<(), StoreError>;
    /// All sessions currently on record, for admin introspection.
    async fn list_sessions(&self) -> Result<Vec<(SessionKey, PersistedSession)>, StoreError>;

    async fn save_pending_startup_ack(
        &self,
        ack: &PendingStartupAck,
    ) -> Result<(), StoreError>;
    async fn take_pending_startup_ack(&self) -> Result<Option<PendingStartupAck>, StoreError>;

    async fn append_turn_event(&self, record: &TurnEventRecord) -> Result<(), StoreError>;
    async fn recent_turn_events(&self, limit: usize) -> Result<Vec<TurnEventRecord>, StoreError>;

    /// Durable long-polling offset, keyed by an opaque transport-chosen
    /// name (e.g. `"telegram"`), so a restart resumes polling from the last
    /// acknowledged update instead of redelivering or skipping a window.
    async fn get_cursor(&self, name: &str) -> Result<Option<i64>, StoreError>;
    async fn set_cursor(&self, name: &str, value: i64) -> Result<(), StoreError>;
}

/// Convenience bound used by code that only needs a chat id to build a
/// [`TopicKey`] — kept so `worker.rs` doesn't repeat the `unwrap_or`.
pub fn topic_key_for(chat_id: &str, thread_id: Option<&str>) -> TopicKey {
    TopicKey::new(chat_id, thread_id)
}

/// A point-in-time snapshot of orchestrator load, for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMetricsSnapshot {
    pub active_topics: usize,
    pub queued_updates: usize,
    pub permits_available: usize,
    pub permits_queue_len: usize,
}

/// Implemented by the orchestrator so the admin crate can read live load
/// figures without depending on its concrete, generic `WorkerContext` type.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn snapshot(&self) -> WorkerMetricsSnapshot;
}
