// SPDX-License-Identifier: Apache-2.0
//! Deterministic in-memory test doubles, exported for use from other
//! workspace crates' integration tests via the `testing` feature.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::ports::{
    AdapterError, ChatPort, ModelPort, OutboundMessage, PendingStartupAck, PersistedSession,
    SessionStoreLike, StoreError, ThreadFallback, TransportError, TurnEventRecord, TurnRequest,
    TurnResponse,
};
use crate::types::SessionKey;

/// A [`ModelPort`] that replays a fixed script of responses, one per call,
/// repeating the last entry once exhausted.
pub struct MockAdapter {
    responses: Vec<Result<TurnResponse, AdapterError>>,
    calls: Mutex<Vec<TurnRequest>>,
}

impl MockAdapter {
    pub fn new(responses: Vec<Result<TurnResponse, AdapterError>>) -> Self {
        Self {
            responses,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }
}

#[async_trait]
impl ModelPort for MockAdapter {
    async fn run_turn(&self, request: TurnRequest) -> Result<TurnResponse, AdapterError> {
        let mut calls = self.calls.lock().await;
        let index = calls.len().min(self.responses.len().saturating_sub(1));
        calls.push(request);
        self.responses[index].clone()
    }
}

/// A [`ChatPort`] that records every message it was asked to send instead
/// of delivering it anywhere.
pub struct RecordingChatPort {
    pub max_len: usize,
    pub sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingChatPort {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub async fn sent_messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl ChatPort for RecordingChatPort {
    async fn send(&self, message: OutboundMessage) -> Result<ThreadFallback, TransportError> {
        self.sent.lock().await.push(message);
        Ok(ThreadFallback::Delivered)
    }

    fn max_chunk_len(&self) -> usize {
        self.max_len
    }
}

/// A fully in-memory [`SessionStoreLike`], for tests that need durability
/// semantics without touching the filesystem.
#[derive(Default)]
pub struct InMemoryStore {
    sessions: Mutex<HashMap<SessionKey, PersistedSession>>,
    pending_ack: Mutex<Option<PendingStartupAck>>,
    turn_events: Mutex<Vec<TurnEventRecord>>,
    cursors: Mutex<HashMap<String, i64>>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStoreLike for InMemoryStore {
    async fn load_session(&self, key: &SessionKey) -> Result<Option<PersistedSession>, StoreError> {
        Ok(self.sessions.lock().await.get(key).cloned())
    }

    async fn save_session(
        &self,
        key: &SessionKey,
        session: &PersistedSession,
    ) -> Result<(), StoreError> {
        self.sessions.lock().await.insert(key.clone(), session.clone());
        Ok(())
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.sessions.lock().await.remove(key);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<(SessionKey, PersistedSession)>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn save_pending_startup_ack(&self, ack: &PendingStartupAck) -> Result<(), StoreError> {
        *self.pending_ack.lock().await = Some(ack.clone());
        Ok(())
    }

    async fn take_pending_startup_ack(&self) -> Result<Option<PendingStartupAck>, StoreError> {
        Ok(self.pending_ack.lock().await.take())
    }

    async fn append_turn_event(&self, record: &TurnEventRecord) -> Result<(), StoreError> {
        self.turn_events.lock().await.push(record.clone());
        Ok(())
    }

    async fn recent_turn_events(&self, limit: usize) -> Result<Vec<TurnEventRecord>, StoreError> {
        let events = self.turn_events.lock().await;
        let start = events.len().saturating_sub(limit);
        Ok(events[start..].to_vec())
    }

    async fn get_cursor(&self, name: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.cursors.lock().await.get(name).copied())
    }

    async fn set_cursor(&self, name: &str, value: i64) -> Result<(), StoreError> {
        self.cursors.lock().await.insert(name.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::AdapterErrorKind;

    #[tokio::test]
    async fn mock_adapter_replays_scripted_responses_in_order() {
        let adapter = MockAdapter::new(vec![
            Ok(TurnResponse { output: "first".into(), resume_token: None }),
            Err(AdapterError::new(AdapterErrorKind::Transport, "boom")),
        ]);
        let key = SessionKey::new(crate::types::TopicKey::new("1", None), "/ws");
        let req = || TurnRequest { session_key: key.clone(), resume_token: None, input: "x".into() };

        let first = adapter.run_turn(req()).await.unwrap();
        assert_eq!(first.output, "first");
        assert!(adapter.run_turn(req()).await.is_err());
        assert_eq!(adapter.call_count().await, 2);
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_sessions() {
        let store = InMemoryStore::new();
        let key = SessionKey::new(crate::types::TopicKey::new("1", None), "/ws");
        let session = PersistedSession {
            resume_token: Some("tok".into()),
            status: crate::ports::SessionStatus::Active,
            last_active_unix_ms: 0,
            retry_count: 0,
        };
        store.save_session(&key, &session).await.unwrap();
        let loaded = store.load_session(&key).await.unwrap().unwrap();
        assert_eq!(loaded.resume_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn recording_chat_port_captures_all_sent_messages() {
        let chat = RecordingChatPort::new(4096);
        chat.send(OutboundMessage { chat_id: "1".into(), thread_id: None, text: "hi".into() })
            .await
            .unwrap();
        assert_eq!(chat.sent_messages().await.len(), 1);
    }
}
