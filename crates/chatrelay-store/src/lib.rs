// SPDX-License-Identifier: Apache-2.0
//! A durable [`SessionStoreLike`] backed by plain YAML files on disk.
//!
//! Layout under `data_dir`:
//! ```text
//! sessions/<sanitized-key>.yaml   one file per SessionKey
//! startup_ack.yaml                 single pending-restart-ack slot, if any
//! turn_events.yaml                 bounded ring of recent TurnEventRecord
//! cursors.yaml                     transport long-poll offsets, by name
//! ```
//!
//! A session file's *filename* is a sanitized hash of its key (so it stays a
//! valid path component regardless of what a workspace path contains), but
//! its *content* stores the key in the wire-visible form documented for
//! `SessionKey`: a JSON two-element tuple `["<chatId>:<threadId|root>",
//! "<workspacePath>"]`. `list_sessions` parses that tuple back with
//! `SessionKey::from_wire_tuple` rather than keeping its own parallel
//! chat_id/thread_id/workspace_path fields.
//!
//! All writes within one process go through a single mutex so concurrent
//! callers never interleave partial writes to the same file; this store
//! makes no multi-process locking guarantee, matching the relay's
//! single-worker-per-data-dir deployment model.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use chatrelay_core::{
    PendingStartupAck, PersistedSession, SessionKey, SessionStoreLike, StoreError,
    TurnEventRecord,
};

const MAX_TURN_EVENTS: usize = 1000;

pub struct FileSessionStore {
    data_dir: PathBuf,
    lock: Mutex<()>,
}

/// The on-disk representation of one session file: `key` is the same
/// wire-visible tuple `SessionKey::to_wire_tuple` produces, so the file's
/// content matches what the documented wire format actually looks like.
#[derive(Serialize, Deserialize)]
struct SessionFile {
    key: JsonValue,
    session: PersistedSession,
}

fn io_err(err: std::io::Error) -> StoreError {
    StoreError::Io(err.to_string())
}

fn yaml_err(err: serde_yaml::Error) -> StoreError {
    StoreError::Serialization(err.to_string())
}

/// Default data directory: `~/.local/share/chatrelay`, falling back to
/// `./.chatrelay/data` when no home directory can be resolved.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("chatrelay"))
        .unwrap_or_else(|| PathBuf::from(".chatrelay/data"))
}

fn sanitize_key(key: &SessionKey) -> String {
    let mut hasher = DefaultHasher::new();
    key.topic.as_str().hash(&mut hasher);
    key.workspace_path.hash(&mut hasher);
    let hash = hasher.finish();

    let safe_topic: String = key
        .topic
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{safe_topic}-{hash:x}")
}

impl FileSessionStore {
    pub async fn open(data_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(data_dir.join("sessions"))
            .await
            .map_err(io_err)?;
        Ok(Self {
            data_dir,
            lock: Mutex::new(()),
        })
    }

    fn session_path(&self, key: &SessionKey) -> PathBuf {
        self.data_dir
            .join("sessions")
            .join(format!("{}.yaml", sanitize_key(key)))
    }

    fn startup_ack_path(&self) -> PathBuf {
        self.data_dir.join("startup_ack.yaml")
    }

    fn turn_events_path(&self) -> PathBuf {
        self.data_dir.join("turn_events.yaml")
    }

    fn cursors_path(&self) -> PathBuf {
        self.data_dir.join("cursors.yaml")
    }

    async fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StoreError> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Ok(Some(serde_yaml::from_str(&text).map_err(yaml_err)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_err(err)),
        }
    }

    async fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
        let text = serde_yaml::to_string(value).map_err(yaml_err)?;
        tokio::fs::write(path, text).await.map_err(io_err)
    }
}

#[async_trait]
impl SessionStoreLike for FileSessionStore {
    async fn load_session(&self, key: &SessionKey) -> Result<Option<PersistedSession>, StoreError> {
        let path = self.session_path(key);
        let file: Option<SessionFile> = Self::read_yaml(&path).await?;
        Ok(file.map(|f| f.session))
    }

    async fn save_session(
        &self,
        key: &SessionKey,
        session: &PersistedSession,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let file = SessionFile {
            key: key.to_wire_tuple(),
            session: session.clone(),
        };
        debug!(topic = %key.topic, "persisting session");
        Self::write_yaml(&self.session_path(key), &file).await
    }

    async fn delete_session(&self, key: &SessionKey) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(self.session_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(err)),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<(SessionKey, PersistedSession)>, StoreError> {
        let sessions_dir = self.data_dir.join("sessions");
        let mut entries = tokio::fs::read_dir(&sessions_dir).await.map_err(io_err)?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            if let Some(file) = Self::read_yaml::<SessionFile>(&path).await? {
                match SessionKey::from_wire_tuple(&file.key) {
                    Some(key) => out.push((key, file.session)),
                    None => warn!(?path, "skipping session file with malformed key tuple"),
                }
            }
        }
        Ok(out)
    }

    async fn save_pending_startup_ack(&self, ack: &PendingStartupAck) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        Self::write_yaml(&self.startup_ack_path(), ack).await
    }

    async fn take_pending_startup_ack(&self) -> Result<Option<PendingStartupAck>, StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.startup_ack_path();
        let ack: Option<PendingStartupAck> = Self::read_yaml(&path).await?;
        if ack.is_some() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) | Err(_) => {}
            }
        }
        Ok(ack)
    }

    async fn append_turn_event(&self, record: &TurnEventRecord) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.turn_events_path();
        let mut events: Vec<TurnEventRecord> = Self::read_yaml(&path).await?.unwrap_or_default();
        events.push(record.clone());
        if events.len() > MAX_TURN_EVENTS {
            let overflow = events.len() - MAX_TURN_EVENTS;
            events.drain(0..overflow);
        }
        Self::write_yaml(&path, &events).await
    }

    async fn recent_turn_events(&self, limit: usize) -> Result<Vec<TurnEventRecord>, StoreError> {
        let path = self.turn_events_path();
        let events: Vec<TurnEventRecord> = Self::read_yaml(&path).await?.unwrap_or_default();
        let start = events.len().saturating_sub(limit);
        Ok(events[start..].to_vec())
    }

    async fn get_cursor(&self, name: &str) -> Result<Option<i64>, StoreError> {
        let cursors: HashMap<String, i64> =
            Self::read_yaml(&self.cursors_path()).await?.unwrap_or_default();
        Ok(cursors.get(name).copied())
    }

    async fn set_cursor(&self, name: &str, value: i64) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let path = self.cursors_path();
        let mut cursors: HashMap<String, i64> =
            Self::read_yaml(&path).await?.unwrap_or_default();
        cursors.insert(name.to_string(), value);
        Self::write_yaml(&path, &cursors).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::{SessionStatus, TopicKey, TurnDirection};

    async fn store() -> (FileSessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::open(dir.path().to_path_buf()).await.unwrap();
        (store, dir)
    }

    fn key(chat: &str) -> SessionKey {
        SessionKey::new(TopicKey::new(chat, None), "/ws")
    }

    #[tokio::test]
    async fn missing_session_loads_as_none() {
        let (store, _dir) = store().await;
        assert!(store.load_session(&key("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_session_round_trips() {
        let (store, _dir) = store().await;
        let session = PersistedSession {
            resume_token: Some("abc".into()),
            status: SessionStatus::Active,
            last_active_unix_ms: 123,
            retry_count: 0,
        };
        store.save_session(&key("1"), &session).await.unwrap();
        let loaded = store.load_session(&key("1")).await.unwrap().unwrap();
        assert_eq!(loaded.resume_token.as_deref(), Some("abc"));
        assert_eq!(loaded.last_active_unix_ms, 123);
    }

    #[tokio::test]
    async fn delete_session_removes_it() {
        let (store, _dir) = store().await;
        let session = PersistedSession {
            resume_token: None,
            status: SessionStatus::Active,
            last_active_unix_ms: 0,
            retry_count: 0,
        };
        store.save_session(&key("1"), &session).await.unwrap();
        store.delete_session(&key("1")).await.unwrap();
        assert!(store.load_session(&key("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_sessions_returns_every_saved_key() {
        let (store, _dir) = store().await;
        let session = PersistedSession {
            resume_token: None,
            status: SessionStatus::Active,
            last_active_unix_ms: 0,
            retry_count: 0,
        };
        store.save_session(&key("1"), &session).await.unwrap();
        store.save_session(&key("2"), &session).await.unwrap();
        let all = store.list_sessions().await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn startup_ack_is_consumed_exactly_once() {
        let (store, _dir) = store().await;
        let ack = PendingStartupAck {
            chat_id: "1".into(),
            thread_id: None,
            requested_unix_ms: 0,
            attempt_count: 0,
            last_error: None,
        };
        store.save_pending_startup_ack(&ack).await.unwrap();
        assert!(store.take_pending_startup_ack().await.unwrap().is_some());
        assert!(store.take_pending_startup_ack().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn turn_events_are_capped_and_returned_most_recent_first() {
        let (store, _dir) = store().await;
        for i in 0..5 {
            store
                .append_turn_event(&TurnEventRecord {
                    turn_id: format!("turn-{i}"),
                    session_key: key("1").to_wire_tuple(),
                    recorded_at: i,
                    direction: TurnDirection::Outbound,
                    payload: serde_json::json!({"outcome": "delivered"}),
                })
                .await
                .unwrap();
        }
        let recent = store.recent_turn_events(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].recorded_at, 3);
        assert_eq!(recent[1].recorded_at, 4);
    }

    #[tokio::test]
    async fn session_file_persists_the_wire_tuple_key() {
        let (store, _dir) = store().await;
        let session = PersistedSession {
            resume_token: None,
            status: SessionStatus::Active,
            last_active_unix_ms: 0,
            retry_count: 0,
        };
        let k = SessionKey::new(TopicKey::new("42", Some("7")), "/ws");
        store.save_session(&k, &session).await.unwrap();
        let raw = tokio::fs::read_to_string(store.session_path(&k)).await.unwrap();
        let file: SessionFile = serde_yaml::from_str(&raw).unwrap();
        assert_eq!(file.key, serde_json::json!(["42:7", "/ws"]));
    }

    #[tokio::test]
    async fn cursor_round_trips_and_survives_a_fresh_store_handle() {
        let (store, dir) = store().await;
        assert!(store.get_cursor("telegram").await.unwrap().is_none());
        store.set_cursor("telegram", 42).await.unwrap();
        assert_eq!(store.get_cursor("telegram").await.unwrap(), Some(42));

        let reopened = FileSessionStore::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.get_cursor("telegram").await.unwrap(), Some(42));
    }
}
