// SPDX-License-Identifier: Apache-2.0
//! In-process session cache layered on top of the durable
//! [`crate::ports::SessionStoreLike`].
//!
//! Caches up to `max_concurrent` [`SessionKey`] entries with LRU eviction,
//! and independently marks an entry [`SessionStatus::Stale`] once it has
//! gone untouched for `idle_timeout_ms` — a stale entry is still resumable
//! (its resume token is intact) but the next turn against it must start a
//! fresh adapter-side session rather than trust the old one, since the
//! adapter itself may already have expired the state behind the token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use std::num::NonZeroUsize;
use tokio::sync::Mutex;

use crate::ports::{PersistedSession, SessionStatus, StoreError};
use crate::types::SessionKey;

/// An in-memory view of a session, kept consistent with the durable store
/// by every mutating method writing through immediately.
///
/// The underlying `LruCache` is sized unbounded: over-capacity trimming is
/// *not* left to `LruCache::put`'s own silent "drop the oldest" behavior,
/// because that would only ever evict from memory, leaving the dropped
/// entry `Active` and resumable in the store. Enforcing `max_concurrent`
/// is instead the explicit job of [`Self::evict_idle_sessions`], which
/// marks every entry it evicts `Stale` in the store on the way out — see
/// C3's two-step sweep in the spec.
pub struct SessionCache<S> {
    store: Arc<S>,
    idle_timeout_ms: i64,
    max_concurrent: usize,
    entries: Mutex<LruCache<SessionKey, PersistedSession>>,
}

fn now_unix_ms() -> i64 {
    // Callers inject fixed timestamps in tests via `with_clock`-style
    // helpers where determinism matters; production call sites use this.
    chrono::Utc::now().timestamp_millis()
}

impl<S> SessionCache<S>
where
    S: crate::ports::SessionStoreLike,
{
    pub fn new(store: Arc<S>, max_concurrent: usize, idle_timeout_ms: u64) -> Self {
        // Unbounded: see the struct doc for why capacity is enforced by
        // `evict_idle_sessions` instead of the cache's own auto-eviction.
        let capacity = NonZeroUsize::new(usize::MAX).unwrap();
        Self {
            store,
            idle_timeout_ms: idle_timeout_ms as i64,
            max_concurrent: max_concurrent.max(1),
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The durable store backing this cache, for callers that need to
    /// write through to it directly (e.g. the turn-event audit log).
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Resolve a session for use on the next turn: returns the cached or
    /// freshly-loaded [`PersistedSession`], re-marking a timed-out entry
    /// stale along the way. `None` means no session has ever existed for
    /// this key — the caller should start a brand-new adapter session.
    ///
    /// A staleness transition is persisted to the durable store before this
    /// returns — a process restart must never see an idle-timed-out session
    /// come back as `Active` just because only the in-memory copy was
    /// updated.
    pub async fn resolve(&self, key: &SessionKey) -> Result<Option<PersistedSession>, StoreError> {
        let mut guard = self.entries.lock().await;
        if let Some(session) = guard.get(key).cloned() {
            drop(guard);
            return Ok(Some(self.apply_idle_check(key, session).await?));
        }
        drop(guard);

        let loaded = self.store.load_session(key).await?;
        if let Some(session) = loaded {
            let session = self.apply_idle_check(key, session).await?;
            let mut guard = self.entries.lock().await;
            guard.put(key.clone(), session.clone());
            Ok(Some(session))
        } else {
            Ok(None)
        }
    }

    async fn apply_idle_check(
        &self,
        key: &SessionKey,
        mut session: PersistedSession,
    ) -> Result<PersistedSession, StoreError> {
        if session.status == SessionStatus::Active
            && now_unix_ms() - session.last_active_unix_ms > self.idle_timeout_ms
        {
            session.status = SessionStatus::Stale;
            self.store.save_session(key, &session).await?;
            self.entries.lock().await.put(key.clone(), session.clone());
        }
        Ok(session)
    }

    /// Mark a session stale immediately — used by the turn executor after a
    /// `session_invalid`/`tool_call_error` classification, ahead of the
    /// fresh-session retry. Persisted to the durable store, not just the
    /// in-memory cache.
    pub async fn mark_stale(&self, key: &SessionKey) -> Result<(), StoreError> {
        let current = match self.entries.lock().await.get(key).cloned() {
            Some(s) => Some(s),
            None => self.store.load_session(key).await?,
        };
        let Some(mut session) = current else { return Ok(()) };
        session.status = SessionStatus::Stale;
        self.store.save_session(key, &session).await?;
        self.entries.lock().await.put(key.clone(), session);
        Ok(())
    }

    /// Record a successful turn: refresh `last_active_unix_ms`, reset
    /// `retry_count`, set status back to active, persist the resume token.
    pub async fn record_success(
        &self,
        key: &SessionKey,
        resume_token: Option<String>,
    ) -> Result<(), StoreError> {
        let session = PersistedSession {
            resume_token,
            status: SessionStatus::Active,
            last_active_unix_ms: now_unix_ms(),
            retry_count: 0,
        };
        self.store.save_session(key, &session).await?;
        self.entries.lock().await.put(key.clone(), session);
        Ok(())
    }

    /// Record that a fresh-session retry was spent for this key, so the
    /// turn executor's exactly-once retry bound can be enforced across
    /// process restarts too.
    pub async fn record_retry_spent(&self, key: &SessionKey) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().await;
        if let Some(session) = guard.get_mut(key) {
            session.retry_count += 1;
            let updated = session.clone();
            drop(guard);
            self.store.save_session(key, &updated).await?;
        }
        Ok(())
    }

    pub async fn evict(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.entries.lock().await.pop(key);
        self.store.delete_session(key).await
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// The periodic maintenance sweep from the spec's C3 component design:
    ///
    /// 1. Every entry idle past `idle_timeout_ms` is dropped from memory
    ///    and marked `Stale` in the store.
    /// 2. If the cache is still over `max_concurrent` afterwards, the
    ///    oldest remaining entries (ascending `last_active_unix_ms`, via
    ///    the LRU's own least-recently-used ordering) are evicted the same
    ///    way until it's back at the cap.
    ///
    /// Both steps persist the `Stale` transition before returning — an
    /// entry evicted here must never come back as `Active` just because
    /// only the in-memory copy was dropped.
    pub async fn evict_idle_sessions(&self) -> Result<(), StoreError> {
        let now = now_unix_ms();
        let idle: Vec<(SessionKey, PersistedSession)> = {
            let mut guard = self.entries.lock().await;
            let idle_keys: Vec<SessionKey> = guard
                .iter()
                .filter(|(_, session)| now - session.last_active_unix_ms > self.idle_timeout_ms)
                .map(|(key, _)| key.clone())
                .collect();
            idle_keys
                .into_iter()
                .filter_map(|key| guard.pop(&key).map(|session| (key, session)))
                .collect()
        };
        for (key, mut session) in idle {
            session.status = SessionStatus::Stale;
            self.store.save_session(&key, &session).await?;
        }

        let over_cap: Vec<(SessionKey, PersistedSession)> = {
            let mut guard = self.entries.lock().await;
            let mut victims = Vec::new();
            while guard.len() > self.max_concurrent {
                match guard.pop_lru() {
                    Some(victim) => victims.push(victim),
                    None => break,
                }
            }
            victims
        };
        for (key, mut session) in over_cap {
            session.status = SessionStatus::Stale;
            self.store.save_session(&key, &session).await?;
        }
        Ok(())
    }
}

/// Used only by tests that need a fixed clock instead of wall time.
#[cfg(test)]
fn fixed_session(status: SessionStatus, last_active_unix_ms: i64) -> PersistedSession {
    PersistedSession {
        resume_token: Some("tok".into()),
        status,
        last_active_unix_ms,
        retry_count: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PendingStartupAck, SessionStoreLike, TurnEventRecord};
    use async_trait::async_trait;

    #[derive(Default)]
    struct FakeStore {
        sessions: Mutex<HashMap<SessionKey, PersistedSession>>,
    }

    #[async_trait]
    impl SessionStoreLike for FakeStore {
        async fn load_session(
            &self,
            key: &SessionKey,
        ) -> Result<Option<PersistedSession>, StoreError> {
            Ok(self.sessions.lock().await.get(key).cloned())
        }
        async fn save_session(
            &self,
            key: &SessionKey,
            session: &PersistedSession,
        ) -> Result<(), StoreError> {
            self.sessions
                .lock()
                .await
                .insert(key.clone(), session.clone());
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
        async fn save_pending_startup_ack(
            &self,
            _ack: &PendingStartupAck,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn take_pending_startup_ack(&self) -> Result<Option<PendingStartupAck>, StoreError> {
            Ok(None)
        }
        async fn append_turn_event(&self, _record: &TurnEventRecord) -> Result<(), StoreError> {
            Ok(())
        }
        async fn recent_turn_events(
            &self,
            _limit: usize,
        ) -> Result<Vec<TurnEventRecord>, StoreError> {
            Ok(Vec::new())
        }
        async fn get_cursor(&self, _name: &str) -> Result<Option<i64>, StoreError> {
            Ok(None)
        }
        async fn set_cursor(&self, _name: &str, _value: i64) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn key(n: &str) -> SessionKey {
        SessionKey::new(crate::types::TopicKey::new(n, None), "/ws")
    }

    #[tokio::test]
    async fn resolve_returns_none_for_unknown_key() {
        let cache = SessionCache::new(Arc::new(FakeStore::default()), 5, 10_000);
        assert!(cache.resolve(&key("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_success_then_resolve_round_trips() {
        let cache = SessionCache::new(Arc::new(FakeStore::default()), 5, 10_000);
        let k = key("1");
        cache
            .record_success(&k, Some("abc".to_string()))
            .await
            .unwrap();
        let got = cache.resolve(&k).await.unwrap().unwrap();
        assert_eq!(got.resume_token.as_deref(), Some("abc"));
        assert_eq!(got.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn idle_entry_past_timeout_is_marked_stale_on_resolve() {
        let store = Arc::new(FakeStore::default());
        let k = key("1");
        store
            .save_session(&k, &fixed_session(SessionStatus::Active, 0))
            .await
            .unwrap();
        let cache = SessionCache::new(store.clone(), 5, 1);
        let got = cache.resolve(&k).await.unwrap().unwrap();
        assert_eq!(got.status, SessionStatus::Stale);

        // The staleness transition must be durable, not just in-memory.
        let persisted = store.load_session(&k).await.unwrap().unwrap();
        assert_eq!(persisted.status, SessionStatus::Stale);
    }

    #[tokio::test]
    async fn mark_stale_persists_immediately() {
        let store = Arc::new(FakeStore::default());
        let cache = SessionCache::new(store.clone(), 5, 10_000);
        let k = key("1");
        cache.record_success(&k, Some("tok".into())).await.unwrap();
        cache.mark_stale(&k).await.unwrap();

        let persisted = store.load_session(&k).await.unwrap().unwrap();
        assert_eq!(persisted.status, SessionStatus::Stale);
        let cached = cache.resolve(&k).await.unwrap().unwrap();
        assert_eq!(cached.status, SessionStatus::Stale);
    }

    #[tokio::test]
    async fn evict_removes_from_cache_and_store() {
        let store = Arc::new(FakeStore::default());
        let cache = SessionCache::new(store.clone(), 5, 10_000);
        let k = key("1");
        cache.record_success(&k, None).await.unwrap();
        cache.evict(&k).await.unwrap();
        assert!(cache.resolve(&k).await.unwrap().is_none());
        assert!(store.load_session(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recording_beyond_capacity_does_not_auto_evict_between_sweeps() {
        let store = Arc::new(FakeStore::default());
        let cache = SessionCache::new(store.clone(), 1, 10_000);
        cache.record_success(&key("1"), None).await.unwrap();
        cache.record_success(&key("2"), None).await.unwrap();
        // Over-capacity entries stay in memory (and Active) until the next
        // explicit sweep — the cache itself never silently drops one.
        assert_eq!(cache.len().await, 2);
        assert_eq!(
            store.load_session(&key("1")).await.unwrap().unwrap().status,
            SessionStatus::Active
        );
    }

    #[tokio::test]
    async fn evict_idle_sessions_marks_timed_out_entries_stale_in_the_store() {
        let store = Arc::new(FakeStore::default());
        let cache = SessionCache::new(store.clone(), 5, 1_000);
        let k = key("1");
        // Seed directly with a `last_active_unix_ms` of 0 (the Unix epoch)
        // so it's unambiguously past the 1s idle timeout regardless of
        // when the test happens to run.
        let session = fixed_session(SessionStatus::Active, 0);
        cache.entries.lock().await.put(k.clone(), session.clone());
        store.save_session(&k, &session).await.unwrap();

        cache.evict_idle_sessions().await.unwrap();

        assert_eq!(cache.len().await, 0);
        let persisted = store.load_session(&k).await.unwrap().unwrap();
        assert_eq!(persisted.status, SessionStatus::Stale);
    }

    #[tokio::test]
    async fn evict_idle_sessions_marks_over_capacity_entries_stale_in_the_store() {
        let store = Arc::new(FakeStore::default());
        let cache = SessionCache::new(store.clone(), 1, 10_000);
        cache.record_success(&key("1"), None).await.unwrap();
        cache.record_success(&key("2"), None).await.unwrap();
        assert_eq!(cache.len().await, 2);

        cache.evict_idle_sessions().await.unwrap();

        assert_eq!(cache.len().await, 1);
        // The victim (key "1", touched first so least recently used) must
        // be durably Stale, not silently dropped from memory only.
        let persisted = store.load_session(&key("1")).await.unwrap().unwrap();
        assert_eq!(persisted.status, SessionStatus::Stale);
    }
}
