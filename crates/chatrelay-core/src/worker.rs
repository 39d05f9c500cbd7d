// SPDX-License-Identifier: Apache-2.0
//! The orchestrator: wires inbound updates through per-topic FIFO queues,
//! gates concurrent dispatch with a [`BoundedSemaphore`], short-circuits
//! recognized control commands, and otherwise hands turns to the
//! [`TurnExecutor`].
//!
//! One drainer task runs per active topic (spawned the moment its queue
//! goes from empty to non-empty, per [`TopicQueueMap::push`]) and exits the
//! instant the queue drains — there is no per-topic task that outlives its
//! work, matching the map's own eviction discipline.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, warn};

use async_trait::async_trait;

use crate::control_commands::{self, ControlCommand};
use crate::messenger::Messenger;
use crate::ports::{
    ChatPort, InboundUpdate, MetricsSource, ModelPort, SessionStoreLike, WorkerMetricsSnapshot,
};
use crate::semaphore::BoundedSemaphore;
use crate::session_cache::SessionCache;
use crate::startup_ack::record_restart_request;
use crate::topic_queue::TopicQueueMap;
use crate::turn_executor::{ProgressConfig, TurnExecutor};
use crate::types::{SessionKey, TopicKey};

/// Per-topic mutable bookkeeping the orchestrator needs beyond what's
/// durable: the currently active workspace path. Lives only in memory —
/// on restart it resets to `SessionConfig::default_workspace_path` the
/// next time the topic is touched, which is an acceptable loss since the
/// adapter's own resume token is what actually carries conversation state.
#[derive(Default)]
struct TopicState {
    active_workspace: Option<String>,
}

/// A restart request observed by the control-command handler, for callers
/// that want to react beyond the durable `PendingStartupAck` (e.g. an
/// external supervisor watching for this to actually exec the restart).
/// `WorkerContext` itself only records the ack; acting on the request (the
/// actual process restart) is the caller's responsibility, per the spec's
/// `on_restart_requested` hook.
pub type RestartHook = dyn Fn(&str, Option<&str>) + Send + Sync;

pub struct WorkerContext<M, C, S> {
    queues: Arc<TopicQueueMap<InboundUpdate>>,
    semaphore: Arc<BoundedSemaphore>,
    executor: Arc<TurnExecutor<M, C, S>>,
    chat: Arc<C>,
    store: Arc<S>,
    /// Same cache the executor dispatches turns against, kept here too so
    /// the periodic idle-eviction sweep (§4.11 step 3) can run it without
    /// going through the executor.
    sessions: Arc<SessionCache<S>>,
    default_workspace_path: String,
    version_text: String,
    restart_hook: Option<Box<RestartHook>>,
    topic_state: tokio::sync::Mutex<HashMap<TopicKey, TopicState>>,
    /// Number of messages seen so far per chat, used to gate the one-time
    /// `/start` banner. Per chat, not per topic — a chat with multiple
    /// forum topics shares one counter.
    chat_message_count: tokio::sync::Mutex<HashMap<String, u32>>,
    /// Most recent thread id a chat was heard from, used to resolve a
    /// caller-omitted thread id on outbound messages that don't carry one
    /// of their own (see [`crate::types::ThreadIdHint`]).
    last_thread_id: tokio::sync::Mutex<HashMap<String, Option<String>>>,
}

#[allow(clippy::too_many_arguments)]
impl<M, C, S> WorkerContext<M, C, S>
where
    M: ModelPort + Send + Sync + 'static,
    C: ChatPort + Send + Sync + 'static,
    S: SessionStoreLike + Send + Sync + 'static,
{
    pub fn new(
        adapter: Arc<M>,
        chat: Arc<C>,
        store: Arc<S>,
        max_concurrent_topics: usize,
        max_queue_size: usize,
        session_max_concurrent: usize,
        session_idle_timeout_ms: u64,
        session_retry_attempts: u32,
        relay_timeout_ms: u64,
        progress: ProgressConfig,
        default_workspace_path: String,
        version_text: String,
    ) -> Arc<Self> {
        Self::with_restart_hook(
            adapter,
            chat,
            store,
            max_concurrent_topics,
            max_queue_size,
            session_max_concurrent,
            session_idle_timeout_ms,
            session_retry_attempts,
            relay_timeout_ms,
            progress,
            default_workspace_path,
            version_text,
            None,
        )
    }

    /// Same as [`Self::new`], but additionally invokes `restart_hook` with
    /// `(chat_id, thread_id)` once a restart has been requested and its
    /// `PendingStartupAck` recorded. `main.rs` wires this to actually exit
    /// the process — the rest of the worker has no opinion on how a
    /// restart is carried out (supervisor restart, container replace, etc.).
    #[allow(clippy::too_many_arguments)]
    pub fn with_restart_hook(
        adapter: Arc<M>,
        chat: Arc<C>,
        store: Arc<S>,
        max_concurrent_topics: usize,
        max_queue_size: usize,
        session_max_concurrent: usize,
        session_idle_timeout_ms: u64,
        session_retry_attempts: u32,
        relay_timeout_ms: u64,
        progress: ProgressConfig,
        default_workspace_path: String,
        version_text: String,
        restart_hook: Option<Box<RestartHook>>,
    ) -> Arc<Self> {
        let sessions = Arc::new(SessionCache::new(
            store.clone(),
            session_max_concurrent,
            session_idle_timeout_ms,
        ));
        let messenger = Arc::new(Messenger::new(chat.clone()));
        let executor = Arc::new(TurnExecutor::new(
            adapter,
            chat.clone(),
            messenger,
            sessions.clone(),
            relay_timeout_ms,
            progress,
            session_retry_attempts,
        ));

        let this = Arc::new(Self {
            queues: Arc::new(TopicQueueMap::new()),
            semaphore: Arc::new(BoundedSemaphore::new(max_concurrent_topics, max_queue_size)),
            executor,
            chat,
            store,
            sessions,
            default_workspace_path,
            version_text,
            restart_hook,
            topic_state: tokio::sync::Mutex::new(HashMap::new()),
            chat_message_count: tokio::sync::Mutex::new(HashMap::new()),
            last_thread_id: tokio::sync::Mutex::new(HashMap::new()),
        });
        this.clone().spawn_idle_session_sweep(session_idle_timeout_ms);
        this
    }

    /// Periodic maintenance the spec calls for alongside the poll loop:
    /// every `session_idle_timeout / 4` (floored at 30s), evict idle and
    /// over-capacity sessions from the cache, marking each `Stale` in the
    /// durable store as it goes. Runs for the lifetime of the process —
    /// there is nothing to clean up on shutdown, just like `drain_topic`.
    fn spawn_idle_session_sweep(self: Arc<Self>, session_idle_timeout_ms: u64) {
        let period_ms = (session_idle_timeout_ms / 4).max(30_000);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(period_ms));
            loop {
                ticker.tick().await;
                if let Err(err) = self.sessions.evict_idle_sessions().await {
                    warn!(error = %err, "idle session sweep failed");
                }
            }
        });
    }

    /// Entry point called once per inbound update from the chat transport.
    /// Enqueues the update on its topic's FIFO queue and spawns a drainer
    /// if this topic was previously idle.
    pub async fn on_update(self: &Arc<Self>, update: InboundUpdate) {
        let topic = TopicKey::new(&update.chat_id, update.thread_id.as_deref());
        self.last_thread_id
            .lock()
            .await
            .insert(update.chat_id.clone(), update.thread_id.clone());
        let needs_drainer = self.queues.push(topic.clone(), update).await;
        if needs_drainer {
            let this = self.clone();
            tokio::spawn(async move {
                this.drain_topic(topic).await;
            });
        }
    }

    /// Runs exactly one turn at a time for `topic`, strictly in arrival
    /// order. The queue entry (and its `draining` flag) stays in place for
    /// the whole time a turn is in flight — eviction is only decided by
    /// `finish_or_retire` *after* `handle_one` returns, so a push landing
    /// mid-turn is guaranteed to be picked up by this same loop instead of
    /// spawning a second, concurrent drainer for the topic.
    async fn drain_topic(self: Arc<Self>, topic: TopicKey) {
        loop {
            let Some(update) = self.queues.pop(&topic).await else {
                break;
            };
            if let Err(err) = self.handle_one(&topic, update).await {
                error!(%topic, error = %err, "unhandled error processing update");
            }
            if self.queues.finish_or_retire(&topic).await {
                break;
            }
        }
    }

    async fn handle_one(
        &self,
        topic: &TopicKey,
        update: InboundUpdate,
    ) -> Result<(), anyhow::Error> {
        if let Some(command) = control_commands::parse(&update.text) {
            return self.handle_control_command(topic, &update, command).await;
        }

        let permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_queue_full) => {
                warn!(%topic, "dropping turn: dispatch queue is full");
                let _ = self
                    .chat
                    .send(crate::ports::OutboundMessage {
                        chat_id: update.chat_id.clone(),
                        thread_id: update.thread_id.clone(),
                        text: "The relay is at capacity right now; please try again shortly."
                            .to_string(),
                    })
                    .await;
                return Ok(());
            }
        };

        let workspace = self.active_workspace(topic).await;
        let session_key = SessionKey::new(topic.clone(), workspace);
        self.executor
            .execute(
                &session_key,
                &update.chat_id,
                update.thread_id.as_deref(),
                &update.text,
            )
            .await;
        drop(permit);
        Ok(())
    }

    async fn active_workspace(&self, topic: &TopicKey) -> String {
        self.topic_state
            .lock()
            .await
            .get(topic)
            .and_then(|s| s.active_workspace.clone())
            .unwrap_or_else(|| self.default_workspace_path.clone())
    }

    async fn handle_control_command(
        &self,
        _topic: &TopicKey,
        update: &InboundUpdate,
        command: ControlCommand,
    ) -> Result<(), anyhow::Error> {
        match command {
            ControlCommand::Start => {
                let mut counts = self.chat_message_count.lock().await;
                let count = counts.entry(update.chat_id.clone()).or_insert(0);
                if *count == 0 {
                    *count += 1;
                    drop(counts);
                    self.reply(
                        update,
                        "I'm ready — send me a message to get started. Use /restart to restart me, or /version to check what's running.",
                    )
                    .await;
                }
                // Subsequent /start on the same chat: silently ignored.
            }
            ControlCommand::Restart => {
                // Reply first: if `restart_hook` tears the process down
                // (main.rs wires it to process::exit), the chat transport
                // must already have the "restarting…" message in flight.
                self.reply(update, "restarting…").await;
                let _ = record_restart_request(
                    self.store.as_ref(),
                    &update.chat_id,
                    update.thread_id.as_deref(),
                )
                .await;
                if let Some(hook) = &self.restart_hook {
                    hook(&update.chat_id, update.thread_id.as_deref());
                }
            }
            ControlCommand::Version => {
                self.reply(update, &self.version_text).await;
            }
            ControlCommand::UnknownSlash => {
                self.reply(update, "Unknown slash command").await;
            }
        }
        Ok(())
    }

    async fn reply(&self, update: &InboundUpdate, text: &str) {
        let _ = self
            .chat
            .send(crate::ports::OutboundMessage {
                chat_id: update.chat_id.clone(),
                thread_id: update.thread_id.clone(),
                text: text.to_string(),
            })
            .await;
    }
}

#[async_trait]
impl<M, C, S> MetricsSource for WorkerContext<M, C, S>
where
    M: ModelPort + Send + Sync + 'static,
    C: ChatPort + Send + Sync + 'static,
    S: SessionStoreLike + Send + Sync + 'static,
{
    async fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            active_topics: self.queues.active_topic_count().await,
            queued_updates: self.queues.total_queued().await,
            permits_available: self.semaphore.available_permits().await,
            permits_queue_len: self.semaphore.queue_len().await,
        }
    }
}
