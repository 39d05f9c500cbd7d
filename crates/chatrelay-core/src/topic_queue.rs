// SPDX-License-Identifier: Apache-2.0
//! Per-topic FIFO task queues.
//!
//! Every inbound update is appended to the queue for its [`TopicKey`]. A
//! single worker loop drains one topic's queue strictly in arrival order,
//! guaranteeing one turn in flight per topic at a time, while distinct
//! topics still make progress concurrently (bounded by
//! [`crate::semaphore::BoundedSemaphore`] at the orchestrator level).
//!
//! A topic's queue entry is evicted once it drains empty *and* no task is
//! still executing against it, so idle topics hold no state here —
//! `TopicQueueMap` never grows for chats that stop talking. Eviction must
//! wait for the in-flight task: popping the last item and running it are
//! two separate steps, and a push that lands in the gap between them must
//! still find the topic's entry (and its `draining` flag) so it queues
//! behind the running task instead of spawning a second, concurrent
//! drainer for the same topic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::sync::Mutex as AsyncMutex;

use crate::types::TopicKey;

struct TopicState<T> {
    items: VecDeque<T>,
    notify: Arc<Notify>,
    /// Set while a worker loop is actively draining this topic, so a
    /// concurrent push knows not to spawn a second drainer.
    draining: bool,
}

/// A map of per-topic FIFO queues with automatic eviction of drained topics.
///
/// `T` is the unit of work (typically an [`crate::ports::InboundUpdate`] or
/// a pre-resolved turn context); this type has no opinion on what it holds.
pub struct TopicQueueMap<T> {
    topics: AsyncMutex<HashMap<TopicKey, TopicState<T>>>,
}

impl<T: Send + 'static> TopicQueueMap<T> {
    pub fn new() -> Self {
        Self {
            topics: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Append an item to its topic's queue. Returns `true` if this push
    /// needs a new drainer spawned (the topic was previously idle), `false`
    /// if an existing drainer will pick it up.
    pub async fn push(&self, topic: TopicKey, item: T) -> bool {
        let mut topics = self.topics.lock().await;
        let state = topics.entry(topic).or_insert_with(|| TopicState {
            items: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            draining: false,
        });
        state.items.push_back(item);
        state.notify.notify_one();
        if state.draining {
            false
        } else {
            state.draining = true;
            true
        }
    }

    /// Pop the next item for `topic`, if any. Never evicts the topic's
    /// entry — even when this empties the queue, the entry (and its
    /// `draining` flag) must stay in place until the caller has finished
    /// running the popped item and reports back via
    /// [`Self::finish_or_retire`]. Otherwise a push landing while that item
    /// is in flight would find no entry, recreate one with `draining =
    /// false`, and cause a second drainer to spawn for the same topic.
    pub async fn pop(&self, topic: &TopicKey) -> Option<T> {
        let mut topics = self.topics.lock().await;
        topics.get_mut(topic).and_then(|state| state.items.pop_front())
    }

    /// Called by the drain loop after it finishes running one popped item.
    /// If the queue is still empty at this point, evicts the topic's entry
    /// and returns `true` (the drainer should stop); otherwise leaves the
    /// entry (still `draining`) in place and returns `false` (more items
    /// arrived while the last one was running — keep looping).
    pub async fn finish_or_retire(&self, topic: &TopicKey) -> bool {
        let mut topics = self.topics.lock().await;
        let Some(state) = topics.get(topic) else {
            return true;
        };
        if state.items.is_empty() {
            topics.remove(topic);
            true
        } else {
            false
        }
    }

    /// Number of topics with at least one queued item, for metrics.
    pub async fn active_topic_count(&self) -> usize {
        self.topics.lock().await.len()
    }

    pub async fn queue_len(&self, topic: &TopicKey) -> usize {
        self.topics
            .lock()
            .await
            .get(topic)
            .map(|s| s.items.len())
            .unwrap_or(0)
    }

    /// Total number of items queued across every topic, for metrics.
    pub async fn total_queued(&self) -> usize {
        self.topics.lock().await.values().map(|s| s.items.len()).sum()
    }
}

impl<T: Send + 'static> Default for TopicQueueMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
