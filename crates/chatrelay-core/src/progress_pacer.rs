// SPDX-License-Identifier: Apache-2.0
//! Sends "still working…" notifications while a turn is in flight, paced so
//! a slow adapter call doesn't produce a flood of progress messages.
//!
//! The pacer fires once after `first_ms`, then every `every_ms` after that,
//! up to `max_count` notifications total, and stops the instant the turn
//! settles — it guarantees it will never fire after [`ProgressPacer::stop`]
//! has been called, even if a tick was already in flight when the turn
//! completed, by racing every tick against the cancellation token rather
//! than checking a plain flag.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ports::{ChatPort, OutboundMessage};

pub struct ProgressPacer {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressPacer {
    /// Start pacing notifications for `(chat_id, thread_id)` using `chat`.
    /// The returned pacer must be stopped (via [`ProgressPacer::stop`]) once
    /// the turn settles, successfully or not — dropping it without stopping
    /// also cancels it, but `stop` additionally awaits the background task
    /// so callers can rely on "no more messages after this point".
    pub fn start<C>(
        chat: Arc<C>,
        chat_id: String,
        thread_id: Option<String>,
        text: String,
        first_ms: u64,
        every_ms: u64,
        max_count: u32,
    ) -> Self
    where
        C: ChatPort + 'static,
    {
        let cancel = CancellationToken::new();
        let cancel_child = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut delay = Duration::from_millis(first_ms);
            for _ in 0..max_count {
                tokio::select! {
                    _ = cancel_child.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                // Re-check right before sending: the turn may have settled
                // in the instant between the sleep firing and this point.
                if cancel_child.is_cancelled() {
                    return;
                }
                let _ = chat
                    .send(OutboundMessage {
                        chat_id: chat_id.clone(),
                        thread_id: thread_id.clone(),
                        text: text.clone(),
                    })
                    .await;
                delay = Duration::from_millis(every_ms);
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Cancel pending notifications and wait for the background task to
    /// fully stop. After this returns, no further progress message will be
    /// sent for this turn.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressPacer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::ports::{ThreadFallback, TransportError};
    use tokio::sync::Mutex;

    struct CountingChat {
        count: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl ChatPort for CountingChat {
        async fn send(&self, _message: OutboundMessage) -> Result<ThreadFallback, TransportError> {
            *self.count.lock().await += 1;
            Ok(ThreadFallback::Delivered)
        }
        fn max_chunk_len(&self) -> usize {
            4096
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_first_notification_after_first_ms() {
        let count = Arc::new(Mutex::new(0));
        let chat = Arc::new(CountingChat { count: count.clone() });
        let pacer = ProgressPacer::start(
            chat,
            "1".into(),
            None,
            "still working".into(),
            1000,
            5000,
            3,
        );
        tokio::time::advance(Duration::from_millis(1100)).await;
        tokio::task::yield_now().await;
        assert_eq!(*count.lock().await, 1);
        pacer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_count_notifications() {
        let count = Arc::new(Mutex::new(0));
        let chat = Arc::new(CountingChat { count: count.clone() });
        let pacer = ProgressPacer::start(
            chat,
            "1".into(),
            None,
            "still working".into(),
            100,
            100,
            2,
        );
        tokio::time::advance(Duration::from_millis(5000)).await;
        tokio::task::yield_now().await;
        assert_eq!(*count.lock().await, 2);
        pacer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_first_tick_suppresses_all_notifications() {
        let count = Arc::new(Mutex::new(0));
        let chat = Arc::new(CountingChat { count: count.clone() });
        let pacer = ProgressPacer::start(
            chat,
            "1".into(),
            None,
            "still working".into(),
            1000,
            1000,
            3,
        );
        pacer.stop().await;
        tokio::time::advance(Duration::from_millis(5000)).await;
        tokio::task::yield_now().await;
        assert_eq!(*count.lock().await, 0);
    }
}
