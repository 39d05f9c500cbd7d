// SPDX-License-Identifier: Apache-2.0
//! Durable startup-acknowledgement protocol.
//!
//! A `/restart` request must survive the process actually restarting: the
//! worker records a [`PendingStartupAck`] to the durable store *before*
//! exiting, and the next process start consults it to decide whether to
//! announce "restart complete" and to which chat/thread. The record is
//! consumed exactly once — `take_pending_startup_ack` both reads and
//! clears it atomically at the store layer, so a crash loop can never
//! resend the same acknowledgement twice, and a normal (non-restart)
//! startup that finds nothing pending stays silent.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::ports::{ChatPort, OutboundMessage, PendingStartupAck, SessionStoreLike, StoreError};

/// Record that chat `(chat_id, thread_id)` asked for a restart, so the next
/// process start can acknowledge completion to the same place.
pub async fn record_restart_request<S: SessionStoreLike>(
    store: &S,
    chat_id: &str,
    thread_id: Option<&str>,
) -> Result<(), StoreError> {
    let ack = PendingStartupAck {
        chat_id: chat_id.to_string(),
        thread_id: thread_id.map(|s| s.to_string()),
        requested_unix_ms: Utc::now().timestamp_millis(),
        attempt_count: 0,
        last_error: None,
    };
    store.save_pending_startup_ack(&ack).await
}

/// Called once at worker startup. If a restart was pending, announces
/// completion to the chat that requested it.
///
/// On success the record is cleared — `take_pending_startup_ack` both reads
/// and clears it at the store layer, so a crash loop can never resend the
/// same acknowledgement twice. On delivery failure the record is instead
/// re-saved with `attempt_count` incremented and `last_error` set, *not*
/// cleared, so the next boot retries the same acknowledgement rather than
/// silently dropping it.
pub async fn acknowledge_pending_restart<S, C>(
    store: &S,
    chat: &C,
    announce_text: &str,
) -> Result<(), StoreError>
where
    S: SessionStoreLike,
    C: ChatPort,
{
    let Some(ack) = store.take_pending_startup_ack().await? else {
        return Ok(());
    };

    info!(chat_id = %ack.chat_id, attempt = ack.attempt_count, "acknowledging completed restart");
    let result = chat
        .send(OutboundMessage {
            chat_id: ack.chat_id.clone(),
            thread_id: ack.thread_id.clone(),
            text: announce_text.to_string(),
        })
        .await;

    if let Err(err) = result {
        warn!(chat_id = %ack.chat_id, error = %err, "failed to deliver restart acknowledgement, will retry next boot");
        let retried = PendingStartupAck {
            attempt_count: ack.attempt_count + 1,
            last_error: Some(err.to_string()),
            ..ack
        };
        store.save_pending_startup_ack(&retried).await?;
    }

    Ok(())
}
