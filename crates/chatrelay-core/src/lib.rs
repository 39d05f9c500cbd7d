// SPDX-License-Identifier: Apache-2.0
//! Per-topic serialization, session resume/retry, and turn execution for
//! the chat relay worker. Transport- and adapter-agnostic: everything here
//! is expressed in terms of the [`ports`] traits, with concrete
//! implementations living in sibling crates.

mod chunk_splitter;
mod control_commands;
mod error_classifier;
mod messenger;
mod ports;
mod progress_pacer;
mod semaphore;
mod session_cache;
mod startup_ack;
mod topic_queue;
mod turn_executor;
mod types;
mod worker;

#[cfg(any(test, feature = "testing"))]
pub mod testsupport;

pub use chunk_splitter::ChunkSplitter;
pub use control_commands::{is_restart_intent, parse as parse_control_command, ControlCommand};
pub use error_classifier::{
    classify as classify_adapter_error, classify_elapsed_timeout, is_retryable,
    UpstreamClassification,
};
pub use messenger::{DeliveryOutcome, Messenger};
pub use ports::{
    AdapterError, AdapterErrorKind, ChatPort, InboundUpdate, MetricsSource, ModelErrorClass,
    ModelPort, OutboundMessage, PendingStartupAck, PersistedSession, SessionStatus,
    SessionStoreLike, StoreError, ThreadFallback, TransportError, TurnDirection, TurnEventRecord,
    TurnRequest, TurnResponse, WorkerMetricsSnapshot,
};
pub use progress_pacer::ProgressPacer;
pub use semaphore::{BoundedSemaphore, Permit, QueueFull};
pub use session_cache::SessionCache;
pub use startup_ack::{acknowledge_pending_restart, record_restart_request};
pub use topic_queue::TopicQueueMap;
pub use turn_executor::{ProgressConfig, TurnExecutor, TurnOutcome};
pub use types::{SessionKey, ThreadIdHint, TopicKey};
pub use worker::WorkerContext;
