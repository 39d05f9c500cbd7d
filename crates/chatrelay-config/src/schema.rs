// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Top-level relay configuration.
///
/// All defaults are safe for local development: a short-lived in-memory-only
/// store root, loopback-only admin surface, conservative concurrency caps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub turn: TurnConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Session cache / resume behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle timeout before a cached session is marked stale. Milliseconds.
    #[serde(default = "default_session_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Maximum number of concurrently cached sessions before LRU eviction.
    #[serde(default = "default_session_max_concurrent")]
    pub max_concurrent: usize,
    /// Number of fresh-session retries allowed after a session_invalid or
    /// tool_call_error classification (0 or 1 in practice).
    #[serde(default = "default_session_retry_attempts")]
    pub retry_attempts: u32,
    /// Default workspace path used when a topic has no active workspace.
    #[serde(default = "default_workspace_path")]
    pub default_workspace_path: String,
}

fn default_session_idle_timeout_ms() -> u64 {
    2_700_000
}
fn default_session_max_concurrent() -> usize {
    5
}
fn default_session_retry_attempts() -> u32 {
    1
}
fn default_workspace_path() -> String {
    ".".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_session_idle_timeout_ms(),
            max_concurrent: default_session_max_concurrent(),
            retry_attempts: default_session_retry_attempts(),
            default_workspace_path: default_workspace_path(),
        }
    }
}

/// Turn execution timeouts and concurrency caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Maximum time allowed for a single adapter call. Milliseconds.
    #[serde(default = "default_relay_timeout_ms")]
    pub relay_timeout_ms: u64,
    /// Maximum number of topics processed concurrently (Semaphore capacity).
    #[serde(default = "default_max_concurrent_topics")]
    pub max_concurrent_topics: usize,
    /// Bound on the Semaphore's wait queue; beyond this, acquisition fails
    /// fast with QUEUE_FULL rather than growing memory.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

fn default_relay_timeout_ms() -> u64 {
    300_000
}
fn default_max_concurrent_topics() -> usize {
    3
}
fn default_max_queue_size() -> usize {
    100
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            relay_timeout_ms: default_relay_timeout_ms(),
            max_concurrent_topics: default_max_concurrent_topics(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

/// "Still working" progress notification pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_progress_first_ms")]
    pub first_ms: u64,
    #[serde(default = "default_progress_every_ms")]
    pub every_ms: u64,
    #[serde(default = "default_progress_max_count")]
    pub max_count: u32,
}

fn default_progress_first_ms() -> u64 {
    10_000
}
fn default_progress_every_ms() -> u64 {
    30_000
}
fn default_progress_max_count() -> u32 {
    3
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            first_ms: default_progress_first_ms(),
            every_ms: default_progress_every_ms(),
            max_count: default_progress_max_count(),
        }
    }
}

/// Worker-level settings: restart announcement target, build metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Chat to announce "restart complete" to, if different from whichever
    /// chat requested the restart. Usually left unset — the restart flow
    /// records the requesting chat itself in PendingStartupAck.
    pub startup_announce_chat_id: Option<String>,
    pub startup_announce_thread_id: Option<String>,
}

/// Telegram long-polling transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token. Prefer `bot_token_env` in version-controlled config files.
    pub bot_token: Option<String>,
    /// Environment variable holding the bot token (read at startup).
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    /// Long-poll timeout (the `timeout` query parameter on `getUpdates`).
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}
fn default_poll_timeout_secs() -> u64 {
    30
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            bot_token_env: default_bot_token_env(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

/// File-backed session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for persisted state. Defaults to
    /// `~/.local/share/chatrelay` (or `./.chatrelay/data` if no home dir).
    pub data_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { data_dir: None }
    }
}

/// Read-only admin introspection surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Set to `false` to disable the admin HTTP surface entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `host:port` to bind. Defaults to loopback-only.
    #[serde(default = "default_admin_bind")]
    pub bind: String,
}

fn default_admin_bind() -> String {
    "127.0.0.1:18791".to_string()
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_admin_bind(),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_session_idle_timeout_matches_spec() {
        let c = SessionConfig::default();
        assert_eq!(c.idle_timeout_ms, 2_700_000);
    }

    #[test]
    fn default_admin_bind_is_loopback() {
        let c = AdminConfig::default();
        assert!(c.bind.starts_with("127.0.0.1"), "default must be loopback-only");
    }

    #[test]
    fn default_turn_config_matches_spec() {
        let c = TurnConfig::default();
        assert_eq!(c.relay_timeout_ms, 300_000);
        assert_eq!(c.max_concurrent_topics, 3);
        assert_eq!(c.max_queue_size, 100);
    }

    #[test]
    fn config_yaml_round_trip() {
        let c = Config::default();
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.session.idle_timeout_ms, c.session.idle_timeout_ms);
        assert_eq!(back.admin.bind, c.admin.bind);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let yaml = "telegram:\n  poll_timeout_secs: 5\n";
        let c: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.telegram.poll_timeout_secs, 5);
        assert_eq!(c.telegram.bot_token_env, "TELEGRAM_BOT_TOKEN");
        assert_eq!(c.session.idle_timeout_ms, 2_700_000);
    }
}
