// SPDX-License-Identifier: Apache-2.0
//! Core identifiers shared across the relay engine.

use std::fmt;

/// A thread id as seen on the wire. Telegram forum topics use small positive
/// integers; the literal absence of a topic is represented as the canonical
/// `"root"` string inside a [`TopicKey`], never as an empty string.
pub type ThreadId = String;
pub type ChatId = String;

/// Conversation identifier: `chatId:threadId`, with `threadId` canonicalized
/// to the literal `"root"` when the inbound message carried no thread.
///
/// Ordering within one `TopicKey` is strict FIFO — see [`crate::topic_queue`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey(String);

impl TopicKey {
    pub const ROOT_THREAD: &'static str = "root";

    pub fn new(chat_id: &str, thread_id: Option<&str>) -> Self {
        let thread = thread_id.unwrap_or(Self::ROOT_THREAD);
        Self(format!("{chat_id}:{thread}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split back into `(chat_id, thread_id)`, where `thread_id` is `None`
    /// for the canonical root thread.
    pub fn parts(&self) -> (&str, Option<&str>) {
        match self.0.split_once(':') {
            Some((chat, thread)) if thread == Self::ROOT_THREAD => (chat, None),
            Some((chat, thread)) => (chat, Some(thread)),
            None => (self.0.as_str(), None),
        }
    }

    pub fn chat_id(&self) -> &str {
        self.parts().0
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `(TopicKey, workspacePath)` — uniquely identifies a resumable conversation
/// with the agent adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub topic: TopicKey,
    pub workspace_path: String,
}

impl SessionKey {
    pub fn new(topic: TopicKey, workspace_path: impl Into<String>) -> Self {
        Self {
            topic,
            workspace_path: workspace_path.into(),
        }
    }

    /// The wire-visible form: a JSON-encoded two-element tuple
    /// `["<chatId>:<threadId|root>", "<workspacePath>"]`.
    pub fn to_wire_tuple(&self) -> serde_json::Value {
        serde_json::json!([self.topic.as_str(), self.workspace_path])
    }

    /// Parse the wire-visible tuple format back into a `SessionKey`.
    pub fn from_wire_tuple(value: &serde_json::Value) -> Option<Self> {
        let arr = value.as_array()?;
        if arr.len() != 2 {
            return None;
        }
        let topic_str = arr[0].as_str()?;
        let workspace_path = arr[1].as_str()?.to_string();
        let (chat, thread) = topic_str.split_once(':')?;
        let thread = if thread == TopicKey::ROOT_THREAD {
            None
        } else {
            Some(thread)
        };
        Some(Self::new(TopicKey::new(chat, thread), workspace_path))
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.topic, self.workspace_path)
    }
}

/// Disambiguates "the caller did not specify a thread id" (resolve from
/// `WorkerContext::last_thread_id`) from "the caller explicitly specified no
/// thread" (use the chat's root thread and do not look anything up).
#[derive(Debug, Clone, Default)]
pub enum ThreadIdHint {
    #[default]
    Unspecified,
    Explicit(Option<ThreadId>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_key_canonicalizes_missing_thread_to_root() {
        let k = TopicKey::new("42", None);
        assert_eq!(k.as_str(), "42:root");
    }

    #[test]
    fn topic_key_parts_round_trip() {
        let k = TopicKey::new("42", Some("7"));
        assert_eq!(k.parts(), ("42", Some("7")));
        let root = TopicKey::new("42", None);
        assert_eq!(root.parts(), ("42", None));
    }

    #[test]
    fn session_key_wire_tuple_round_trips() {
        let key = SessionKey::new(TopicKey::new("1", Some("2")), "/ws");
        let wire = key.to_wire_tuple();
        assert_eq!(wire, serde_json::json!(["1:2", "/ws"]));
        let back = SessionKey::from_wire_tuple(&wire).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn session_key_wire_tuple_root_thread() {
        let key = SessionKey::new(TopicKey::new("1", None), "/ws");
        let wire = key.to_wire_tuple();
        assert_eq!(wire, serde_json::json!(["1:root", "/ws"]));
        let back = SessionKey::from_wire_tuple(&wire).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn session_key_from_malformed_wire_tuple_is_none() {
        assert!(SessionKey::from_wire_tuple(&serde_json::json!(["only-one"])).is_none());
        assert!(SessionKey::from_wire_tuple(&serde_json::json!("not-an-array")).is_none());
    }
}
