// SPDX-License-Identifier: Apache-2.0
//! Deterministic slash commands handled entirely inside the worker, before
//! anything ever reaches the model adapter. Recognized first in the turn
//! pipeline — a message that parses as a control command short-circuits
//! dispatch regardless of session state.
//!
//! `/start` is the one command whose effect depends on state outside the
//! text itself (whether this is the first message ever seen on the chat),
//! so [`parse`] only identifies *which* command matched; the worker decides
//! whether a matched `Start` actually produces a reply.

/// A recognized control command, already parsed out of the inbound text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `/start` — send the ready banner, but only the very first time this
    /// chat has ever sent anything; every later `/start` is silently
    /// swallowed (decided by the caller, which tracks the per-chat count).
    Start,
    /// `/restart`, `restart`, or `restart assistant` (case-insensitive,
    /// trimmed) — request a supervised process restart, recording a
    /// pending startup acknowledgement so the worker can announce
    /// completion after the new process comes back up.
    Restart,
    /// `/version` — report build metadata (display version, git branch,
    /// commit title).
    Version,
    /// Any other message starting with `/` that didn't match a known
    /// command. Replied to with "Unknown slash command" and never
    /// delegated to the model.
    UnknownSlash,
}

/// Matches the restart intent in any of its accepted surface forms. Exposed
/// separately from [`parse`] because the worker also needs it to normalize
/// a canonical `/restart` into the `restart assistant` phrasing it
/// ultimately acts on, per the spec's note that both forms must have
/// identical effect.
pub fn is_restart_intent(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    normalized == "/restart" || normalized == "restart" || normalized == "restart assistant"
}

/// Parse a line of inbound text as a control command.
///
/// Matching considers only the first line (trimmed), so a multi-line
/// message whose first line is a command is still recognized, and a
/// message that merely mentions a command in prose past the first line
/// never misfires. Returns `None` when the text should fall through to the
/// `TurnExecutor`.
pub fn parse(text: &str) -> Option<ControlCommand> {
    let first_line = text.lines().next().unwrap_or("").trim();

    if first_line.eq_ignore_ascii_case("/start") {
        return Some(ControlCommand::Start);
    }
    if is_restart_intent(first_line) {
        return Some(ControlCommand::Restart);
    }
    if first_line.eq_ignore_ascii_case("/version") {
        return Some(ControlCommand::Version);
    }
    if first_line.starts_with('/') {
        return Some(ControlCommand::UnknownSlash);
    }

    None
}
