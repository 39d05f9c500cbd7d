// SPDX-License-Identifier: Apache-2.0
//! Maps raw adapter failures onto the closed [`AdapterErrorKind`] taxonomy.
//!
//! Classification combines structured input (an adapter-reported
//! [`ModelErrorClass`]) with unstructured string matching against whatever
//! text the provider bled through, checked in the precedence order the
//! table below lists top to bottom — the first row whose trigger matches
//! wins, so a message matching more than one pattern always resolves to the
//! earliest, most specific class. Matching is case-insensitive throughout.
//!
//! | Class | Trigger |
//! |---|---|
//! | `model_error` | structured classification, except tool-call patterns |
//! | `tool_call_error` | text contains a tool-call-rejection marker |
//! | `model_transient` | structured classification ∈ {rate_limit, capacity} |
//! | `timeout` | text contains "timed out" |
//! | `empty_output` | text contains "no user-facing text output" |
//! | `session_invalid` | stale/invalid/expired session, or "already processing"/"agent is busy" |
//! | `transport` | default |

use regex::Regex;

use crate::ports::{AdapterErrorKind, ModelErrorClass};

/// Structured classification an adapter may attach to a raw error, prior to
/// any text-matching fallback. Mirrors the provider-side taxonomy the spec
/// assumes adapters can report when they have it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamClassification {
    Billing,
    Auth,
    Internal,
    MaxSteps,
    Aborted,
    RateLimit,
    Capacity,
}

const TOOL_CALL_PATTERNS: &[&str] = &[
    "failed_generation",
    "tool call validation",
    "tool_use_failed",
    "tool use failed",
];

const SESSION_BUSY_PATTERNS: &[&str] = &["already processing", "agent is busy"];

/// Matches stale/invalid/expired session references and "session not
/// found"/"resume token" shapes. Rebuilt per call: the pattern is fixed and
/// small, and this keeps the module free of a process-wide static cache
/// dependency the rest of the workspace doesn't otherwise need.
fn session_invalid_regex() -> Regex {
    Regex::new(r"(?i)(stale|invalid|expired)\s+session|session\s+(not\s+found|token)")
        .expect("static pattern is valid")
}

/// Classify a raw adapter error into the closed taxonomy.
///
/// `structured` is the adapter's own classification, when it has one;
/// `message` is the raw upstream text, used both to detect tool-call
/// rejections that override a structured classification and as the sole
/// signal when no structured classification is available.
pub fn classify(message: &str, structured: Option<UpstreamClassification>) -> AdapterErrorKind {
    let lower = message.to_lowercase();

    if let Some(class) = structured {
        if !TOOL_CALL_PATTERNS.iter().any(|p| lower.contains(p)) {
            return match class {
                UpstreamClassification::Billing => AdapterErrorKind::ModelError {
                    classification: ModelErrorClass::Billing,
                },
                UpstreamClassification::Auth => AdapterErrorKind::ModelError {
                    classification: ModelErrorClass::Auth,
                },
                UpstreamClassification::Internal => AdapterErrorKind::ModelError {
                    classification: ModelErrorClass::Internal,
                },
                UpstreamClassification::MaxSteps => AdapterErrorKind::ModelError {
                    classification: ModelErrorClass::MaxSteps,
                },
                UpstreamClassification::Aborted => AdapterErrorKind::ModelError {
                    classification: ModelErrorClass::Aborted,
                },
                UpstreamClassification::RateLimit | UpstreamClassification::Capacity => {
                    AdapterErrorKind::ModelTransient
                }
            };
        }
    }

    if TOOL_CALL_PATTERNS.iter().any(|p| lower.contains(p)) {
        return AdapterErrorKind::ToolCallError;
    }
    if lower.contains("timed out") {
        return AdapterErrorKind::Timeout;
    }
    if lower.contains("no user-facing text output") {
        return AdapterErrorKind::EmptyOutput;
    }
    if session_invalid_regex().is_match(message)
        || SESSION_BUSY_PATTERNS.iter().any(|p| lower.contains(p))
    {
        return AdapterErrorKind::SessionInvalid;
    }

    AdapterErrorKind::Transport
}

/// Classification to use when a turn is known to have timed out via an
/// actual elapsed-time timeout (`tokio::time::timeout` firing) rather than
/// by inspecting message text — that case is unambiguous and must never
/// depend on string matching.
pub fn classify_elapsed_timeout() -> AdapterErrorKind {
    AdapterErrorKind::Timeout
}

/// Whether a turn that failed with `kind` is eligible for the
/// exactly-once fresh-session retry described in
/// [`crate::turn_executor`]. `timeout` is conditionally retryable — the
/// turn executor additionally requires that a session had been resumed
/// before granting the retry, since the session may still be alive.
pub fn is_retryable(kind: AdapterErrorKind) -> bool {
    matches!(
        kind,
        AdapterErrorKind::SessionInvalid | AdapterErrorKind::ToolCallError | AdapterErrorKind::Timeout
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_not_found_is_case_insensitive() {
        assert_eq!(
            classify("Session Not Found: abc", None),
            AdapterErrorKind::SessionInvalid
        );
    }

    #[test]
    fn stale_session_text_classifies_as_session_invalid() {
        assert_eq!(
            classify("the stale session token was rejected", None),
            AdapterErrorKind::SessionInvalid
        );
    }

    #[test]
    fn busy_agent_text_classifies_as_session_invalid() {
        assert_eq!(classify("agent is busy right now", None), AdapterErrorKind::SessionInvalid);
        assert_eq!(classify("already processing a request", None), AdapterErrorKind::SessionInvalid);
    }

    #[test]
    fn tool_call_markers_classify_correctly() {
        for marker in ["failed_generation", "tool call validation", "tool_use_failed", "tool use failed"] {
            assert_eq!(classify(&format!("boom: {marker}"), None), AdapterErrorKind::ToolCallError);
        }
    }

    #[test]
    fn timed_out_text_classifies_as_timeout() {
        assert_eq!(classify("request timed out after 30s", None), AdapterErrorKind::Timeout);
    }

    #[test]
    fn empty_output_text_classifies_correctly() {
        assert_eq!(
            classify("the model finished with no user-facing text output", None),
            AdapterErrorKind::EmptyOutput
        );
    }

    #[test]
    fn unmatched_message_classifies_as_transport() {
        assert_eq!(classify("internal server error", None), AdapterErrorKind::Transport);
    }

    #[test]
    fn structured_classification_wins_over_transport_default() {
        assert_eq!(
            classify("upstream said no", Some(UpstreamClassification::Billing)),
            AdapterErrorKind::ModelError { classification: ModelErrorClass::Billing }
        );
    }

    #[test]
    fn structured_transient_classes_map_to_model_transient() {
        assert_eq!(
            classify("rate limited", Some(UpstreamClassification::RateLimit)),
            AdapterErrorKind::ModelTransient
        );
        assert_eq!(
            classify("no capacity", Some(UpstreamClassification::Capacity)),
            AdapterErrorKind::ModelTransient
        );
    }

    #[test]
    fn tool_call_text_overrides_a_structured_model_classification() {
        let kind = classify(
            "failed_generation: malformed arguments",
            Some(UpstreamClassification::Internal),
        );
        assert_eq!(kind, AdapterErrorKind::ToolCallError);
    }

    #[test]
    fn elapsed_timeout_is_always_timeout() {
        assert_eq!(classify_elapsed_timeout(), AdapterErrorKind::Timeout);
    }

    #[test]
    fn retryability_matches_closed_taxonomy() {
        assert!(is_retryable(AdapterErrorKind::SessionInvalid));
        assert!(is_retryable(AdapterErrorKind::ToolCallError));
        assert!(is_retryable(AdapterErrorKind::Timeout));
        assert!(!is_retryable(AdapterErrorKind::Transport));
        assert!(!is_retryable(AdapterErrorKind::EmptyOutput));
        assert!(!is_retryable(AdapterErrorKind::ModelTransient));
        assert!(!is_retryable(AdapterErrorKind::ModelError { classification: ModelErrorClass::Internal }));
    }
}
