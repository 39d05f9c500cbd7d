// SPDX-License-Identifier: Apache-2.0
//! An HTTP-backed [`ModelPort`]: posts each turn to a configurable
//! endpoint and maps the JSON response (or error) back onto
//! `chatrelay-core`'s adapter types.
//!
//! The wire format is intentionally small — this crate is the seam between
//! the relay's turn-execution state machine and whatever stateful agent
//! backend actually runs the model, so it speaks the minimal contract the
//! rest of the relay needs rather than any one vendor's native API shape.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use chatrelay_core::{
    AdapterError, AdapterErrorKind, ModelErrorClass, ModelPort, SessionKey, TurnRequest,
    TurnResponse,
};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the agent backend, e.g. `http://127.0.0.1:8900`.
    pub base_url: String,
    /// Bearer token sent as `Authorization: Bearer <token>`, if set.
    pub api_key: Option<String>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    chat_id: &'a str,
    thread_id: Option<&'a str>,
    workspace_path: &'a str,
    resume_token: Option<&'a str>,
    input: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireResponse {
    Ok {
        output: String,
        resume_token: Option<String>,
    },
    Err {
        error: WireError,
    },
}

#[derive(Deserialize)]
struct WireError {
    kind: String,
    message: String,
    /// Present only when `kind == "model_error"`: one of
    /// `billing`/`auth`/`internal`/`max_steps`/`aborted`.
    #[serde(default)]
    classification: Option<String>,
}

fn wire_classification_to_model_error_class(classification: &str) -> ModelErrorClass {
    match classification {
        "billing" => ModelErrorClass::Billing,
        "auth" => ModelErrorClass::Auth,
        "max_steps" => ModelErrorClass::MaxSteps,
        "aborted" => ModelErrorClass::Aborted,
        _ => ModelErrorClass::Internal,
    }
}

fn wire_error_to_adapter_kind(error: &WireError) -> AdapterErrorKind {
    match error.kind.as_str() {
        "session_invalid" => AdapterErrorKind::SessionInvalid,
        "tool_call_error" => AdapterErrorKind::ToolCallError,
        "timeout" => AdapterErrorKind::Timeout,
        "empty_output" => AdapterErrorKind::EmptyOutput,
        "model_transient" => AdapterErrorKind::ModelTransient,
        "model_error" => AdapterErrorKind::ModelError {
            classification: error
                .classification
                .as_deref()
                .map(wire_classification_to_model_error_class)
                .unwrap_or(ModelErrorClass::Internal),
        },
        _ => AdapterErrorKind::Transport,
    }
}

pub struct HttpModelAdapter {
    client: reqwest::Client,
    config: AgentConfig,
}

impl HttpModelAdapter {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ModelPort for HttpModelAdapter {
    async fn run_turn(&self, request: TurnRequest) -> Result<TurnResponse, AdapterError> {
        let (chat_id, thread_id) = request.session_key.topic.parts();
        let body = WireRequest {
            chat_id,
            thread_id,
            workspace_path: &request.session_key.workspace_path,
            resume_token: request.resume_token.as_deref(),
            input: &request.input,
        };

        let mut builder = self
            .client
            .post(format!("{}/turns", self.config.base_url))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(chat_id, "dispatching turn to agent backend");
        let response = builder.send().await.map_err(|err| {
            AdapterError::new(AdapterErrorKind::Transport, format!("request failed: {err}"))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let kind = if status.as_u16() == 408 || status.as_u16() == 504 {
                AdapterErrorKind::Timeout
            } else {
                AdapterErrorKind::Transport
            };
            return Err(AdapterError::new(kind, format!("http {status}: {text}")));
        }

        let wire: WireResponse = response.json().await.map_err(|err| {
            AdapterError::new(
                AdapterErrorKind::Transport,
                format!("malformed agent response: {err}"),
            )
        })?;

        match wire {
            WireResponse::Ok { output, resume_token } => Ok(TurnResponse { output, resume_token }),
            WireResponse::Err { error } => {
                let kind = wire_error_to_adapter_kind(&error);
                Err(AdapterError::new(kind, error.message))
            }
        }
    }

    async fn reset_session(&self, session_key: &SessionKey) -> Result<(), AdapterError> {
        let (chat_id, thread_id) = session_key.topic.parts();
        let mut builder = self.client.post(format!("{}/sessions/reset", self.config.base_url)).json(
            &WireRequest {
                chat_id,
                thread_id,
                workspace_path: &session_key.workspace_path,
                resume_token: None,
                input: "",
            },
        );
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        // Best-effort: adapters with no server-side state to reset may not
        // even expose this endpoint, so a transport failure here is logged
        // by the caller, not treated as fatal to the retry.
        let _ = builder.send().await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        let mut builder = self.client.get(format!("{}/healthz", self.config.base_url));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
            .send()
            .await
            .map_err(|err| AdapterError::new(AdapterErrorKind::Transport, format!("ping failed: {err}")))?
            .error_for_status()
            .map_err(|err| AdapterError::new(AdapterErrorKind::Transport, format!("ping unhealthy: {err}")))?;
        Ok(())
    }
}
