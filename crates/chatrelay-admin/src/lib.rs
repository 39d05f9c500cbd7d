// SPDX-License-Identifier: Apache-2.0
//! Read-only admin HTTP surface: session and turn-history introspection,
//! plus a live load snapshot. Bound to loopback by default — see
//! `AdminConfig::bind` — since this surface carries no authentication of
//! its own and is meant for local operator access, not public exposure.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use chatrelay_core::{MetricsSource, SessionStoreLike};

struct AdminState {
    store: Arc<dyn SessionStoreLike>,
    metrics: Arc<dyn MetricsSource>,
}

pub fn build_router(
    store: Arc<dyn SessionStoreLike>,
    metrics: Arc<dyn MetricsSource>,
) -> Router {
    let state = Arc::new(AdminState { store, metrics });
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/:topic_key", get(get_session))
        .route("/turns", get(list_turns))
        .route("/metrics", get(get_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct SessionView {
    topic: String,
    workspace_path: String,
    status: String,
    last_active_unix_ms: i64,
    retry_count: u32,
}

async fn list_sessions(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    match state.store.list_sessions().await {
        Ok(sessions) => {
            let views: Vec<SessionView> = sessions
                .into_iter()
                .map(|(key, session)| SessionView {
                    topic: key.topic.as_str().to_string(),
                    workspace_path: key.workspace_path,
                    status: format!("{:?}", session.status),
                    last_active_unix_ms: session.last_active_unix_ms,
                    retry_count: session.retry_count,
                })
                .collect();
            Json(views).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn get_session(
    State(state): State<Arc<AdminState>>,
    Path(topic_key): Path<String>,
) -> impl IntoResponse {
    match state.store.list_sessions().await {
        Ok(sessions) => {
            let found = sessions
                .into_iter()
                .find(|(key, _)| key.topic.as_str() == topic_key || key.to_string() == topic_key);
            match found {
                Some((key, session)) => Json(SessionView {
                    topic: key.topic.as_str().to_string(),
                    workspace_path: key.workspace_path,
                    status: format!("{:?}", session.status),
                    last_active_unix_ms: session.last_active_unix_ms,
                    retry_count: session.retry_count,
                })
                .into_response(),
                None => (StatusCode::NOT_FOUND, "no such session").into_response(),
            }
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[derive(serde::Deserialize, Default)]
struct TurnsQuery {
    session_key: Option<String>,
    limit: Option<usize>,
}

async fn list_turns(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<TurnsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(200);
    match state.store.recent_turn_events(limit).await {
        Ok(events) => {
            let events = match &query.session_key {
                Some(wanted) => events
                    .into_iter()
                    .filter(|e| e.session_key.to_string().contains(wanted.as_str()))
                    .collect(),
                None => events,
            };
            Json(events).into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

async fn get_metrics(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    Json(state.metrics.snapshot().await)
}
