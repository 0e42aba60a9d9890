use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{AppendHeaders, IntoResponse};
use axum::Json;
use futures_util::Stream;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;

use crate::refresh::TriggerSource;
use crate::render;
use crate::state::{RefreshSummary, SseEvent};

use super::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Checks a GitHub-style `X-Hub-Signature-256` header against the payload.
/// The comparison is constant-time.
pub fn verify_signature(secret: &str, payload: &[u8], sig_header: &str) -> bool {
    let Some(hex_sig) = sig_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&sig).is_ok()
}

/// GET / renders the plain-text status page.
pub async fn root(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let repo = render::RepoInfo {
        url: state.config.git_repo_url.clone(),
        revision: state.config.git_revision.clone(),
        deploy_dir: state.config.git_deploy_dir.clone(),
    };

    match state.docker.container_count(&state.shutdown).await {
        Ok(count) => (
            StatusCode::OK,
            render::status_page(&state.config.project_name, count, Some(&repo)),
        ),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /api/webhook enqueues a webhook-sourced refresh after the optional
/// HMAC signature check.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !state.config.webhook_secret.is_empty() {
        let sig_header = headers
            .get("X-Hub-Signature-256")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");
        if sig_header.is_empty() {
            log::warn!("webhook rejected: missing X-Hub-Signature-256 header");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "missing signature header"})),
            );
        }
        if !verify_signature(&state.config.webhook_secret, &body, sig_header) {
            log::warn!("webhook rejected: invalid HMAC signature");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid signature"})),
            );
        }
    }

    let result = state.refresh.request_refresh(TriggerSource::Webhook);
    log::info!("webhook refresh {}", result.as_str());
    (
        StatusCode::OK,
        Json(json!({
            "status": result.as_str(),
            "message": format!("webhook refresh {}", result.as_str()),
        })),
    )
}

/// POST /api/refresh enqueues a manual refresh.
pub async fn manual_refresh(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = state.refresh.request_refresh(TriggerSource::Manual);
    log::info!("manual refresh {}", result.as_str());
    Json(json!({
        "status": result.as_str(),
        "message": format!("manual refresh {}", result.as_str()),
    }))
}

/// GET /api/refresh-status returns the store's refresh projection. Before
/// the first refresh the status reads as queued.
pub async fn refresh_status(State(state): State<Arc<AppState>>) -> Json<RefreshSummary> {
    Json(
        state
            .store
            .get_refresh_status()
            .unwrap_or_default(),
    )
}

/// GET /api/stacks returns the stack records (compose content excluded).
pub async fn stacks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.get_stacks())
}

/// GET /api/stacks/{*path} lists the containers of one stack.
pub async fn stack_containers(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> impl IntoResponse {
    let stack_path = path.trim_start_matches('/');
    if stack_path.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "stack path is required"})),
        )
            .into_response();
    }

    match state.reconciler.get_containers(&state.shutdown, stack_path).await {
        Ok(containers) => Json(containers).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub stack_path: String,
}

/// POST /api/reconcile/ack records an operator acknowledgement and runs an
/// immediate reconcile cycle.
pub async fn acknowledge(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AckRequest>,
) -> impl IntoResponse {
    if req.stack_path.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "stack_path is required"})),
        );
    }

    state.acks.acknowledge(&req.stack_path);
    log::info!("acknowledged drift for stack {}", req.stack_path);

    let runs = state.reconciler.reconcile(&state.shutdown).await;
    let status = runs
        .iter()
        .find(|run| run.stack_path == req.stack_path)
        .map(|run| run.result.as_str())
        .unwrap_or("acknowledged");

    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "stack_path": req.stack_path,
            "message": format!("drift acknowledged for {}", req.stack_path),
        })),
    )
}

fn sse_frame(event: SseEvent) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.event.as_str())
        .data(event.data)
}

/// GET /api/events streams state changes as Server-Sent Events. The first
/// frame is a full stack snapshot; the connection closes on client
/// disconnect or server shutdown.
pub async fn events(
    State(state): State<Arc<AppState>>,
) -> (
    AppendHeaders<[(header::HeaderName, &'static str); 3]>,
    Sse<impl Stream<Item = Result<Event, Infallible>>>,
) {
    let subscription = state.broadcaster.subscribe();
    state
        .broadcaster
        .publish_stack_snapshot(&state.store.get_stacks());

    let stream = futures_util::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.events.recv().await?;
        Some((Ok(sse_frame(event)), subscription))
    });

    (
        AppendHeaders([
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ]),
        Sse::new(stream),
    )
}
