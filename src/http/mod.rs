//! HTTP surface: status page, refresh triggers, state endpoints, and the
//! SSE event stream.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::config::Config;
use crate::docker;
use crate::reconcile::{AckStore, Reconciler};
use crate::refresh;
use crate::signals::Shutdown;
use crate::state::{Broadcaster, Store};

mod handlers;

pub use handlers::verify_signature;

/// Shared state for all handlers.
pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub refresh: Arc<refresh::Service>,
    pub reconciler: Arc<Reconciler>,
    pub acks: Arc<AckStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub docker: docker::Client,
    /// Cancellation token passed into orchestrator calls made on behalf of
    /// HTTP requests.
    pub shutdown: Shutdown,
}

/// Builds the router with all routes registered.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/api/webhook", post(handlers::webhook))
        .route("/api/refresh", post(handlers::manual_refresh))
        .route("/api/refresh-status", get(handlers::refresh_status))
        .route("/api/stacks", get(handlers::stacks))
        .route("/api/stacks/{*path}", get(handlers::stack_containers))
        .route("/api/reconcile/ack", post(handlers::acknowledge))
        .route("/api/events", get(handlers::events))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::test_support::ScriptedRunner;
    use crate::docker::CommandError;
    use crate::events::EventBus;
    use crate::git::{ComposeReader, GitError, RepoContents};
    use crate::reconcile::{
        ComposeRunner, ContainerInspector, OrchestratorError, ReconciliationPolicy,
        StackSyncMetadata, StateManager,
    };
    use crate::refresh::TriggerQueue;
    use crate::state::{ContainerInfo, Snapshot, SseEventType, StackRecord};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use std::collections::HashMap;
    use std::path::Path;
    use tower::ServiceExt;

    struct NullReader;

    #[async_trait]
    impl ComposeReader for NullReader {
        async fn read_compose_files(
            &self,
            _cancel: &Shutdown,
            _repo_url: &str,
            _token: &str,
            _revision: &str,
            _deploy_dir: &str,
        ) -> Result<RepoContents, GitError> {
            Err(GitError::RefNotFound("unused".to_string()))
        }
    }

    struct NoopCompose;

    #[async_trait]
    impl ComposeRunner for NoopCompose {
        async fn compose_up(
            &self,
            _cancel: &Shutdown,
            _project_name: &str,
            _compose_file: &Path,
            _override_file: Option<&Path>,
            _work_dir: Option<&Path>,
        ) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn compose_down(
            &self,
            _cancel: &Shutdown,
            _project_name: &str,
        ) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn compose_ps(
            &self,
            _cancel: &Shutdown,
            _project_name: &str,
        ) -> Result<Vec<ContainerInfo>, OrchestratorError> {
            Ok(Vec::new())
        }
    }

    struct EmptyInspector;

    #[async_trait]
    impl ContainerInspector for EmptyInspector {
        async fn stack_labels(
            &self,
            _cancel: &Shutdown,
        ) -> Result<HashMap<String, StackSyncMetadata>, CommandError> {
            Ok(HashMap::new())
        }
    }

    fn test_config(webhook_secret: &str) -> Config {
        let secret = webhook_secret.to_string();
        Config::from_lookup(move |key| match key {
            "GIT_REPO_URL" => Some("https://github.com/acme/deploy.git".to_string()),
            "GIT_ACCESS_TOKEN" => Some("token".to_string()),
            "GIT_REVISION" => Some("main".to_string()),
            "PROJECT_NAME" => Some("Test-CD".to_string()),
            "WEBHOOK_SECRET" if !secret.is_empty() => Some(secret.clone()),
            _ => None,
        })
        .unwrap()
    }

    fn test_state(webhook_secret: &str) -> Arc<AppState> {
        let config = test_config(webhook_secret);
        let store = Arc::new(Store::new());
        let broadcaster = Arc::new(Broadcaster::new());
        let queue = Arc::new(TriggerQueue::new());
        let event_bus = Arc::new(EventBus::new());
        let acks = Arc::new(AckStore::new());

        let compose: Arc<dyn ComposeRunner> = Arc::new(NoopCompose);
        let state_manager = Arc::new(StateManager::new(
            Arc::clone(&store),
            Arc::clone(&compose),
            Arc::clone(&event_bus),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            ReconciliationPolicy::default(),
            compose,
            Arc::new(EmptyInspector),
            Arc::clone(&acks),
            state_manager,
            Arc::clone(&event_bus),
            "",
        ));

        let refresh = Arc::new(refresh::Service::new(
            config.clone(),
            Arc::clone(&store),
            queue,
            Arc::new(NullReader),
        ));

        let runner = Arc::new(ScriptedRunner::new(vec![Ok("abc\n".to_string())]));
        Arc::new(AppState {
            config,
            store,
            refresh,
            reconciler,
            acks,
            broadcaster,
            docker: docker::Client::new(runner, ""),
            shutdown: Shutdown::none(),
        })
    }

    async fn send(
        state: &Arc<AppState>,
        method: Method,
        uri: &str,
        body: Option<serde_json::Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::String(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
        };
        (status, value)
    }

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[tokio::test]
    async fn webhook_without_secret_triggers_refresh() {
        let state = test_state("");
        let (status, body) = send(
            &state,
            Method::POST,
            "/api/webhook",
            Some(serde_json::json!({"ref": "refs/heads/main"})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "refreshing");
    }

    #[tokio::test]
    async fn webhook_missing_signature_rejected() {
        let state = test_state("hunter2");
        let (status, body) = send(
            &state,
            Method::POST,
            "/api/webhook",
            Some(serde_json::json!({})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing signature header");
    }

    #[tokio::test]
    async fn webhook_invalid_signature_rejected() {
        let state = test_state("hunter2");
        let (status, _) = send(
            &state,
            Method::POST,
            "/api/webhook",
            Some(serde_json::json!({})),
            &[("X-Hub-Signature-256", "sha256=deadbeef")],
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn webhook_valid_signature_accepted() {
        let state = test_state("hunter2");
        let payload = serde_json::json!({"ref": "refs/heads/main"});
        let signature = sign("hunter2", payload.to_string().as_bytes());

        let (status, body) = send(
            &state,
            Method::POST,
            "/api/webhook",
            Some(payload),
            &[("X-Hub-Signature-256", signature.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "refreshing");
    }

    #[tokio::test]
    async fn signature_verification_is_exact() {
        assert!(verify_signature("s", b"body", &sign("s", b"body")));
        assert!(!verify_signature("s", b"body", &sign("s", b"tampered")));
        assert!(!verify_signature("s", b"body", &sign("other", b"body")));
        assert!(!verify_signature("s", b"body", "not-a-signature"));
        assert!(!verify_signature("s", b"body", "sha256=zz"));
    }

    #[tokio::test]
    async fn refresh_status_defaults_to_queued() {
        let state = test_state("");
        let (status, body) = send(&state, Method::GET, "/api/refresh-status", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["refreshStatus"], "queued");
    }

    #[tokio::test]
    async fn stacks_endpoint_returns_records_without_content() {
        let state = test_state("");
        state.store.set(Snapshot {
            revision: "abc123".into(),
            stacks: vec![StackRecord {
                path: "myapp".into(),
                compose_file: "docker-compose.yml".into(),
                compose_hash: "hash1".into(),
                content: b"top secret bytes".to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        });

        let (status, body) = send(&state, Method::GET, "/api/stacks", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["path"], "myapp");
        assert_eq!(body[0]["composeHash"], "hash1");
        assert!(body.to_string().find("top secret").is_none());
    }

    #[tokio::test]
    async fn ack_requires_stack_path() {
        let state = test_state("");
        let (status, _) = send(
            &state,
            Method::POST,
            "/api/reconcile/ack",
            Some(serde_json::json!({"stack_path": ""})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ack_records_and_reconciles() {
        let state = test_state("");
        let (status, body) = send(
            &state,
            Method::POST,
            "/api/reconcile/ack",
            Some(serde_json::json!({"stack_path": "myapp"})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stack_path"], "myapp");
        // No snapshot yet, so the cycle acted on nothing.
        assert_eq!(body["status"], "acknowledged");
    }

    #[tokio::test]
    async fn root_renders_status_page() {
        let state = test_state("");
        let (status, body) = send(&state, Method::GET, "/", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        let page = body.as_str().unwrap();
        assert!(page.contains("Test-CD"));
        assert!(page.contains("Running containers: 1"));
        assert!(!page.contains("token"));
    }

    #[tokio::test]
    async fn connecting_to_events_emits_a_snapshot_frame() {
        let state = test_state("");
        let mut observer = state.broadcaster.subscribe();

        // Drive the SSE handler; the response stream itself stays open, but
        // the snapshot publish is observable on any subscriber.
        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/events")
            .body(Body::empty())
            .unwrap();
        let response = router(Arc::clone(&state)).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap(),
            "text/event-stream"
        );
        assert_eq!(
            response.headers().get("x-accel-buffering").unwrap(),
            "no"
        );

        let frame = observer.events.try_recv().unwrap();
        assert_eq!(frame.event, SseEventType::StackSnapshot);
    }
}
