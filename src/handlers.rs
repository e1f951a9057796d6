use axum::{
    Json,
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode},
};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::SharedState;
use crate::deploy::DeployEvent;
use crate::utils::verify_signature;
use crate::webhook::WebhookEvent;

/// Liveness endpoint for the listener itself.
pub async fn health() -> &'static str {
    "OK"
}

/// Anything that is not `POST /` or `GET /health`.
pub async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Handles the webhook POST request: decode, verify, dispatch.
///
/// Deploys are started fire-and-forget; the response never waits on them.
/// Their progress and outcome are only observable through the logs (and
/// the broadcast completion events).
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let event = match WebhookEvent::from_request(&headers, &body) {
        Ok(event) => event,
        Err(e) => {
            info!("Rejecting undecodable webhook delivery: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": e.to_string()})),
            );
        }
    };

    // Always verify against the canonical body: for form-encoded
    // deliveries the sender signed the extracted payload field, not the
    // outer envelope.
    let verified = verify_signature(
        state.config.webhook_secret.as_bytes(),
        &event.canonical_body,
        &event.signature_header,
    );
    if !verified {
        error!(
            "Signature verification failed for delivery '{}'",
            event.delivery_id
        );
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Invalid signature"})),
        );
    }

    if event.event_type == "ping" {
        info!("Ping from delivery '{}'", event.delivery_id);
        return (StatusCode::OK, Json(json!({"message": "pong"})));
    }

    if event.event_type == "push" && event.is_deploy_ref() {
        if let (Some(repository), Some(branch)) = (event.repository_name(), event.branch()) {
            let repository = repository.to_string();
            let branch = branch.to_string();
            info!(
                "Push to '{}' ({}) accepted, delivery '{}'",
                repository, branch, event.delivery_id
            );

            // Spawn the deploy so the webhook sender gets its response
            // within its delivery timeout, however long the deploy takes.
            let task_state = state.clone();
            let task_repo = repository.clone();
            let task_branch = branch.clone();
            tokio::spawn(async move {
                let outcome = task_state
                    .orchestrator
                    .deploy(&task_state.config, &task_repo, &task_branch)
                    .await;
                if outcome.success {
                    info!("{}", outcome.message);
                } else {
                    error!("Deploy of '{}' failed: {}", task_repo, outcome.message);
                }
                let _ = task_state
                    .deploy_events
                    .send(DeployEvent::new(task_repo, task_branch, &outcome));
            });

            return (
                StatusCode::OK,
                Json(json!({
                    "message": "Deployment started",
                    "repository": repository,
                    "branch": branch,
                })),
            );
        }
        warn!(
            "Push delivery '{}' carries no repository name, ignoring",
            event.delivery_id
        );
    }

    info!(
        "Ignoring '{}' event (ref {:?}), delivery '{}'",
        event.event_type,
        event.git_ref(),
        event.delivery_id
    );
    (
        StatusCode::OK,
        Json(json!({
            "message": "Event ignored",
            "event": event.event_type,
            "ref": event.git_ref(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::Orchestrator;
    use crate::deploy::testing::{FakeProbe, FakeRunner};
    use crate::{AppState, DeployConfig, DeployTarget};
    use axum::http::HeaderValue;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use std::sync::Arc;
    use std::time::Duration;

    const SECRET: &str = "test-secret";

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn state_with_runner(runner: Arc<FakeRunner>) -> SharedState {
        let config = DeployConfig {
            webhook_secret: SECRET.to_string(),
            targets: vec![DeployTarget {
                repository: "Backend".to_string(),
                service: "api".to_string(),
                repo_path: "/srv/backend".to_string(),
                health_url: "http://127.0.0.1:8000/health".to_string(),
            }],
        };
        let orchestrator = Arc::new(Orchestrator::with_parts(
            runner,
            Arc::new(FakeProbe { result: Ok(200) }),
            Duration::ZERO,
        ));
        Arc::new(AppState::new(config, orchestrator))
    }

    fn push_headers(signature: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Content-Type", HeaderValue::from_static("application/json"));
        headers.insert("X-GitHub-Event", HeaderValue::from_static("push"));
        headers.insert("X-GitHub-Delivery", HeaderValue::from_static("d-1"));
        headers.insert(
            "X-Hub-Signature-256",
            HeaderValue::from_str(signature).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn push_to_main_starts_a_deploy() {
        let runner = Arc::new(FakeRunner::ok());
        let state = state_with_runner(runner.clone());
        let mut completions = state.deploy_events.subscribe();

        let body = br#"{"ref":"refs/heads/main","repository":{"name":"Backend"}}"#;
        let headers = push_headers(&sign(SECRET, body));

        let (status, Json(resp)) =
            handle_webhook(AxumState(state), headers, Bytes::from_static(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["message"], "Deployment started");
        assert_eq!(resp["repository"], "Backend");
        assert_eq!(resp["branch"], "main");

        // The deploy runs detached; await its completion event.
        let event = tokio::time::timeout(Duration::from_secs(5), completions.recv())
            .await
            .expect("deploy did not finish")
            .unwrap();
        assert!(event.success);
        assert_eq!(event.repository, "Backend");

        let calls = runner.recorded();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].contains("git pull origin main"));
        assert!(calls[1].contains("migrate"));
        assert!(calls[2].contains("--no-deps api"));
    }

    #[tokio::test]
    async fn ping_returns_pong_without_deploying() {
        let runner = Arc::new(FakeRunner::ok());
        let state = state_with_runner(runner.clone());

        let body = br#"{"zen":"Keep it simple."}"#;
        let mut headers = push_headers(&sign(SECRET, body));
        headers.insert("X-GitHub-Event", HeaderValue::from_static("ping"));

        let (status, Json(resp)) =
            handle_webhook(AxumState(state), headers, Bytes::from_static(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["message"], "pong");
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn bad_signature_is_401_and_runs_nothing() {
        let runner = Arc::new(FakeRunner::ok());
        let state = state_with_runner(runner.clone());

        let body = br#"{"ref":"refs/heads/main","repository":{"name":"Backend"}}"#;
        let headers = push_headers(&sign("wrong-secret", body));

        let (status, _) =
            handle_webhook(AxumState(state), headers, Bytes::from_static(body)).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn missing_signature_header_is_401() {
        let runner = Arc::new(FakeRunner::ok());
        let state = state_with_runner(runner);

        let body = br#"{"ref":"refs/heads/main","repository":{"name":"Backend"}}"#;
        let mut headers = push_headers("sha256=00");
        headers.remove("X-Hub-Signature-256");

        let (status, _) =
            handle_webhook(AxumState(state), headers, Bytes::from_static(body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn push_to_other_branch_is_ignored() {
        let runner = Arc::new(FakeRunner::ok());
        let state = state_with_runner(runner.clone());

        let body = br#"{"ref":"refs/heads/develop","repository":{"name":"Backend"}}"#;
        let headers = push_headers(&sign(SECRET, body));

        let (status, Json(resp)) =
            handle_webhook(AxumState(state), headers, Bytes::from_static(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["message"], "Event ignored");
        assert_eq!(resp["event"], "push");
        assert_eq!(resp["ref"], "refs/heads/develop");
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn other_events_are_ignored() {
        let runner = Arc::new(FakeRunner::ok());
        let state = state_with_runner(runner.clone());

        let body = br#"{"action":"opened"}"#;
        let mut headers = push_headers(&sign(SECRET, body));
        headers.insert("X-GitHub-Event", HeaderValue::from_static("issues"));

        let (status, Json(resp)) =
            handle_webhook(AxumState(state), headers, Bytes::from_static(body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["message"], "Event ignored");
        assert_eq!(resp["event"], "issues");
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_400_not_a_crash() {
        let runner = Arc::new(FakeRunner::ok());
        let state = state_with_runner(runner.clone());

        let body: &[u8] = b"{definitely not json";
        let headers = push_headers(&sign(SECRET, body));

        let (status, _) =
            handle_webhook(AxumState(state), headers, Bytes::from_static(body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn form_encoded_delivery_verifies_against_payload_field() {
        let runner = Arc::new(FakeRunner::ok());
        let state = state_with_runner(runner.clone());
        let mut completions = state.deploy_events.subscribe();

        let inner = r#"{"ref":"refs/heads/master","repository":{"name":"Backend"}}"#;
        let form: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("payload", inner)
            .finish();

        // GitHub signs the extracted payload string, not the form body.
        let mut headers = push_headers(&sign(SECRET, inner.as_bytes()));
        headers.insert(
            "Content-Type",
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let (status, Json(resp)) =
            handle_webhook(AxumState(state), headers, Bytes::from(form)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(resp["message"], "Deployment started");
        assert_eq!(resp["branch"], "master");

        let event = tokio::time::timeout(Duration::from_secs(5), completions.recv())
            .await
            .expect("deploy did not finish")
            .unwrap();
        assert!(event.success);
    }

    #[tokio::test]
    async fn form_encoded_signature_over_outer_body_fails() {
        let runner = Arc::new(FakeRunner::ok());
        let state = state_with_runner(runner.clone());

        let inner = r#"{"ref":"refs/heads/main","repository":{"name":"Backend"}}"#;
        let form: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("payload", inner)
            .finish();

        let mut headers = push_headers(&sign(SECRET, form.as_bytes()));
        headers.insert(
            "Content-Type",
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let (status, _) = handle_webhook(AxumState(state), headers, Bytes::from(form)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(runner.recorded().is_empty());
    }

    #[tokio::test]
    async fn empty_secret_rejects_everything() {
        let runner = Arc::new(FakeRunner::ok());
        let config = DeployConfig {
            webhook_secret: String::new(),
            targets: Vec::new(),
        };
        let orchestrator = Arc::new(Orchestrator::with_parts(
            runner.clone(),
            Arc::new(FakeProbe { result: Ok(200) }),
            Duration::ZERO,
        ));
        let state = Arc::new(AppState::new(config, orchestrator));

        let body = br#"{"ref":"refs/heads/main","repository":{"name":"Backend"}}"#;
        // Signed with the empty secret: still must be rejected.
        let headers = push_headers(&sign("", body));

        let (status, _) =
            handle_webhook(AxumState(state), headers, Bytes::from_static(body)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(runner.recorded().is_empty());
    }
}
