use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tower::ServiceExt;

use carver_core::config::CarverConfig;
use carver_core::model::ScheduledCarve;

use crate::state::AppState;

pub const NODE: &str = "node-a";
pub const ENV: &str = "prod";

/// Create a wired-up router and AppState with an in-memory record store and
/// inline chunk storage. Archives land under the returned temp directory.
pub fn setup_app() -> (Router, AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("create tempdir");
    let mut config = CarverConfig {
        carves_dir: tmp.path().join("carves"),
        ..Default::default()
    };
    config.nodes.insert(NODE.to_string(), ENV.to_string());
    config.nodes.insert("node-dev".to_string(), "dev".to_string());

    let state = AppState::from_config(&config).expect("build state");
    let router = super::router(state.clone());
    (router, state, tmp)
}

/// Schedule a carve of `/etc/hosts` on [`NODE`] directly through the state.
pub fn schedule(state: &AppState, carve_id: &str, request_id: &str) {
    state
        .inner
        .sessions
        .schedule(ScheduledCarve {
            carve_id: carve_id.to_string(),
            request_id: request_id.to_string(),
            node_uuid: NODE.to_string(),
            environment: ENV.to_string(),
            query_name: format!("carve_{carve_id}"),
            path: "/etc/hosts".to_string(),
        })
        .expect("schedule carve");
}

pub fn b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Send a POST request with a JSON body.
pub async fn post_json(
    router: Router,
    path: &str,
    body: serde_json::Value,
) -> axum::response::Response {
    post_raw(router, path, serde_json::to_vec(&body).unwrap()).await
}

/// Send a POST request with the given body bytes, labelled as JSON.
pub async fn post_raw(router: Router, path: &str, body: Vec<u8>) -> axum::response::Response {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("Content-Type", "application/json")
        .body(Body::from(body))
        .unwrap();

    router.oneshot(req).await.unwrap()
}

pub async fn get(router: Router, path: &str) -> axum::response::Response {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();

    router.oneshot(req).await.unwrap()
}

pub async fn delete(router: Router, path: &str) -> axum::response::Response {
    let req = Request::builder()
        .method("DELETE")
        .uri(path)
        .body(Body::empty())
        .unwrap();

    router.oneshot(req).await.unwrap()
}

/// Read full response body into `Vec<u8>`.
pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("collect body")
        .to_vec()
}

/// Assert response has expected status.
pub fn assert_status(response: &axum::response::Response, expected: StatusCode) {
    assert_eq!(
        response.status(),
        expected,
        "expected {expected}, got {}",
        response.status()
    );
}
