#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use chrono::Utc;
use tower::ServiceExt;

use agent_gateway::api;
use agent_gateway::config::Config;
use agent_gateway::driver::{Driver, LocalProcessDriver};
use agent_gateway::session::{Scope, Session, SessionManager, SessionStatus};
use agent_gateway::share::MemoryShareStore;
use agent_gateway::store::AppState;
use agent_gateway::webhook::store::MemoryWebhookStore;

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
}

/// Build an app over the local-process driver with test-friendly grace
/// windows. `mutate` tweaks the config before the state is built.
pub fn test_app(mutate: impl FnOnce(&mut Config)) -> TestApp {
    let mut cfg = Config::load();
    cfg.agent_command = "definitely-not-a-real-agent-binary".into();
    cfg.ready_grace = Duration::from_millis(400);
    cfg.stop_grace = Duration::from_millis(400);
    mutate(&mut cfg);

    let config = Arc::new(cfg);
    let driver = Arc::new(Driver::LocalProcess(LocalProcessDriver::new(config.clone())));
    let sessions = Arc::new(SessionManager::new(config.clone(), driver));
    let state = AppState::new(
        config,
        sessions,
        Arc::new(MemoryWebhookStore::new()),
        Arc::new(MemoryShareStore::new()),
    );
    let router = api::router(state.clone());
    TestApp { state, router }
}

/// An already-active session pointing at `addr` (host:port).
pub fn active_session(id: &str, user: &str, addr: &str, tags: &[(&str, &str)]) -> Session {
    Session {
        id: id.into(),
        user_id: user.into(),
        scope: Scope::User,
        team_id: None,
        status: SessionStatus::Active,
        addr: addr.into(),
        environment: HashMap::new(),
        tags: tags
            .iter()
            .map(|&(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
        started_at: Utc::now(),
        updated_at: Utc::now(),
        description: None,
        repository: None,
    }
}

/// Strip the scheme from a wiremock uri, leaving host:port.
pub fn upstream_addr(uri: &str) -> String {
    uri.trim_start_matches("http://").to_owned()
}

pub async fn send(router: &Router, req: Request<Body>) -> Response<Body> {
    router
        .clone()
        .oneshot(req)
        .await
        .expect("router call is infallible")
}

pub fn request(method: Method, uri: &str, user: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-auth-user", user);
    }
    builder.body(body).expect("request is well-formed")
}

pub fn json_request(
    method: Method,
    uri: &str,
    user: Option<&str>,
    body: &serde_json::Value,
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(user) = user {
        builder = builder.header("x-auth-user", user);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request is well-formed")
}

pub async fn body_json(resp: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body reads");
    serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
}

pub async fn body_string(resp: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body reads");
    String::from_utf8_lossy(&bytes).into_owned()
}
