pub mod sessions;
pub mod shares;
pub mod webhooks;

use axum::extract::Request;
use axum::http::header::{HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::proxy;
use crate::store::AppState;
use crate::webhook;

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/start", post(sessions::start_session))
        .route("/search", get(sessions::search_sessions))
        .route("/sessions/{session_id}", delete(sessions::delete_session))
        .route(
            "/sessions/{session_id}/share",
            post(shares::create_share)
                .get(shares::get_share)
                .delete(shares::delete_share),
        )
        .route(
            "/webhooks",
            get(webhooks::list_webhooks).post(webhooks::create_webhook),
        )
        .route(
            "/webhooks/{id}",
            get(webhooks::get_webhook)
                .put(webhooks::update_webhook)
                .delete(webhooks::delete_webhook),
        )
        .route("/webhooks/{id}/deliveries", get(webhooks::list_deliveries))
        .route("/hooks/github/{id}", post(webhook::github::ingress))
        .route("/hooks/custom/{id}", post(webhook::custom::ingress))
        .route("/s/{token}", any(shares::shared_dispatch_root))
        .route("/s/{token}/{*rest}", any(shares::shared_dispatch))
        .route("/{session_id}", any(proxy::dispatch_root))
        .route("/{session_id}/{*rest}", any(proxy::dispatch))
        .layer(middleware::from_fn(cors))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

/// Permissive CORS on every response; preflight is answered here with 204
/// and never reaches a handler.
async fn cors(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(resp.headers_mut());
        return resp;
    }
    let mut resp = next.run(req).await;
    apply_cors_headers(resp.headers_mut());
    resp
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, PUT, PATCH, DELETE, OPTIONS, HEAD"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "access-control-allow-credentials",
        HeaderValue::from_static("true"),
    );
    headers.insert("access-control-max-age", HeaderValue::from_static("86400"));
}
