use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::header::{
    CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName, HeaderValue,
};
use axum::http::{Method, Uri};
use axum::response::Response;

use crate::auth::OptionalAuthContext;
use crate::error::ApiError;
use crate::session::Session;
use crate::store::AppState;

/// Description captured from a session's first message is clipped to this.
const DESCRIPTION_MAX_CHARS: usize = 80;

// ---------------------------------------------------------------------------
// Handlers: ANY /{sessionID} and ANY /{sessionID}/{rest...}
// ---------------------------------------------------------------------------

pub async fn dispatch_root(
    State(state): State<AppState>,
    auth: OptionalAuthContext,
    Path(session_id): Path<String>,
    req: Request,
) -> Result<Response, ApiError> {
    dispatch_inner(state, auth, session_id, String::new(), req).await
}

pub async fn dispatch(
    State(state): State<AppState>,
    auth: OptionalAuthContext,
    Path((session_id, rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response, ApiError> {
    dispatch_inner(state, auth, session_id, rest, req).await
}

async fn dispatch_inner(
    state: AppState,
    auth: OptionalAuthContext,
    session_id: String,
    rest: String,
    req: Request,
) -> Result<Response, ApiError> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))?;

    // OPTIONS is CORS preflight and passes unchecked; everything else
    // requires an authorization context that can see the session.
    if req.method() != Method::OPTIONS {
        let ctx = auth.0.ok_or(ApiError::Unauthorized)?;
        if !ctx.can_access_resource(&session.user_id, session.scope, session.team_id.as_deref()) {
            return Err(ApiError::Forbidden);
        }
    }

    let req = capture_message_side_effect(&state, &session, &rest, req).await?;

    forward(&state, &session, &rest, req, &[]).await
}

/// POST to the agent's message endpoint bumps `updated_at` and may capture
/// a session description from the first message. The body is buffered and
/// restored for the downstream call.
async fn capture_message_side_effect(
    state: &AppState,
    session: &Session,
    rest: &str,
    req: Request,
) -> Result<Request, ApiError> {
    let is_message_post =
        req.method() == Method::POST && (rest == "message" || rest.ends_with("/message"));
    if !is_message_post {
        return Ok(req);
    }

    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read request body: {e}")))?;

    let description = extract_description(&bytes);
    state.sessions.touch_updated_at(&session.id, description);

    Ok(Request::from_parts(parts, Body::from(bytes)))
}

fn extract_description(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let content = value.get("content")?.as_str()?;
    let first_line = content.lines().next()?.trim();
    if first_line.is_empty() {
        return None;
    }
    Some(first_line.chars().take(DESCRIPTION_MAX_CHARS).collect())
}

// ---------------------------------------------------------------------------
// Streaming forwarder
// ---------------------------------------------------------------------------

/// Forward the request to the session's backend, streaming the response
/// back. Shared by the session dispatcher and the read-only share variant.
pub async fn forward(
    state: &AppState,
    session: &Session,
    rest: &str,
    mut req: Request,
    extra_headers: &[(HeaderName, HeaderValue)],
) -> Result<Response, ApiError> {
    let path = if rest.is_empty() {
        "/".to_owned()
    } else {
        format!("/{rest}")
    };
    let path_and_query = match req.uri().query() {
        Some(q) => format!("{path}?{q}"),
        None => path,
    };
    let uri: Uri = format!("http://{}{path_and_query}", session.addr)
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid upstream path: {e}")))?;

    let original_host = req.headers().get(HOST).cloned();

    *req.uri_mut() = uri;
    let headers = req.headers_mut();
    headers.remove(HOST);
    headers.remove(CONNECTION);
    if let Some(host) = original_host {
        headers.insert(HeaderName::from_static("x-forwarded-host"), host);
    }
    // This hop never terminates TLS, so the proto is always http. A
    // client-supplied X-Forwarded-Proto is an unverified claim and must not
    // reach the backend.
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );
    for (name, value) in extra_headers {
        headers.insert(name.clone(), value.clone());
    }

    let resp = state.upstream.request(req).await.map_err(|e| {
        tracing::warn!(session_id = %session.id, addr = %session.addr, error = %e, "upstream request failed");
        ApiError::UpstreamUnavailable(format!("session backend unreachable: {e}"))
    })?;

    let (mut parts, body) = resp.into_parts();

    // SSE responses must reach the client unbuffered and unsized.
    let is_event_stream = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));
    if is_event_stream {
        parts.headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        parts.headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        parts.headers.remove(CONTENT_LENGTH);
    }

    Ok(Response::from_parts(parts, Body::new(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_from_first_line() {
        let body = br#"{"content":"Fix the login bug\nIt crashes on empty passwords","type":"user"}"#;
        assert_eq!(
            extract_description(body),
            Some("Fix the login bug".to_owned())
        );
    }

    #[test]
    fn description_clipped() {
        let long = "x".repeat(200);
        let body = serde_json::json!({ "content": long }).to_string();
        assert_eq!(
            extract_description(body.as_bytes()).unwrap().chars().count(),
            DESCRIPTION_MAX_CHARS
        );
    }

    #[test]
    fn description_absent_for_non_json() {
        assert_eq!(extract_description(b"not json"), None);
        assert_eq!(extract_description(br#"{"other":"field"}"#), None);
        assert_eq!(extract_description(br#"{"content":"   "}"#), None);
    }
}
