use axum::extract::{Path, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::proxy;
use crate::share::{Share, ShareStore, generate_token};
use crate::store::AppState;

// ---------------------------------------------------------------------------
// Share management
// ---------------------------------------------------------------------------

/// POST /sessions/{id}/share. Idempotent: an existing share is returned
/// instead of being replaced.
#[tracing::instrument(skip(state), fields(user_id = %ctx.user_id, %session_id), err)]
pub async fn create_share(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))?;
    if !ctx.can_modify_resource(&session.user_id, session.scope, session.team_id.as_deref()) {
        return Err(ApiError::Forbidden);
    }

    if let Some(existing) = state.shares.get_by_session(&session_id).await {
        return Ok(Json(share_json(&existing)).into_response());
    }

    let now = Utc::now();
    let ttl = chrono::Duration::from_std(state.config.share_ttl)
        .unwrap_or_else(|_| chrono::Duration::hours(24));
    let share = Share {
        token: generate_token(),
        session_id,
        created_by: ctx.user_id,
        created_at: now,
        expires_at: now + ttl,
    };
    state.shares.insert(share.clone()).await;

    Ok((StatusCode::CREATED, Json(share_json(&share))).into_response())
}

/// GET /sessions/{id}/share
pub async fn get_share(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))?;
    if !ctx.can_access_resource(&session.user_id, session.scope, session.team_id.as_deref()) {
        return Err(ApiError::Forbidden);
    }

    let share = state
        .shares
        .get_by_session(&session_id)
        .await
        .ok_or_else(|| ApiError::NotFound("share".into()))?;
    Ok(Json(share_json(&share)))
}

/// DELETE /sessions/{id}/share
#[tracing::instrument(skip(state), fields(user_id = %ctx.user_id, %session_id), err)]
pub async fn delete_share(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| ApiError::NotFound(format!("session {session_id}")))?;
    if !ctx.can_modify_resource(&session.user_id, session.scope, session.team_id.as_deref()) {
        return Err(ApiError::Forbidden);
    }

    if !state.shares.delete_by_session(&session_id).await {
        return Err(ApiError::NotFound("share".into()));
    }
    Ok(Json(serde_json::json!({ "ok": true })))
}

fn share_json(share: &Share) -> serde_json::Value {
    serde_json::json!({
        "token": share.token,
        "session_id": share.session_id,
        "url": format!("/s/{}", share.token),
        "created_by": share.created_by,
        "created_at": share.created_at.to_rfc3339(),
        "expires_at": share.expires_at.to_rfc3339(),
        "expired": share.is_expired(),
    })
}

// ---------------------------------------------------------------------------
// Read-only shared proxy: GET|HEAD|OPTIONS /s/{token}/{rest...}
// ---------------------------------------------------------------------------

pub async fn shared_dispatch_root(
    State(state): State<AppState>,
    Path(token): Path<String>,
    req: Request,
) -> Result<Response, ApiError> {
    shared_inner(state, token, String::new(), req).await
}

pub async fn shared_dispatch(
    State(state): State<AppState>,
    Path((token, rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response, ApiError> {
    shared_inner(state, token, rest, req).await
}

async fn shared_inner(
    state: AppState,
    token: String,
    rest: String,
    req: Request,
) -> Result<Response, ApiError> {
    // Shares are strictly read-only; any write method is refused before the
    // share is even resolved.
    if !matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return Err(ApiError::Forbidden);
    }

    let share = state
        .shares
        .get_by_token(&token)
        .await
        .ok_or_else(|| ApiError::NotFound("share".into()))?;
    if share.is_expired() {
        return Err(ApiError::Gone("share expired".into()));
    }

    let session = state
        .sessions
        .get(&share.session_id)
        .ok_or_else(|| ApiError::NotFound("session".into()))?;

    let token_value = HeaderValue::from_str(&token)
        .map_err(|_| ApiError::BadRequest("invalid share token".into()))?;
    let extra = [
        (
            HeaderName::from_static("x-shared-session"),
            HeaderValue::from_static("true"),
        ),
        (HeaderName::from_static("x-share-token"), token_value),
    ];

    // No authorization context on this path: the token is the capability.
    proxy::forward(&state, &session, &rest, req, &extra).await
}
