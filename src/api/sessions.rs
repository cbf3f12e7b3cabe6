use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::session::{NewSession, RepositoryRef, Scope, Session, SessionFilter};
use crate::store::AppState;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub repository: Option<RepositoryRef>,
    #[serde(default)]
    pub params: Option<StartParams>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StartParams {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub oneshot: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /start
#[tracing::instrument(skip(state, body), fields(user_id = %ctx.user_id), err)]
pub async fn start_session(
    State(state): State<AppState>,
    ctx: AuthContext,
    Json(body): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match body.scope {
        Scope::Team => {
            let team_id = body
                .team_id
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| ApiError::BadRequest("team scope requires team_id".into()))?;
            if !ctx.can_create_in_team(team_id) {
                return Err(ApiError::Forbidden);
            }
        }
        Scope::User => {
            if !ctx.personal_can_create() {
                return Err(ApiError::Forbidden);
            }
        }
    }

    let params = body.params.unwrap_or_default();
    let session = state
        .sessions
        .create(NewSession {
            user_id: ctx.user_id,
            scope: body.scope,
            team_id: body.team_id,
            environment: body.environment,
            tags: body.tags,
            initial_message: params.message,
            repository: body.repository,
            github_token: params.github_token,
            agent_type: params.agent_type,
            oneshot: params.oneshot,
            webhook_payload: None,
            description: body.description,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "session_id": session.id })),
    ))
}

/// GET /search
///
/// Filters: `status`, `scope`, `team_id`, `user_id` (admin only; implied
/// self otherwise), and `tag.<key>=<value>` pairs. Results are always
/// reduced to what the caller may access.
pub async fn search_sessions(
    State(state): State<AppState>,
    ctx: AuthContext,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut filter = SessionFilter::default();
    for (key, value) in &query {
        match key.as_str() {
            "status" => {
                filter.status = Some(
                    value
                        .parse()
                        .map_err(|e| ApiError::BadRequest(format!("{e}")))?,
                );
            }
            "scope" => {
                filter.scope = Some(
                    value
                        .parse()
                        .map_err(|e| ApiError::BadRequest(format!("{e}")))?,
                );
            }
            "team_id" => filter.team_id = Some(value.clone()),
            "user_id" => {
                if ctx.is_admin {
                    filter.user_id = Some(value.clone());
                }
            }
            key => {
                if let Some(tag) = key.strip_prefix("tag.") {
                    filter.tags.insert(tag.to_owned(), value.clone());
                }
            }
        }
    }

    let sessions: Vec<serde_json::Value> = state
        .sessions
        .list(&filter)
        .into_iter()
        .filter(|s| ctx.can_access_resource(&s.user_id, s.scope, s.team_id.as_deref()))
        .map(session_json)
        .collect();

    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

/// DELETE /sessions/{sessionId}
#[tracing::instrument(skip(state), fields(user_id = %ctx.user_id, %session_id), err)]
pub async fn delete_session(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(session) = state.sessions.get(&session_id) {
        if !ctx.can_modify_resource(&session.user_id, session.scope, session.team_id.as_deref()) {
            return Err(ApiError::Forbidden);
        }
        state.sessions.delete(&session_id).await?;
    }
    // Repeated deletes succeed.
    Ok(Json(serde_json::json!({ "ok": true })))
}

fn session_json(s: Session) -> serde_json::Value {
    serde_json::json!({
        "session_id": s.id,
        "user_id": s.user_id,
        "scope": s.scope,
        "team_id": s.team_id,
        "status": s.status,
        "started_at": s.started_at.to_rfc3339(),
        "updated_at": s.updated_at.to_rfc3339(),
        "addr": s.addr,
        "tags": s.tags,
        "metadata": { "description": s.description.clone().unwrap_or_default() },
    })
}
