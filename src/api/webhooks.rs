use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::session::Scope;
use crate::store::AppState;
use crate::webhook::store::WebhookStore;
use crate::webhook::{
    GitHubConfig, SessionConfig, SignatureType, Trigger, Webhook, WebhookKind, WebhookStatus,
    validate_templates,
};

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub name: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub team_id: Option<String>,
    pub kind: WebhookKind,
    pub secret: String,
    #[serde(default)]
    pub signature_header: Option<String>,
    #[serde(default)]
    pub signature_type: SignatureType,
    #[serde(default)]
    pub github: Option<GitHubConfig>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub session_config: SessionConfig,
    #[serde(default)]
    pub max_sessions: Option<usize>,
    #[serde(default)]
    pub status: WebhookStatus,
}

const DEFAULT_MAX_SESSIONS: usize = 10;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /webhooks
#[tracing::instrument(skip(state, body), fields(user_id = %ctx.user_id), err)]
pub async fn create_webhook(
    State(state): State<AppState>,
    ctx: AuthContext,
    Json(body): Json<WebhookRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let webhook = build_webhook(&ctx, body, None)?;
    state
        .webhooks
        .insert(webhook.clone())
        .await
        .map_err(ApiError::Internal)?;

    Ok((StatusCode::CREATED, Json(webhook_response(&webhook))))
}

/// GET /webhooks
pub async fn list_webhooks(
    State(state): State<AppState>,
    ctx: AuthContext,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhooks: Vec<serde_json::Value> = state
        .webhooks
        .list()
        .await
        .map_err(ApiError::Internal)?
        .iter()
        .filter(|wh| ctx.can_access_resource(&wh.user_id, wh.scope, wh.team_id.as_deref()))
        .map(webhook_response)
        .collect();
    Ok(Json(serde_json::json!({ "webhooks": webhooks })))
}

/// GET /webhooks/{id}
pub async fn get_webhook(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhook = fetch(&state, &id).await?;
    if !ctx.can_access_resource(&webhook.user_id, webhook.scope, webhook.team_id.as_deref()) {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(webhook_response(&webhook)))
}

/// PUT /webhooks/{id}
#[tracing::instrument(skip(state, body), fields(user_id = %ctx.user_id, %id), err)]
pub async fn update_webhook(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<WebhookRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let existing = fetch(&state, &id).await?;
    if !ctx.can_modify_resource(&existing.user_id, existing.scope, existing.team_id.as_deref()) {
        return Err(ApiError::Forbidden);
    }

    let mut updated = build_webhook(&ctx, body, Some(&existing))?;
    updated.id = existing.id.clone();
    updated.user_id = existing.user_id.clone();
    updated.created_at = existing.created_at;
    updated.delivery_count = existing.delivery_count;
    updated.last_delivery = existing.last_delivery.clone();

    state
        .webhooks
        .update(updated.clone())
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(webhook_response(&updated)))
}

/// DELETE /webhooks/{id}
#[tracing::instrument(skip(state), fields(user_id = %ctx.user_id, %id), err)]
pub async fn delete_webhook(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhook = fetch(&state, &id).await?;
    if !ctx.can_modify_resource(&webhook.user_id, webhook.scope, webhook.team_id.as_deref()) {
        return Err(ApiError::Forbidden);
    }
    state
        .webhooks
        .delete(&id)
        .await
        .map_err(ApiError::Internal)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// GET /webhooks/{id}/deliveries
pub async fn list_deliveries(
    State(state): State<AppState>,
    ctx: AuthContext,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let webhook = fetch(&state, &id).await?;
    if !ctx.can_access_resource(&webhook.user_id, webhook.scope, webhook.team_id.as_deref()) {
        return Err(ApiError::Forbidden);
    }
    let deliveries = state.webhooks.deliveries(&id).await;
    Ok(Json(serde_json::json!({
        "delivery_count": webhook.delivery_count,
        "deliveries": deliveries,
    })))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn fetch(state: &AppState, id: &str) -> Result<Webhook, ApiError> {
    state
        .webhooks
        .get(id)
        .await
        .map_err(ApiError::Internal)?
        .ok_or_else(|| ApiError::NotFound(format!("webhook {id}")))
}

fn build_webhook(
    ctx: &AuthContext,
    body: WebhookRequest,
    existing: Option<&Webhook>,
) -> Result<Webhook, ApiError> {
    let team_id = match body.scope {
        Scope::Team => {
            let team_id = body
                .team_id
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| ApiError::BadRequest("team scope requires team_id".into()))?;
            if !ctx.can_create_in_team(team_id) {
                return Err(ApiError::Forbidden);
            }
            Some(team_id.to_owned())
        }
        Scope::User => None,
    };

    if body.kind == WebhookKind::Custom
        && body
            .signature_header
            .as_deref()
            .is_none_or(|h| h.trim().is_empty())
    {
        return Err(ApiError::BadRequest(
            "custom webhooks require signature_header".into(),
        ));
    }
    if body.secret.is_empty() {
        return Err(ApiError::BadRequest("secret must not be empty".into()));
    }

    let mut triggers = body.triggers;
    for trigger in &mut triggers {
        if trigger.id.is_empty() {
            trigger.id = Uuid::new_v4().to_string();
        }
    }

    let now = Utc::now();
    let webhook = Webhook {
        id: existing.map_or_else(|| Uuid::new_v4().to_string(), |e| e.id.clone()),
        user_id: ctx.user_id.clone(),
        scope: body.scope,
        team_id,
        status: body.status,
        kind: body.kind,
        name: body.name,
        secret: body.secret,
        signature_header: body.signature_header,
        signature_type: body.signature_type,
        github: body.github,
        triggers,
        session_config: body.session_config,
        max_sessions: body.max_sessions.unwrap_or(DEFAULT_MAX_SESSIONS),
        created_at: now,
        updated_at: now,
        delivery_count: 0,
        last_delivery: None,
    };

    // Templates are parsed (not executed) up front; a syntax error anywhere
    // rejects the webhook.
    validate_templates(&webhook).map_err(ApiError::BadRequest)?;

    Ok(webhook)
}

/// The API never echoes the shared secret back.
fn webhook_response(webhook: &Webhook) -> serde_json::Value {
    let mut value = serde_json::to_value(webhook).unwrap_or_default();
    if let Some(obj) = value.as_object_mut() {
        obj.remove("secret");
        obj.insert(
            "trigger_count".to_owned(),
            serde_json::Value::from(webhook.triggers.len()),
        );
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::TriggerConditions;

    fn ctx() -> AuthContext {
        AuthContext {
            user_id: "u1".into(),
            is_admin: false,
            teams: vec!["team-a".into()],
        }
    }

    fn base_request() -> WebhookRequest {
        WebhookRequest {
            name: "ci".into(),
            scope: Scope::User,
            team_id: None,
            kind: WebhookKind::Github,
            secret: "s3cret".into(),
            signature_header: None,
            signature_type: SignatureType::Hmac,
            github: None,
            triggers: Vec::new(),
            session_config: SessionConfig::default(),
            max_sessions: None,
            status: WebhookStatus::Active,
        }
    }

    #[test]
    fn build_fills_ids_and_defaults() {
        let mut req = base_request();
        req.triggers = vec![Trigger {
            id: String::new(),
            name: "t".into(),
            priority: 0,
            enabled: true,
            conditions: TriggerConditions::default(),
            session_config: None,
            stop_on_match: false,
        }];
        let wh = build_webhook(&ctx(), req, None).unwrap();
        assert!(!wh.id.is_empty());
        assert!(!wh.triggers[0].id.is_empty());
        assert_eq!(wh.max_sessions, DEFAULT_MAX_SESSIONS);
        assert_eq!(wh.user_id, "u1");
    }

    #[test]
    fn build_rejects_custom_without_signature_header() {
        let mut req = base_request();
        req.kind = WebhookKind::Custom;
        assert!(matches!(
            build_webhook(&ctx(), req, None),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn build_rejects_team_scope_without_membership() {
        let mut req = base_request();
        req.scope = Scope::Team;
        req.team_id = Some("team-b".into());
        assert!(matches!(
            build_webhook(&ctx(), req, None),
            Err(ApiError::Forbidden)
        ));
    }

    #[test]
    fn build_accepts_member_team() {
        let mut req = base_request();
        req.scope = Scope::Team;
        req.team_id = Some("team-a".into());
        let wh = build_webhook(&ctx(), req, None).unwrap();
        assert_eq!(wh.team_id.as_deref(), Some("team-a"));
    }

    #[test]
    fn build_rejects_invalid_template() {
        let mut req = base_request();
        req.session_config.initial_message_template = Some("{{ broken".into());
        assert!(matches!(
            build_webhook(&ctx(), req, None),
            Err(ApiError::BadRequest(_))
        ));
    }

    #[test]
    fn response_hides_secret() {
        let wh = build_webhook(&ctx(), base_request(), None).unwrap();
        let value = webhook_response(&wh);
        assert!(value.get("secret").is_none());
        assert_eq!(value["name"], "ci");
    }
}
