use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::store::AppState;

use super::matcher::{self, GitHubEvent};
use super::pipeline::{self, PipelineError};
use super::signature;
use super::store::WebhookStore;
use super::{DeliveryRecord, DeliveryStatus, Trigger, Webhook, WebhookKind, WebhookStatus};

// ---------------------------------------------------------------------------
// POST /hooks/github/{webhookID}
// ---------------------------------------------------------------------------

#[tracing::instrument(skip(state, headers, body), fields(%webhook_id), err)]
pub async fn ingress(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let webhook = state
        .webhooks
        .get(&webhook_id)
        .await
        .map_err(ApiError::Internal)?
        .filter(|wh| wh.kind == WebhookKind::Github)
        .ok_or_else(|| ApiError::NotFound(format!("webhook {webhook_id}")))?;

    let event = header(&headers, "x-github-event")
        .ok_or_else(|| ApiError::BadRequest("missing X-GitHub-Event header".into()))?;
    let delivery_id = header(&headers, "x-github-delivery").unwrap_or_default();
    tracing::debug!(%event, %delivery_id, "github delivery received");

    // Nothing past this point runs with a bad signature.
    if let Err(e) = signature::verify_github(
        &webhook.secret,
        header(&headers, "x-hub-signature-256")
            .or_else(|| header(&headers, "x-hub-signature"))
            .as_deref(),
        &body,
    ) {
        tracing::warn!(%webhook_id, error = %e, "github signature rejected");
        return Err(ApiError::Unauthorized);
    }

    if event == "ping" {
        return Ok(Json(serde_json::json!({
            "message": "pong",
            "webhook_id": webhook.id,
        }))
        .into_response());
    }

    if webhook.status == WebhookStatus::Paused {
        return skip(&state, &webhook, "webhook is paused").await;
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON payload: {e}")))?;
    if payload.get("repository").is_none() {
        return Err(ApiError::BadRequest("payload has no repository".into()));
    }

    let github_event = GitHubEvent::from_payload(&event, payload);

    // Webhook-level gating happens before any trigger is consulted.
    if let Some(ref gh) = webhook.github {
        if !gh.allowed_events.is_empty() && !gh.allowed_events.contains(&event) {
            return skip(&state, &webhook, "event not allowed by webhook").await;
        }
        if !gh.allowed_repositories.is_empty() {
            let allowed = github_event.repo_full_name.as_ref().is_some_and(|name| {
                gh.allowed_repositories
                    .iter()
                    .any(|p| matcher::repo_pattern_matches(p, name))
            });
            if !allowed {
                return skip(&state, &webhook, "repository not allowed by webhook").await;
            }
        }
    }

    let Some(trigger) = matcher::match_github(&webhook.triggers, &github_event) else {
        return skip(&state, &webhook, "No matching trigger").await;
    };

    let tags = metadata_tags(&webhook, trigger, &github_event);
    let default_message = default_message(&github_event);

    let outcome = pipeline::run(
        &state.sessions,
        &webhook,
        Some(trigger),
        &github_event.raw,
        tags,
        default_message,
        &body,
    )
    .await;

    match outcome {
        Ok(done) => {
            record(
                &state,
                &webhook.id,
                DeliveryRecord {
                    id: Uuid::new_v4().to_string(),
                    received_at: Utc::now(),
                    status: DeliveryStatus::Processed,
                    matched_trigger: Some(trigger.id.clone()),
                    session_id: Some(done.session_id.clone()),
                    session_reused: done.reused,
                    error: None,
                },
            )
            .await;

            Ok(Json(serde_json::json!({
                "session_id": done.session_id,
                "webhook_id": webhook.id,
                "trigger_id": trigger.id,
                "session_reused": done.reused,
            }))
            .into_response())
        }
        Err(e) => {
            record(
                &state,
                &webhook.id,
                DeliveryRecord {
                    id: Uuid::new_v4().to_string(),
                    received_at: Utc::now(),
                    status: DeliveryStatus::Failed,
                    matched_trigger: Some(trigger.id.clone()),
                    session_id: None,
                    session_reused: false,
                    error: Some(e.to_string()),
                },
            )
            .await;
            Err(pipeline_error_response(e))
        }
    }
}

pub(super) fn pipeline_error_response(e: PipelineError) -> ApiError {
    match e {
        PipelineError::SessionLimit { .. } => ApiError::SessionLimit(e.to_string()),
        PipelineError::Render(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        PipelineError::Session(e) => e.into(),
    }
}

pub(super) async fn skip(
    state: &AppState,
    webhook: &Webhook,
    message: &str,
) -> Result<Response, ApiError> {
    record(
        state,
        &webhook.id,
        DeliveryRecord {
            id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
            status: DeliveryStatus::Skipped,
            matched_trigger: None,
            session_id: None,
            session_reused: false,
            error: Some(message.to_owned()),
        },
    )
    .await;

    Ok(Json(serde_json::json!({ "message": message })).into_response())
}

pub(super) async fn record(state: &AppState, webhook_id: &str, record: DeliveryRecord) {
    state.webhooks.record_delivery(webhook_id, record).await;
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// The fixed tag set identifying a webhook-derived session.
fn metadata_tags(
    webhook: &Webhook,
    trigger: &Trigger,
    event: &GitHubEvent,
) -> HashMap<String, String> {
    let mut tags = HashMap::from([
        ("webhook_id".to_owned(), webhook.id.clone()),
        ("webhook_name".to_owned(), webhook.name.clone()),
        ("trigger_id".to_owned(), trigger.id.clone()),
        ("trigger_name".to_owned(), trigger.name.clone()),
        ("github_event".to_owned(), event.event.clone()),
    ]);
    if let Some(ref repo) = event.repo_full_name {
        tags.insert("repository".to_owned(), repo.clone());
    }
    if let Some(ref action) = event.action {
        tags.insert("github_action".to_owned(), action.clone());
    }
    tags
}

fn default_message(event: &GitHubEvent) -> String {
    let repo = event.repo_full_name.as_deref().unwrap_or("unknown repository");
    match event.event.as_str() {
        "push" => {
            let branch = event.branch.as_deref().unwrap_or("unknown branch");
            let commits = event
                .raw
                .get("commits")
                .and_then(|c| c.as_array())
                .map_or(0, Vec::len);
            let head = event
                .raw
                .pointer("/head_commit/message")
                .and_then(|m| m.as_str())
                .map(|m| m.lines().next().unwrap_or(m))
                .unwrap_or("");
            format!("Push to {repo} on {branch} ({commits} commit(s)): {head}")
        }
        "pull_request" => {
            let number = event
                .raw
                .pointer("/pull_request/number")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0);
            let title = event
                .raw
                .pointer("/pull_request/title")
                .and_then(|t| t.as_str())
                .unwrap_or("");
            let action = event.action.as_deref().unwrap_or("updated");
            format!("Pull request #{number} {action} in {repo}: {title}")
        }
        "issues" => {
            let number = event
                .raw
                .pointer("/issue/number")
                .and_then(serde_json::Value::as_i64)
                .unwrap_or(0);
            let title = event
                .raw
                .pointer("/issue/title")
                .and_then(|t| t.as_str())
                .unwrap_or("");
            let action = event.action.as_deref().unwrap_or("updated");
            format!("Issue #{number} {action} in {repo}: {title}")
        }
        other => format!("GitHub {other} event received from {repo}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger() -> Trigger {
        Trigger {
            id: "t1".into(),
            name: "on-pr".into(),
            priority: 0,
            enabled: true,
            conditions: super::super::TriggerConditions::default(),
            session_config: None,
            stop_on_match: false,
        }
    }

    fn webhook() -> Webhook {
        serde_json::from_value(serde_json::json!({
            "id": "wh-1", "user_id": "u1", "kind": "github", "name": "ci", "secret": "s",
            "created_at": Utc::now(), "updated_at": Utc::now(),
        }))
        .unwrap()
    }

    #[test]
    fn metadata_tags_fixed_set() {
        let ev = GitHubEvent::from_payload(
            "pull_request",
            serde_json::json!({
                "action": "opened",
                "repository": { "full_name": "acme/widgets" },
            }),
        );
        let tags = metadata_tags(&webhook(), &trigger(), &ev);
        assert_eq!(tags["webhook_id"], "wh-1");
        assert_eq!(tags["webhook_name"], "ci");
        assert_eq!(tags["trigger_id"], "t1");
        assert_eq!(tags["trigger_name"], "on-pr");
        assert_eq!(tags["github_event"], "pull_request");
        assert_eq!(tags["repository"], "acme/widgets");
        assert_eq!(tags["github_action"], "opened");
    }

    #[test]
    fn metadata_tags_omit_absent_fields() {
        let ev = GitHubEvent::from_payload("workflow_run", serde_json::json!({}));
        let tags = metadata_tags(&webhook(), &trigger(), &ev);
        assert!(!tags.contains_key("repository"));
        assert!(!tags.contains_key("github_action"));
    }

    #[test]
    fn default_message_push() {
        let ev = GitHubEvent::from_payload(
            "push",
            serde_json::json!({
                "ref": "refs/heads/main",
                "repository": { "full_name": "acme/widgets" },
                "commits": [{}, {}],
                "head_commit": { "message": "fix: the bug\n\nlong body" },
            }),
        );
        let msg = default_message(&ev);
        assert!(msg.contains("acme/widgets"), "{msg}");
        assert!(msg.contains("main"), "{msg}");
        assert!(msg.contains("2 commit(s)"), "{msg}");
        assert!(msg.contains("fix: the bug"), "{msg}");
        assert!(!msg.contains("long body"), "{msg}");
    }

    #[test]
    fn default_message_pull_request() {
        let ev = GitHubEvent::from_payload(
            "pull_request",
            serde_json::json!({
                "action": "opened",
                "repository": { "full_name": "acme/widgets" },
                "pull_request": { "number": 42, "title": "Add login" },
            }),
        );
        let msg = default_message(&ev);
        assert_eq!(msg, "Pull request #42 opened in acme/widgets: Add login");
    }

    #[test]
    fn default_message_issue() {
        let ev = GitHubEvent::from_payload(
            "issues",
            serde_json::json!({
                "action": "labeled",
                "repository": { "full_name": "acme/widgets" },
                "issue": { "number": 7, "title": "Crash on start" },
            }),
        );
        let msg = default_message(&ev);
        assert_eq!(msg, "Issue #7 labeled in acme/widgets: Crash on start");
    }

    #[test]
    fn default_message_other_event() {
        let ev = GitHubEvent::from_payload(
            "release",
            serde_json::json!({ "repository": { "full_name": "acme/widgets" } }),
        );
        assert_eq!(
            default_message(&ev),
            "GitHub release event received from acme/widgets"
        );
    }
}
