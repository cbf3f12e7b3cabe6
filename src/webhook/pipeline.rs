use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::session::{
    NewSession, RepositoryRef, SessionFilter, SessionManager, SessionStatus,
};

use super::{SessionParams, Trigger, Webhook, merge_session_config, template};

#[derive(Debug)]
pub struct DeliveryOutcome {
    pub session_id: String,
    pub reused: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("template render failed: {0}")]
    Render(String),

    #[error("webhook session limit reached ({active}/{max} active)")]
    SessionLimit { active: usize, max: usize },

    #[error(transparent)]
    Session(#[from] crate::session::SessionError),
}

/// Turn a matched delivery into a session: merge configs, render templates,
/// attempt reuse, enforce the per-webhook cap, create.
///
/// `trigger` is `None` only for the custom-payload diagnostic path, which
/// skips trigger overrides but still honours the webhook defaults and the
/// session limit.
#[allow(clippy::too_many_lines)]
pub async fn run(
    sessions: &Arc<SessionManager>,
    webhook: &Webhook,
    trigger: Option<&Trigger>,
    payload: &serde_json::Value,
    metadata_tags: HashMap<String, String>,
    default_message: String,
    raw_body: &Bytes,
) -> Result<DeliveryOutcome, PipelineError> {
    let merged = merge_session_config(
        &webhook.session_config,
        trigger.and_then(|t| t.session_config.as_ref()),
    );

    // Per-key templates; any failure aborts the delivery.
    let mut environment = HashMap::new();
    for (key, source) in &merged.environment {
        let value = template::render(source, payload)
            .map_err(|e| PipelineError::Render(format!("environment {key}: {e}")))?;
        environment.insert(key.clone(), value);
    }
    let mut tags = HashMap::new();
    for (key, source) in &merged.tags {
        let value = template::render(source, payload)
            .map_err(|e| PipelineError::Render(format!("tag {key}: {e}")))?;
        tags.insert(key.clone(), value);
    }
    // The fixed metadata tags are authoritative over user-configured ones.
    tags.extend(metadata_tags);

    let params = merged.params.clone().unwrap_or_default();
    let rendered = RenderedParams::render(&params, payload)?;

    // Message priority: params.message > initialMessageTemplate > default.
    let initial_message = if let Some(msg) = rendered.message.clone().filter(|m| !m.is_empty()) {
        msg
    } else {
        render_optional_with_fallback(
            merged.initial_message_template.as_deref(),
            payload,
            &default_message,
        )
    };

    // Session reuse by tag fingerprint.
    if merged.reuse_session
        && let Some(existing) = latest_matching(sessions, &tags)
    {
        let reuse_message = match merged.reuse_message_template.as_deref() {
            Some(src) if !src.is_empty() => match template::render(src, payload) {
                Ok(msg) if !msg.is_empty() => msg,
                Ok(_) => initial_message.clone(),
                Err(e) => {
                    tracing::warn!(error = %e, "reuse message template failed, using initial message");
                    initial_message.clone()
                }
            },
            _ => initial_message.clone(),
        };

        match sessions.send_message(&existing.id, &reuse_message).await {
            Ok(()) => {
                return Ok(DeliveryOutcome {
                    session_id: existing.id,
                    reused: true,
                });
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %existing.id,
                    error = %e,
                    "reuse send failed, creating a fresh session"
                );
            }
        }
    }

    // Per-webhook session cap, observed at the moment of creation.
    let active = sessions
        .list(&SessionFilter {
            status: Some(SessionStatus::Active),
            tags: HashMap::from([("webhook_id".to_owned(), webhook.id.clone())]),
            ..Default::default()
        })
        .len();
    if active >= webhook.max_sessions {
        return Err(PipelineError::SessionLimit {
            active,
            max: webhook.max_sessions,
        });
    }

    let repository = tags.get("repository").map(|full_name| RepositoryRef {
        full_name: full_name.clone(),
        token: None,
    });

    let session = sessions
        .create(NewSession {
            user_id: webhook.user_id.clone(),
            scope: webhook.scope,
            team_id: webhook.team_id.clone(),
            environment,
            tags,
            initial_message: Some(initial_message),
            repository,
            github_token: rendered.github_token,
            agent_type: rendered.agent_type,
            oneshot: params.oneshot,
            webhook_payload: merged.mount_payload.then(|| raw_body.clone()),
            description: None,
        })
        .await?;

    Ok(DeliveryOutcome {
        session_id: session.id,
        reused: false,
    })
}

struct RenderedParams {
    message: Option<String>,
    github_token: Option<String>,
    agent_type: Option<String>,
}

impl RenderedParams {
    fn render(params: &SessionParams, payload: &serde_json::Value) -> Result<Self, PipelineError> {
        Ok(Self {
            message: render_param("params.message", params.message.as_deref(), payload)?,
            github_token: render_param(
                "params.github_token",
                params.github_token.as_deref(),
                payload,
            )?,
            agent_type: render_param("params.agent_type", params.agent_type.as_deref(), payload)?,
        })
    }
}

fn render_param(
    field: &str,
    source: Option<&str>,
    payload: &serde_json::Value,
) -> Result<Option<String>, PipelineError> {
    source
        .map(|src| {
            template::render(src, payload)
                .map_err(|e| PipelineError::Render(format!("{field}: {e}")))
        })
        .transpose()
}

fn render_optional_with_fallback(
    source: Option<&str>,
    payload: &serde_json::Value,
    fallback: &str,
) -> String {
    match source {
        Some(src) if !src.is_empty() => match template::render(src, payload) {
            Ok(msg) if !msg.is_empty() => msg,
            Ok(_) => fallback.to_owned(),
            Err(e) => {
                tracing::warn!(error = %e, "initial message template failed, using default");
                fallback.to_owned()
            }
        },
        _ => fallback.to_owned(),
    }
}

/// Most recently started active session whose tags are a superset of the
/// computed fingerprint.
fn latest_matching(
    sessions: &Arc<SessionManager>,
    tags: &HashMap<String, String>,
) -> Option<crate::session::Session> {
    let mut hits = sessions.list(&SessionFilter {
        status: Some(SessionStatus::Active),
        tags: tags.clone(),
        ..Default::default()
    });
    hits.sort_by_key(|s| s.started_at);
    hits.pop()
}
