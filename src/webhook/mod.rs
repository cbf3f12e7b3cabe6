pub mod custom;
pub mod github;
pub mod matcher;
pub mod pipeline;
pub mod signature;
pub mod store;
pub mod template;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Scope;

// ---------------------------------------------------------------------------
// Webhook model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WebhookStatus {
    #[default]
    Active,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookKind {
    Github,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureType {
    #[default]
    Hmac,
    Static,
}

/// GitHub-specific webhook gating, applied before trigger matching.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GitHubConfig {
    #[serde(default)]
    pub allowed_events: Vec<String>,
    /// `owner/name` or `owner/*`.
    #[serde(default)]
    pub allowed_repositories: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enterprise_url: Option<String>,
}

/// Scalar session parameters. Each string field is itself a template over
/// the webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub oneshot: bool,
}

/// Session settings attached to a webhook (defaults) or a trigger
/// (override). See `merge_session_config` for the merge discipline.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    /// Values are templates over the payload.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Values are templates over the payload.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_message_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reuse_message_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<SessionParams>,
    #[serde(default)]
    pub reuse_session: bool,
    #[serde(default)]
    pub mount_payload: bool,
}

/// Structured GitHub predicates plus the general template predicate. All
/// declared conditions must hold.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TriggerConditions {
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    /// `owner/name` or `owner/*`.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Globs over the extracted branch.
    #[serde(default)]
    pub branches: Vec<String>,
    /// Globs over the PR base branch; skipped when no PR is present.
    #[serde(default)]
    pub base_branches: Vec<String>,
    /// Any-of over PR/issue labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Globs (with `**`) over changed files of a push.
    #[serde(default)]
    pub paths: Vec<String>,
    /// Sender logins.
    #[serde(default)]
    pub senders: Vec<String>,
    /// Tri-state PR draft flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft: Option<bool>,
    /// General predicate: a template over the raw payload that renders to
    /// a truthy string (`true`/`1`/`yes`, case-insensitive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Lower value = higher precedence. Ties break by list order.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub conditions: TriggerConditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_config: Option<SessionConfig>,
    /// Custom path only: a non-matching trigger with this flag ends
    /// evaluation early.
    #[serde(default)]
    pub stop_on_match: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_sessions() -> usize {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Processed,
    Skipped,
    Failed,
}

/// Audit row per inbound webhook POST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub session_reused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,
    #[serde(default)]
    pub status: WebhookStatus,
    pub kind: WebhookKind,
    pub name: String,
    /// Shared with the sender for signature verification.
    pub secret: String,
    /// Custom webhooks: header the signature arrives in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_header: Option<String>,
    #[serde(default)]
    pub signature_type: SignatureType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GitHubConfig>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub session_config: SessionConfig,
    /// Per-webhook cap on concurrently active derived sessions.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub delivery_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery: Option<DeliveryRecord>,
}

// ---------------------------------------------------------------------------
// Session-config merge
// ---------------------------------------------------------------------------

/// Merge a webhook's default session config with a trigger's override.
/// Maps merge with the override winning on collisions; scalar templates use
/// the override when non-empty; `params` is replaced atomically; booleans
/// OR.
pub fn merge_session_config(base: &SessionConfig, overlay: Option<&SessionConfig>) -> SessionConfig {
    let Some(overlay) = overlay else {
        return base.clone();
    };

    let mut environment = base.environment.clone();
    environment.extend(overlay.environment.clone());
    let mut tags = base.tags.clone();
    tags.extend(overlay.tags.clone());

    SessionConfig {
        environment,
        tags,
        initial_message_template: pick_template(
            overlay.initial_message_template.as_ref(),
            base.initial_message_template.as_ref(),
        ),
        reuse_message_template: pick_template(
            overlay.reuse_message_template.as_ref(),
            base.reuse_message_template.as_ref(),
        ),
        params: overlay.params.clone().or_else(|| base.params.clone()),
        reuse_session: base.reuse_session || overlay.reuse_session,
        mount_payload: base.mount_payload || overlay.mount_payload,
    }
}

fn pick_template(overlay: Option<&String>, base: Option<&String>) -> Option<String> {
    match overlay {
        Some(t) if !t.is_empty() => Some(t.clone()),
        _ => base.cloned(),
    }
}

// ---------------------------------------------------------------------------
// Template validation (webhook create/update time)
// ---------------------------------------------------------------------------

/// Parse (but do not execute) every template a webhook carries. A syntax
/// error anywhere fails the whole webhook.
pub fn validate_templates(webhook: &Webhook) -> Result<(), String> {
    validate_session_config_templates(&webhook.session_config)?;
    for trigger in &webhook.triggers {
        if let Some(ref tmpl) = trigger.conditions.template {
            template::validate(tmpl)
                .map_err(|e| format!("trigger {}: condition template: {e}", trigger.name))?;
        }
        if let Some(ref sc) = trigger.session_config {
            validate_session_config_templates(sc)
                .map_err(|e| format!("trigger {}: {e}", trigger.name))?;
        }
    }
    Ok(())
}

fn validate_session_config_templates(config: &SessionConfig) -> Result<(), String> {
    let mut named: Vec<(&str, &String)> = Vec::new();
    if let Some(ref t) = config.initial_message_template {
        named.push(("initial_message_template", t));
    }
    if let Some(ref t) = config.reuse_message_template {
        named.push(("reuse_message_template", t));
    }
    if let Some(ref params) = config.params {
        if let Some(ref t) = params.message {
            named.push(("params.message", t));
        }
        if let Some(ref t) = params.github_token {
            named.push(("params.github_token", t));
        }
        if let Some(ref t) = params.agent_type {
            named.push(("params.agent_type", t));
        }
    }
    for (field, source) in named {
        template::validate(source).map_err(|e| format!("{field}: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(env: &[(&str, &str)], tags: &[(&str, &str)]) -> SessionConfig {
        SessionConfig {
            environment: env
                .iter()
                .map(|&(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            tags: tags
                .iter()
                .map(|&(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn merge_without_override_is_base() {
        let base = config(&[("A", "1")], &[("t", "x")]);
        let merged = merge_session_config(&base, None);
        assert_eq!(merged.environment["A"], "1");
        assert_eq!(merged.tags["t"], "x");
    }

    #[test]
    fn merge_maps_override_wins() {
        let base = config(&[("A", "1"), ("B", "2")], &[]);
        let overlay = config(&[("B", "override"), ("C", "3")], &[]);
        let merged = merge_session_config(&base, Some(&overlay));
        assert_eq!(merged.environment["A"], "1");
        assert_eq!(merged.environment["B"], "override");
        assert_eq!(merged.environment["C"], "3");
    }

    #[test]
    fn merge_templates_override_when_nonempty() {
        let base = SessionConfig {
            initial_message_template: Some("base".into()),
            reuse_message_template: Some("base-reuse".into()),
            ..Default::default()
        };
        let overlay = SessionConfig {
            initial_message_template: Some("override".into()),
            reuse_message_template: Some(String::new()),
            ..Default::default()
        };
        let merged = merge_session_config(&base, Some(&overlay));
        assert_eq!(merged.initial_message_template.as_deref(), Some("override"));
        // Empty override falls back to base.
        assert_eq!(merged.reuse_message_template.as_deref(), Some("base-reuse"));
    }

    #[test]
    fn merge_params_atomic() {
        let base = SessionConfig {
            params: Some(SessionParams {
                message: Some("base-msg".into()),
                github_token: Some("base-token".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = SessionConfig {
            params: Some(SessionParams {
                message: Some("override-msg".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge_session_config(&base, Some(&overlay));
        let params = merged.params.unwrap();
        assert_eq!(params.message.as_deref(), Some("override-msg"));
        // Atomic replacement: base token does not leak through.
        assert_eq!(params.github_token, None);
    }

    #[test]
    fn merge_booleans_or() {
        let base = SessionConfig {
            reuse_session: true,
            ..Default::default()
        };
        let overlay = SessionConfig {
            mount_payload: true,
            ..Default::default()
        };
        let merged = merge_session_config(&base, Some(&overlay));
        assert!(merged.reuse_session);
        assert!(merged.mount_payload);
    }

    #[test]
    fn webhook_serde_roundtrip() {
        let wh = Webhook {
            id: "wh-1".into(),
            user_id: "u1".into(),
            scope: Scope::User,
            team_id: None,
            status: WebhookStatus::Active,
            kind: WebhookKind::Github,
            name: "ci-hook".into(),
            secret: "s3cret".into(),
            signature_header: None,
            signature_type: SignatureType::Hmac,
            github: Some(GitHubConfig::default()),
            triggers: vec![Trigger {
                id: "t1".into(),
                name: "on-pr".into(),
                priority: 5,
                enabled: true,
                conditions: TriggerConditions {
                    events: vec!["pull_request".into()],
                    ..Default::default()
                },
                session_config: None,
                stop_on_match: false,
            }],
            session_config: SessionConfig::default(),
            max_sessions: 10,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            delivery_count: 0,
            last_delivery: None,
        };
        let json = serde_json::to_string(&wh).unwrap();
        let back: Webhook = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "wh-1");
        assert_eq!(back.kind, WebhookKind::Github);
        assert_eq!(back.triggers[0].conditions.events, vec!["pull_request"]);
    }

    #[test]
    fn trigger_enabled_defaults_true() {
        let t: Trigger = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert!(t.enabled);
        assert_eq!(t.priority, 0);
    }

    #[test]
    fn validate_rejects_bad_template() {
        let mut wh: Webhook = serde_json::from_value(serde_json::json!({
            "id": "wh", "user_id": "u", "kind": "custom", "name": "n", "secret": "s",
            "created_at": Utc::now(), "updated_at": Utc::now(),
        }))
        .unwrap();
        wh.session_config.initial_message_template = Some("{{ unclosed".into());
        let err = validate_templates(&wh).unwrap_err();
        assert!(err.contains("initial_message_template"), "{err}");
    }

    #[test]
    fn validate_accepts_well_formed_templates() {
        let mut wh: Webhook = serde_json::from_value(serde_json::json!({
            "id": "wh", "user_id": "u", "kind": "github", "name": "n", "secret": "s",
            "created_at": Utc::now(), "updated_at": Utc::now(),
        }))
        .unwrap();
        wh.session_config.initial_message_template =
            Some("PR {{ pull_request.number }} by {{ sender.login }}".into());
        wh.triggers = vec![Trigger {
            id: "t".into(),
            name: "tpl".into(),
            priority: 0,
            enabled: true,
            conditions: TriggerConditions {
                template: Some("{{ action == 'opened' }}".into()),
                ..Default::default()
            },
            session_config: None,
            stop_on_match: false,
        }];
        validate_templates(&wh).unwrap();
    }
}
