use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, Secret, SecretKeySelector, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::session::{RepositoryRef, Scope, Session, SessionStatus};

use super::{DriverError, Handoff};

// ---------------------------------------------------------------------------
// Naming, labels, annotations
// ---------------------------------------------------------------------------

pub const MANAGED_BY_LABEL: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "agent-gateway";
pub const SESSION_ID_LABEL: &str = "session-id";
pub const SCOPE_LABEL: &str = "scope";
pub const USER_ID_LABEL: &str = "user-id";
pub const TEAM_ID_LABEL: &str = "team-id";

pub const UPDATED_AT_ANNOTATION: &str = "agentapi.proxy/updated-at";
pub const STARTED_AT_ANNOTATION: &str = "agentapi.proxy/started-at";
pub const DESCRIPTION_ANNOTATION: &str = "agentapi.proxy/description";
pub const USER_ID_ANNOTATION: &str = "agentapi.proxy/user-id";
pub const TEAM_ID_ANNOTATION: &str = "agentapi.proxy/team-id";
pub const REPOSITORY_ANNOTATION: &str = "agentapi.proxy/repository";
pub const TAG_ANNOTATION_PREFIX: &str = "agentapi.proxy/tag.";

pub const SECRET_KEY_INITIAL_MESSAGE: &str = "initial-message";
pub const SECRET_KEY_GITHUB_TOKEN: &str = "github-token";
pub const SECRET_KEY_AGENT_TYPE: &str = "agent-type";
pub const SECRET_KEY_WEBHOOK_PAYLOAD: &str = "webhook-payload";

const HANDOFF_MOUNT_PATH: &str = "/var/run/agent";

/// StatefulSet, Service, and Secret all share one name per session.
pub fn resource_name(session_id: &str) -> String {
    format!("agent-{session_id}")
}

/// Sanitise a value to Kubernetes label requirements: lowercase
/// alphanumerics plus `-`, leading/trailing dashes stripped, consecutive
/// dashes collapsed. The unsanitised originals live in annotations.
pub fn sanitize_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_dash = true; // suppress a leading dash
    for c in value.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.truncate(63);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn session_labels(session: &Session) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
        (SESSION_ID_LABEL.to_owned(), session.id.clone()),
        (SCOPE_LABEL.to_owned(), session.scope.as_str().to_owned()),
        (USER_ID_LABEL.to_owned(), sanitize_label(&session.user_id)),
    ]);
    if let Some(ref team_id) = session.team_id {
        labels.insert(TEAM_ID_LABEL.to_owned(), sanitize_label(team_id));
    }
    labels
}

/// Annotations are the sole persistent source of session metadata; discovery
/// reconstructs the index from them.
pub fn service_annotations(session: &Session) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([
        (
            STARTED_AT_ANNOTATION.to_owned(),
            session.started_at.to_rfc3339(),
        ),
        (
            UPDATED_AT_ANNOTATION.to_owned(),
            session.updated_at.to_rfc3339(),
        ),
        (USER_ID_ANNOTATION.to_owned(), session.user_id.clone()),
    ]);
    annotations.insert(
        DESCRIPTION_ANNOTATION.to_owned(),
        session.description.clone().unwrap_or_default(),
    );
    if let Some(ref team_id) = session.team_id {
        annotations.insert(TEAM_ID_ANNOTATION.to_owned(), team_id.clone());
    }
    if let Some(ref repo) = session.repository {
        annotations.insert(REPOSITORY_ANNOTATION.to_owned(), repo.full_name.clone());
    }
    for (k, v) in &session.tags {
        annotations.insert(format!("{TAG_ANNOTATION_PREFIX}{k}"), v.clone());
    }
    annotations
}

// ---------------------------------------------------------------------------
// Object builders
// ---------------------------------------------------------------------------

/// Secret carrying the provisioning-time handoff: initial message, VCS
/// token, agent-type selector, optional raw webhook payload.
pub fn build_secret(namespace: &str, session: &Session, handoff: &Handoff) -> Secret {
    let mut string_data = BTreeMap::from([(
        SECRET_KEY_INITIAL_MESSAGE.to_owned(),
        handoff.initial_message.clone().unwrap_or_default(),
    )]);
    if let Some(ref token) = handoff.github_token {
        string_data.insert(SECRET_KEY_GITHUB_TOKEN.to_owned(), token.clone());
    }
    if let Some(ref agent_type) = handoff.agent_type {
        string_data.insert(SECRET_KEY_AGENT_TYPE.to_owned(), agent_type.clone());
    }

    let data = handoff.webhook_payload.as_ref().map(|payload| {
        BTreeMap::from([(
            SECRET_KEY_WEBHOOK_PAYLOAD.to_owned(),
            ByteString(payload.to_vec()),
        )])
    });

    Secret {
        metadata: ObjectMeta {
            name: Some(resource_name(&session.id)),
            namespace: Some(namespace.to_owned()),
            labels: Some(session_labels(session)),
            ..Default::default()
        },
        string_data: Some(string_data),
        data,
        ..Default::default()
    }
}

/// Single-replica StatefulSet running the agent container with the handoff
/// Secret mounted.
pub fn build_statefulset(
    namespace: &str,
    session: &Session,
    handoff: &Handoff,
    image: &str,
    agent_port: u16,
) -> Result<StatefulSet, DriverError> {
    let name = resource_name(&session.id);
    let labels = session_labels(session);
    let container = build_agent_container(session, handoff, image, agent_port);

    serde_json::from_value(serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels,
        },
        "spec": {
            "replicas": 1,
            "serviceName": name,
            "selector": { "matchLabels": { (SESSION_ID_LABEL): session.id } },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "containers": [container],
                    "volumes": [Volume {
                        name: "handoff".into(),
                        secret: Some(k8s_openapi::api::core::v1::SecretVolumeSource {
                            secret_name: Some(name.clone()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                },
            },
        },
    }))
    .map_err(|e| DriverError::Other(format!("statefulset manifest: {e}")))
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn build_agent_container(
    session: &Session,
    handoff: &Handoff,
    image: &str,
    agent_port: u16,
) -> Container {
    let mut env = vec![
        env_var("AGENT_SESSION_ID", &session.id),
        env_var("AGENT_PORT", &agent_port.to_string()),
        env_var(
            "AGENT_INITIAL_MESSAGE_FILE",
            &format!("{HANDOFF_MOUNT_PATH}/{SECRET_KEY_INITIAL_MESSAGE}"),
        ),
    ];
    for (k, v) in &session.environment {
        env.push(env_var(k, v));
    }
    if let Some(ref repo) = session.repository {
        env.push(env_var("AGENT_REPOSITORY", &repo.full_name));
    }
    if handoff.github_token.is_some() {
        env.push(EnvVar {
            name: "GITHUB_TOKEN".into(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: resource_name(&session.id),
                    key: SECRET_KEY_GITHUB_TOKEN.into(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if let Some(ref agent_type) = handoff.agent_type {
        env.push(env_var("AGENT_TYPE", agent_type));
    }
    if handoff.oneshot {
        env.push(env_var("AGENT_ONESHOT", "1"));
    }
    if handoff.webhook_payload.is_some() {
        env.push(env_var(
            "AGENT_WEBHOOK_PAYLOAD_FILE",
            &format!("{HANDOFF_MOUNT_PATH}/{SECRET_KEY_WEBHOOK_PAYLOAD}"),
        ));
    }

    Container {
        name: "agent".into(),
        image: Some(image.to_owned()),
        env: Some(env),
        ports: Some(vec![ContainerPort {
            container_port: i32::from(agent_port),
            name: Some("http".into()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: "handoff".into(),
            mount_path: HANDOFF_MOUNT_PATH.into(),
            read_only: Some(true),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Per-session Service selecting the StatefulSet's pod. Its cluster DNS
/// name is the session's `addr`.
pub fn build_service(namespace: &str, session: &Session, agent_port: u16) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(resource_name(&session.id)),
            namespace: Some(namespace.to_owned()),
            labels: Some(session_labels(session)),
            annotations: Some(service_annotations(session)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(BTreeMap::from([(
                SESSION_ID_LABEL.to_owned(),
                session.id.clone(),
            )])),
            ports: Some(vec![ServicePort {
                name: Some("http".into()),
                port: i32::from(agent_port),
                target_port: Some(IntOrString::Int(i32::from(agent_port))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service_addr(session_id: &str, namespace: &str, agent_port: u16) -> String {
    format!(
        "{}.{namespace}.svc:{agent_port}",
        resource_name(session_id)
    )
}

// ---------------------------------------------------------------------------
// Discovery: Service → Session
// ---------------------------------------------------------------------------

/// Rebuild a session record from a managed Service's labels and
/// annotations. Returns `None` for Services that lack the session-id label.
pub fn session_from_service(svc: &Service, namespace: &str, agent_port: u16) -> Option<Session> {
    let labels = svc.metadata.labels.as_ref()?;
    let id = labels.get(SESSION_ID_LABEL)?.clone();
    let empty = BTreeMap::new();
    let annotations = svc.metadata.annotations.as_ref().unwrap_or(&empty);

    let scope: Scope = labels
        .get(SCOPE_LABEL)
        .and_then(|s| s.parse().ok())
        .unwrap_or_default();

    let user_id = annotations
        .get(USER_ID_ANNOTATION)
        .cloned()
        .or_else(|| labels.get(USER_ID_LABEL).cloned())
        .unwrap_or_default();

    let team_id = annotations
        .get(TEAM_ID_ANNOTATION)
        .cloned()
        .or_else(|| labels.get(TEAM_ID_LABEL).cloned());

    let started_at = parse_annotation_time(annotations.get(STARTED_AT_ANNOTATION));
    let updated_at = parse_annotation_time(annotations.get(UPDATED_AT_ANNOTATION));

    let description = annotations
        .get(DESCRIPTION_ANNOTATION)
        .filter(|d| !d.is_empty())
        .cloned();

    let repository = annotations
        .get(REPOSITORY_ANNOTATION)
        .map(|full_name| RepositoryRef {
            full_name: full_name.clone(),
            token: None,
        });

    let tags: HashMap<String, String> = annotations
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(TAG_ANNOTATION_PREFIX)
                .map(|tag| (tag.to_owned(), v.clone()))
        })
        .collect();

    Some(Session {
        addr: service_addr(&id, namespace, agent_port),
        id,
        user_id,
        scope,
        team_id,
        status: SessionStatus::Active,
        environment: HashMap::new(),
        tags,
        started_at,
        updated_at,
        description,
        repository,
    })
}

fn parse_annotation_time(value: Option<&String>) -> DateTime<Utc> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc))
}
