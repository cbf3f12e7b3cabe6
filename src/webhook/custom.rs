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

use super::github::{pipeline_error_response, record, skip};
use super::matcher;
use super::pipeline;
use super::signature;
use super::store::WebhookStore;
use super::{
    DeliveryRecord, DeliveryStatus, SignatureType, Trigger, Webhook, WebhookKind, WebhookStatus,
};

/// How much of an unparseable body ends up in the diagnostic message.
const RAW_BODY_PREVIEW_BYTES: usize = 1024;

// ---------------------------------------------------------------------------
// POST /hooks/custom/{webhookID}
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
        .filter(|wh| wh.kind == WebhookKind::Custom)
        .ok_or_else(|| ApiError::NotFound(format!("webhook {webhook_id}")))?;

    verify_signature(&webhook, &headers, &body)?;

    if webhook.status == WebhookStatus::Paused {
        return skip(&state, &webhook, "webhook is paused").await;
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(parse_err) => {
            // Malformed payloads still surface to a human: a diagnostic
            // session carries the error and a preview of the raw body.
            return diagnostic_session(&state, &webhook, &parse_err.to_string(), &body).await;
        }
    };

    let Some(trigger) = matcher::match_custom(&webhook.triggers, &payload) else {
        return skip(&state, &webhook, "No matching trigger").await;
    };

    let tags = metadata_tags(&webhook, Some(trigger), &payload);
    let default_message = default_message(&payload);

    let outcome = pipeline::run(
        &state.sessions,
        &webhook,
        Some(trigger),
        &payload,
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

fn verify_signature(webhook: &Webhook, headers: &HeaderMap, body: &Bytes) -> Result<(), ApiError> {
    let Some(ref header_name) = webhook.signature_header else {
        tracing::warn!(webhook_id = %webhook.id, "custom webhook has no signature header configured");
        return Err(ApiError::Unauthorized);
    };
    let value = headers
        .get(header_name.as_str())
        .and_then(|v| v.to_str().ok());

    let result = match webhook.signature_type {
        SignatureType::Hmac => signature::verify_hmac_auto(&webhook.secret, value, body),
        SignatureType::Static => signature::verify_static(&webhook.secret, value),
    };
    result.map_err(|e| {
        tracing::warn!(webhook_id = %webhook.id, error = %e, "custom signature rejected");
        ApiError::Unauthorized
    })
}

/// Parse-error path: still bounded by the session limit, still recorded.
async fn diagnostic_session(
    state: &AppState,
    webhook: &Webhook,
    parse_error: &str,
    body: &Bytes,
) -> Result<Response, ApiError> {
    let preview_len = body.len().min(RAW_BODY_PREVIEW_BYTES);
    let preview = String::from_utf8_lossy(&body[..preview_len]);
    let message = format!(
        "Received a custom webhook payload that could not be parsed as JSON.\n\n\
         Parser error: {parse_error}\n\n\
         Raw body (first {preview_len} bytes):\n{preview}"
    );

    let tags = metadata_tags(webhook, None, &serde_json::Value::Null);

    let outcome = pipeline::run(
        &state.sessions,
        webhook,
        None,
        &serde_json::Value::Null,
        tags,
        message,
        body,
    )
    .await;

    match outcome {
        Ok(done) => {
            record(
                state,
                &webhook.id,
                DeliveryRecord {
                    id: Uuid::new_v4().to_string(),
                    received_at: Utc::now(),
                    status: DeliveryStatus::Processed,
                    matched_trigger: None,
                    session_id: Some(done.session_id.clone()),
                    session_reused: done.reused,
                    error: Some(format!("payload parse error: {parse_error}")),
                },
            )
            .await;
            Ok(Json(serde_json::json!({
                "session_id": done.session_id,
                "webhook_id": webhook.id,
                "message": "payload could not be parsed; diagnostic session created",
            }))
            .into_response())
        }
        Err(e) => {
            record(
                state,
                &webhook.id,
                DeliveryRecord {
                    id: Uuid::new_v4().to_string(),
                    received_at: Utc::now(),
                    status: DeliveryStatus::Failed,
                    matched_trigger: None,
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

fn metadata_tags(
    webhook: &Webhook,
    trigger: Option<&Trigger>,
    payload: &serde_json::Value,
) -> HashMap<String, String> {
    let mut tags = HashMap::from([
        ("webhook_id".to_owned(), webhook.id.clone()),
        ("webhook_name".to_owned(), webhook.name.clone()),
    ]);
    if let Some(trigger) = trigger {
        tags.insert("trigger_id".to_owned(), trigger.id.clone());
        tags.insert("trigger_name".to_owned(), trigger.name.clone());
    }
    if let Some(event) = payload.get("event").and_then(|e| e.as_str()) {
        tags.insert("custom_event".to_owned(), event.to_owned());
    }
    tags
}

fn default_message(payload: &serde_json::Value) -> String {
    if let Some(event) = payload.get("event").and_then(|e| e.as_str()) {
        return format!("Custom webhook event: {event}");
    }
    let dump = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
    let mut preview: String = dump.chars().take(2000).collect();
    if preview.len() < dump.len() {
        preview.push_str("\n…");
    }
    format!("custom webhook event received\n\nPayload:\n{preview}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(signature_type: SignatureType) -> Webhook {
        let mut wh: Webhook = serde_json::from_value(serde_json::json!({
            "id": "wh-c", "user_id": "u1", "kind": "custom", "name": "deploys", "secret": "tok",
            "created_at": Utc::now(), "updated_at": Utc::now(),
        }))
        .unwrap();
        wh.signature_header = Some("X-Signature".into());
        wh.signature_type = signature_type;
        wh
    }

    fn headers(value: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(v) = value {
            h.insert("X-Signature", v.parse().unwrap());
        }
        h
    }

    #[test]
    fn static_signature_accepts_exact_token() {
        let wh = webhook(SignatureType::Static);
        verify_signature(&wh, &headers(Some("tok")), &Bytes::new()).unwrap();
        assert!(verify_signature(&wh, &headers(Some("bad")), &Bytes::new()).is_err());
        assert!(verify_signature(&wh, &headers(None), &Bytes::new()).is_err());
    }

    #[test]
    fn hmac_signature_auto_detects_digest() {
        let wh = webhook(SignatureType::Hmac);
        let body = Bytes::from_static(b"{\"event\":\"x\"}");
        let sig = signature::sign_sha256("tok", &body);
        verify_signature(&wh, &headers(Some(&sig)), &body).unwrap();
        assert!(verify_signature(&wh, &headers(Some("sha256=00")), &body).is_err());
    }

    #[test]
    fn missing_header_config_rejected() {
        let mut wh = webhook(SignatureType::Hmac);
        wh.signature_header = None;
        assert!(verify_signature(&wh, &headers(Some("x")), &Bytes::new()).is_err());
    }

    #[test]
    fn default_message_summarises_event() {
        assert_eq!(
            default_message(&serde_json::json!({ "event": "deploy.finished" })),
            "Custom webhook event: deploy.finished"
        );
    }

    #[test]
    fn default_message_dumps_payload() {
        let msg = default_message(&serde_json::json!({ "anything": 1 }));
        assert!(msg.starts_with("custom webhook event received"), "{msg}");
        assert!(msg.contains("\"anything\": 1"), "{msg}");
    }

    #[test]
    fn custom_tags_include_event() {
        let tags = metadata_tags(
            &webhook(SignatureType::Hmac),
            None,
            &serde_json::json!({ "event": "deploy" }),
        );
        assert_eq!(tags["webhook_id"], "wh-c");
        assert_eq!(tags["custom_event"], "deploy");
        assert!(!tags.contains_key("trigger_id"));
    }
}
