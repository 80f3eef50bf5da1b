//! Inbound webhook the cloud uses to push service calls synchronously.
//!
//! Order of checks: webhook id, then the shared secret, then the payload.
//! Nothing touches Home Assistant until all three pass.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::crypto;
use crate::hass::ServiceCall;

use super::AppState;

/// The two payload forms, resolved once at the parse boundary.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WebhookPayload {
    Encrypted { encrypted_payload: String },
    Plain { service_call: WebhookServiceCall },
}

#[derive(Debug, Deserialize)]
struct WebhookServiceCall {
    domain: String,
    service: String,
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    service_data: Option<Map<String, Value>>,
}

impl WebhookServiceCall {
    /// `entity_id` merges into the data only when the data does not already
    /// carry one; an existing value wins.
    fn into_service_call(self) -> ServiceCall {
        let mut data = self.service_data.unwrap_or_default();
        if let Some(entity_id) = self.entity_id {
            data.entry("entity_id".to_string())
                .or_insert(Value::String(entity_id));
        }
        ServiceCall {
            domain: self.domain,
            service: self.service,
            data,
        }
    }
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, message.to_string()).into_response()
}

pub async fn handle(
    State(state): State<AppState>,
    Path(webhook_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (expected_id, secret, encryption_key) = {
        let entry = state.entry.lock().unwrap();
        let entry = entry.entry();
        (
            entry.webhook_id.clone(),
            entry.webhook_secret.clone(),
            entry.encryption_key.clone(),
        )
    };

    if webhook_id != expected_id {
        return (StatusCode::NOT_FOUND, "Unknown webhook.").into_response();
    }

    let received = headers
        .get("X-Webhook-Secret")
        .and_then(|v| v.to_str().ok());
    if received != Some(secret.as_str()) {
        warn!("webhook: secret mismatch or missing, rejecting");
        return (StatusCode::UNAUTHORIZED, "Unauthorized.").into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "webhook: malformed payload");
            return bad_request("Bad Request: malformed payload.");
        }
    };

    let service_call = match payload {
        WebhookPayload::Plain { service_call } => service_call,
        WebhookPayload::Encrypted { encrypted_payload } => {
            let decrypted = match crypto::decrypt_value(&encrypted_payload, &encryption_key) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "webhook: failed to decrypt payload");
                    return bad_request("Bad Request: failed to decrypt payload.");
                }
            };
            match serde_json::from_value(decrypted) {
                Ok(call) => call,
                Err(e) => {
                    warn!(error = %e, "webhook: decrypted payload has wrong shape");
                    return bad_request("Bad Request: invalid payload structure.");
                }
            }
        }
    };

    let call = service_call.into_service_call();
    info!(domain = %call.domain, service = %call.service, "webhook: calling service");

    match state.hass.call_service(&call).await {
        Ok(()) => Json(json!({
            "success": true,
            "message": format!("Service {}.{} called successfully.", call.domain, call.service),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": format!("Error calling service: {e}"),
            })),
        )
            .into_response(),
    }
}
