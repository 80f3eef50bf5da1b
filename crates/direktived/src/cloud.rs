//! Client for the Direktive.ai HTTP API.
//!
//! Every request carries `x-api-key` and, once an encryption key exists,
//! `x-encryption-key`. Non-2xx responses surface as [`ApiError::Status`] with
//! the body attached. There is no retry at this layer; callers decide whether
//! a failure is fatal, reported, or just logged.

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::directives::Directive;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("api returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api response is missing the `{0}` field")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub plan: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookRegistration {
    pub webhook_ha_id: String,
    pub webhook_secret: String,
    pub ha_base_url: String,
    pub ha_country: String,
    pub ha_timezone: String,
    pub ha_location: String,
}

/// `entities` envelope of `/update-entity-state`.
#[derive(Debug, Serialize)]
pub struct EntityEnvelope {
    pub data: Value,
    pub encrypted: bool,
}

#[derive(Debug, Serialize)]
pub struct EntityStatePayload {
    pub entities: EntityEnvelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulk: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishResponse {
    /// Scenario outcomes triggered by this state change. A JSON array when
    /// plain, a base64 string when the tier encrypts it.
    #[serde(default)]
    pub triggered_scenarios: Option<Value>,
}

/// Payload of `GET /directive/stage/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StageInfo {
    pub stage: crate::directives::CreationStage,
    #[serde(default)]
    pub stage_message: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<crate::directives::DirectiveStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationResponse {
    #[serde(default)]
    pub messages: Vec<Value>,
    /// Set by the service when the directive itself changed and should be
    /// re-polled.
    #[serde(default)]
    pub pull: bool,
}

/// The remote operations the rest of the daemon depends on. Trait-shaped so
/// tests can substitute a recording fake for the HTTP client.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn health(&self) -> Result<(), ApiError>;
    async fn subscription(&self) -> Result<SubscriptionInfo, ApiError>;
    async fn register_webhook(&self, registration: &WebhookRegistration) -> Result<(), ApiError>;
    async fn update_entity_state(
        &self,
        payload: &EntityStatePayload,
    ) -> Result<PublishResponse, ApiError>;
    async fn list_directives(&self) -> Result<Vec<Directive>, ApiError>;
    async fn create_directive(&self, message: &str) -> Result<String, ApiError>;
    async fn get_directive(&self, id: &str) -> Result<Directive, ApiError>;
    async fn update_directive(&self, id: &str, message: &str) -> Result<(), ApiError>;
    async fn delete_directive(&self, id: &str) -> Result<(), ApiError>;
    async fn directive_stage(&self, id: &str) -> Result<StageInfo, ApiError>;
    async fn get_conversation(&self, id: &str) -> Result<ConversationResponse, ApiError>;
    async fn send_conversation_message(
        &self,
        id: &str,
        prompt: &str,
    ) -> Result<ConversationResponse, ApiError>;
}

pub struct CloudClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    encryption_key: Option<String>,
}

impl CloudClient {
    pub fn new(base_url: &str, api_key: &str, encryption_key: Option<&str>) -> Self {
        CloudClient {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            encryption_key: encryption_key.map(str::to_string),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key);
        if let Some(key) = &self.encryption_key {
            req = req.header("x-encryption-key", key);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        // Some endpoints respond with an empty body on success.
        let raw = response.text().await?;
        if raw.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&raw).map_err(|_| ApiError::Status {
            status: status.as_u16(),
            body: raw,
        })
    }
}

#[async_trait]
impl CloudApi for CloudClient {
    async fn health(&self) -> Result<(), ApiError> {
        self.request(Method::GET, "/health", None).await?;
        Ok(())
    }

    async fn subscription(&self) -> Result<SubscriptionInfo, ApiError> {
        let value = self.request(Method::GET, "/subscription", None).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn register_webhook(&self, registration: &WebhookRegistration) -> Result<(), ApiError> {
        let body = serde_json::to_value(registration).expect("registration serializes");
        self.request(Method::POST, "/register-ha-webhook", Some(&body))
            .await?;
        Ok(())
    }

    async fn update_entity_state(
        &self,
        payload: &EntityStatePayload,
    ) -> Result<PublishResponse, ApiError> {
        let body = serde_json::to_value(payload).expect("payload serializes");
        let value = self
            .request(Method::POST, "/update-entity-state", Some(&body))
            .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn list_directives(&self) -> Result<Vec<Directive>, ApiError> {
        let value = self.request(Method::GET, "/directive", None).await?;
        let directives = value
            .get("directives")
            .cloned()
            .ok_or(ApiError::MissingField("directives"))?;
        serde_json::from_value(directives).map_err(|_| ApiError::MissingField("directives"))
    }

    async fn create_directive(&self, message: &str) -> Result<String, ApiError> {
        let body = serde_json::json!({ "message": message });
        let value = self.request(Method::POST, "/directive", Some(&body)).await?;
        value
            .get("directive_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ApiError::MissingField("directive_id"))
    }

    async fn get_directive(&self, id: &str) -> Result<Directive, ApiError> {
        let value = self
            .request(Method::GET, &format!("/directive/{id}"), None)
            .await?;
        let directive = value
            .get("directive")
            .cloned()
            .ok_or(ApiError::MissingField("directive"))?;
        serde_json::from_value(directive).map_err(|_| ApiError::MissingField("directive"))
    }

    async fn update_directive(&self, id: &str, message: &str) -> Result<(), ApiError> {
        let body = serde_json::json!({ "message": message });
        self.request(Method::PUT, &format!("/directive/{id}"), Some(&body))
            .await?;
        Ok(())
    }

    async fn delete_directive(&self, id: &str) -> Result<(), ApiError> {
        self.request(Method::DELETE, &format!("/directive/{id}"), None)
            .await?;
        Ok(())
    }

    async fn directive_stage(&self, id: &str) -> Result<StageInfo, ApiError> {
        let value = self
            .request(Method::GET, &format!("/directive/stage/{id}"), None)
            .await?;
        serde_json::from_value(value).map_err(|_| ApiError::MissingField("stage"))
    }

    async fn get_conversation(&self, id: &str) -> Result<ConversationResponse, ApiError> {
        let value = self
            .request(Method::GET, &format!("/conversation/{id}"), None)
            .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    async fn send_conversation_message(
        &self,
        id: &str,
        prompt: &str,
    ) -> Result<ConversationResponse, ApiError> {
        let body = serde_json::json!({ "directive_id": id, "prompt": prompt });
        let value = self.request(Method::POST, "/conversation", Some(&body)).await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }
}
