use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::{EntityState, HassError, HomeAssistant, ServiceCall};

/// [`HomeAssistant`] over the HA REST API with a long-lived access token.
pub struct RestHass {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestHass {
    pub fn new(base_url: &str, token: &str) -> Self {
        RestHass {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }
}

#[async_trait]
impl HomeAssistant for RestHass {
    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HassError> {
        let response = self
            .client
            .get(format!("{}/api/states/{entity_id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let state: EntityState = serde_json::from_str(&response.text().await?)?;
                Ok(Some(state))
            }
            status => Err(HassError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn call_service(&self, call: &ServiceCall) -> Result<(), HassError> {
        let response = self
            .client
            .post(format!(
                "{}/api/services/{}/{}",
                self.base_url, call.domain, call.service
            ))
            .bearer_auth(&self.token)
            .json(&Value::Object(call.data.clone()))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HassError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}
