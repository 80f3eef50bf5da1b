//! Home Assistant surface: the service-call/state trait, its REST
//! implementation, and the MQTT side (client trait + listener).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod mqtt;
mod rest;

pub use rest::RestHass;

#[derive(Debug, thiserror::Error)]
pub enum HassError {
    #[error("home assistant returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response shape: {0}")]
    Parse(#[from] serde_json::Error),
}

/// One service invocation. `entity_id` travels inside `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub domain: String,
    pub service: String,
    pub data: Map<String, Value>,
}

impl ServiceCall {
    pub fn new(domain: &str, service: &str, entity_id: &str) -> Self {
        let mut data = Map::new();
        data.insert("entity_id".to_string(), Value::String(entity_id.to_string()));
        ServiceCall {
            domain: domain.to_string(),
            service: service.to_string(),
            data,
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Current state of one entity as reported by Home Assistant.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[async_trait]
pub trait HomeAssistant: Send + Sync {
    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HassError>;
    async fn call_service(&self, call: &ServiceCall) -> Result<(), HassError>;
}
