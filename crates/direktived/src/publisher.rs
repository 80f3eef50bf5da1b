//! Forwards tracked entity state changes to the cloud and feeds any
//! triggered scenarios back into the dispatcher.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::cloud::{CloudApi, EntityEnvelope, EntityStatePayload, PublishResponse};
use crate::crypto;
use crate::dispatch::{self, Scenario};
use crate::entry::EntryStore;
use crate::hass::mqtt::StateChanged;
use crate::hass::HomeAssistant;

/// The sun entity feeds day/night context to every scenario, so it is
/// tracked even when the configuration does not list it.
const SUN_ENTITY: &str = "sun.sun";

/// Attributes forwarded with a state change; everything else is stripped.
const ALLOWED_ATTRIBUTES: [&str; 9] = [
    "brightness",
    "color_temp",
    "rgb_color",
    "xy_color",
    "current_position",
    "current_temperature",
    "temperature",
    "hvac_mode",
    "preset_mode",
];

pub struct Publisher {
    api: Arc<dyn CloudApi>,
    hass: Arc<dyn HomeAssistant>,
    entry: Arc<Mutex<EntryStore>>,
    tracked: BTreeSet<String>,
    encryption_key: Option<String>,
}

impl Publisher {
    pub fn new(
        api: Arc<dyn CloudApi>,
        hass: Arc<dyn HomeAssistant>,
        entry: Arc<Mutex<EntryStore>>,
        entities: &[String],
    ) -> Self {
        let mut tracked: BTreeSet<String> = entities.iter().cloned().collect();
        tracked.insert(SUN_ENTITY.to_string());

        let encryption_key = {
            let entry = entry.lock().unwrap();
            let key = entry.entry().encryption_key.clone();
            (!key.is_empty()).then_some(key)
        };

        Publisher {
            api,
            hass,
            entry,
            tracked,
            encryption_key,
        }
    }

    pub fn is_tracked(&self, entity_id: &str) -> bool {
        self.tracked.contains(entity_id)
    }

    fn filter_attributes(attributes: &Map<String, Value>) -> Map<String, Value> {
        attributes
            .iter()
            .filter(|(k, _)| ALLOWED_ATTRIBUTES.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn envelope(&self, entities: Value) -> Result<EntityEnvelope, crypto::CryptoError> {
        match &self.encryption_key {
            Some(key) => Ok(EntityEnvelope {
                data: Value::String(crypto::encrypt_value(&entities, key)?),
                encrypted: true,
            }),
            None => Ok(EntityEnvelope {
                data: entities,
                encrypted: false,
            }),
        }
    }

    /// Publish one tracked entity transition. Untracked entities and null
    /// states are ignored. Errors are logged and swallowed; this runs on the
    /// event path where nothing can retry.
    pub async fn publish_state_change(&self, change: &StateChanged) {
        let Some(state) = &change.state else {
            return;
        };
        if !self.is_tracked(&change.entity_id) {
            return;
        }
        debug!(entity = %change.entity_id, state = %state, "publishing state change");

        let entities = json!([{
            "entity_id": change.entity_id,
            "state": state,
            "attributes": Self::filter_attributes(&change.attributes),
        }]);

        let envelope = match self.envelope(entities) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(error = %e, "failed to encrypt state payload");
                return;
            }
        };

        let payload = EntityStatePayload {
            entities: envelope,
            bulk: None,
            refresh: None,
        };

        match self.api.update_entity_state(&payload).await {
            Ok(response) => self.handle_response(response).await,
            Err(e) => error!(entity = %change.entity_id, error = %e, "state publish failed"),
        }
    }

    /// Push the current state of every tracked entity, once per
    /// installation. Skipped without any network traffic when the entry
    /// records a previous success; the flag is only set after a 2xx.
    pub async fn initial_sync(&self) -> anyhow::Result<()> {
        if self.entry.lock().unwrap().entry().initial_sync_performed {
            info!("initial bulk sync already performed, skipping");
            return Ok(());
        }

        let mut entities = Vec::new();
        for entity_id in &self.tracked {
            match self.hass.get_state(entity_id).await {
                Ok(Some(state)) => entities.push(json!({
                    "entity_id": state.entity_id,
                    "state": state.state,
                    "attributes": Self::filter_attributes(&state.attributes),
                })),
                Ok(None) => warn!(entity = %entity_id, "tracked entity unknown to home assistant"),
                Err(e) => warn!(entity = %entity_id, error = %e, "failed to read entity state"),
            }
        }

        if entities.is_empty() {
            info!("no tracked entity states to sync");
            return Ok(());
        }

        let payload = EntityStatePayload {
            entities: self.envelope(Value::Array(entities))?,
            bulk: Some(true),
            refresh: Some(true),
        };
        let response = self.api.update_entity_state(&payload).await?;

        self.entry
            .lock()
            .unwrap()
            .update(|e| e.initial_sync_performed = true)?;
        info!("initial bulk sync complete");

        self.handle_response(response).await;
        Ok(())
    }

    /// Decode and run any scenarios the publish response carried.
    async fn handle_response(&self, response: PublishResponse) {
        let Some(raw) = response.triggered_scenarios else {
            return;
        };
        match self.decode_scenarios(raw) {
            Ok(scenarios) => dispatch::apply_scenarios(self.hass.as_ref(), &scenarios).await,
            Err(e) => error!(error = %e, "ignoring undecodable triggered_scenarios"),
        }
    }

    /// Scenarios arrive as a plain JSON array, or base64 ciphertext when the
    /// tier encrypts them.
    pub fn decode_scenarios(&self, raw: Value) -> anyhow::Result<Vec<Scenario>> {
        let plain = match raw {
            Value::String(ciphertext) => match &self.encryption_key {
                Some(key) => crypto::decrypt_value(&ciphertext, key)?,
                None => anyhow::bail!("scenario payload is encrypted but no key is configured"),
            },
            other => other,
        };
        Ok(serde_json::from_value(plain)?)
    }
}
