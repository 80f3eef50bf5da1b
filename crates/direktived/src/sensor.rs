//! Exposes the directive collection to Home Assistant as one MQTT
//! discovery sensor: state is the directive count, attributes carry the
//! full list.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

use crate::directives::Directive;
use crate::hass::mqtt::MqttClient;

const OBJECT_ID: &str = "direktived_directives";

#[derive(Debug, Serialize)]
struct DeviceInfo {
    identifiers: Vec<String>,
    name: String,
    manufacturer: String,
}

/// Home Assistant MQTT discovery config for the sensor.
#[derive(Debug, Serialize)]
struct DiscoveryConfig {
    name: String,
    unique_id: String,
    state_topic: String,
    json_attributes_topic: String,
    availability_topic: String,
    payload_available: String,
    payload_not_available: String,
    icon: String,
    device: DeviceInfo,
}

pub struct SensorTopics {
    pub config: String,
    pub state: String,
    pub attributes: String,
    pub availability: String,
}

impl SensorTopics {
    pub fn new(discovery_prefix: &str) -> Self {
        let base = format!("{discovery_prefix}/sensor/{OBJECT_ID}");
        SensorTopics {
            config: format!("{base}/config"),
            state: format!("{base}/state"),
            attributes: format!("{base}/attributes"),
            availability: format!("{base}/availability"),
        }
    }
}

fn discovery_config(topics: &SensorTopics) -> DiscoveryConfig {
    DiscoveryConfig {
        name: "Direktive Directives".to_string(),
        unique_id: OBJECT_ID.to_string(),
        state_topic: topics.state.clone(),
        json_attributes_topic: topics.attributes.clone(),
        availability_topic: topics.availability.clone(),
        payload_available: "online".to_string(),
        payload_not_available: "offline".to_string(),
        icon: "mdi:robot".to_string(),
        device: DeviceInfo {
            identifiers: vec!["direktived".to_string()],
            name: "Direktive.ai".to_string(),
            manufacturer: "Direktive.ai".to_string(),
        },
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

async fn publish_snapshot(
    client: &mut dyn MqttClient,
    topics: &SensorTopics,
    directives: &[Directive],
) {
    let state = directives.len().to_string();
    let attributes = json!({
        "directives": directives,
        "last_update": unix_now(),
    });

    if let Err(e) = client.publish(&topics.state, state.as_bytes(), true).await {
        error!(error = %e, "failed to publish sensor state");
        return;
    }
    if let Err(e) = client
        .publish(&topics.attributes, attributes.to_string().as_bytes(), true)
        .await
    {
        error!(error = %e, "failed to publish sensor attributes");
    }
}

/// Announce the sensor, then republish on every store snapshot until the
/// shutdown signal fires; `offline` goes out on the way down.
pub async fn run(
    mut client: Box<dyn MqttClient>,
    discovery_prefix: &str,
    mut snapshots: watch::Receiver<Arc<Vec<Directive>>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let topics = SensorTopics::new(discovery_prefix);

    let config = serde_json::to_vec(&discovery_config(&topics))?;
    client
        .publish(&topics.config, &config, true)
        .await
        .map_err(|e| anyhow::anyhow!("failed to publish discovery config: {e}"))?;
    client
        .publish(&topics.availability, b"online", true)
        .await
        .map_err(|e| anyhow::anyhow!("failed to publish availability: {e}"))?;

    let initial = snapshots.borrow().clone();
    publish_snapshot(client.as_mut(), &topics, &initial).await;

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                publish_snapshot(client.as_mut(), &topics, &snapshot).await;
            }
            _ = &mut shutdown_rx => break,
        }
    }

    if let Err(e) = client.publish(&topics.availability, b"offline", true).await {
        error!(error = %e, "failed to publish offline availability");
    }
    info!("sensor task exiting");
    Ok(())
}
