//! Turns cloud scenario outcomes into Home Assistant service calls.
//!
//! Planning is a pure function from one outcome to a list of service calls;
//! execution runs the plans per outcome with local recovery, so a bad outcome
//! never takes its siblings down.

use serde::Deserialize;
use serde_json::{Map, Value};
use strum::EnumString;
use tracing::{debug, error, warn};

use crate::hass::{HomeAssistant, ServiceCall};

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub scenario_name: Option<String>,
    #[serde(default)]
    pub outcomes: Vec<Outcome>,
}

/// One desired end-state for one entity.
#[derive(Debug, Clone, Deserialize)]
pub struct Outcome {
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum Domain {
    Light,
    Switch,
    AlarmControlPanel,
    Cover,
    Climate,
    Number,
    #[strum(default)]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OutcomeError {
    #[error("outcome has no entity_id")]
    MissingEntityId,

    #[error("outcome for {0} has no state")]
    MissingState(String),

    #[error("no service maps to state {state:?} for {entity_id}")]
    UnsupportedState { entity_id: String, state: Value },
}

const ALARM_SERVICES: [&str; 4] = ["armed_home", "armed_away", "armed_night", "disarmed"];
const HVAC_MODES: [&str; 4] = ["heat", "cool", "auto", "off"];

fn copy_attr(call: ServiceCall, attributes: &Map<String, Value>, key: &str) -> ServiceCall {
    match attributes.get(key) {
        Some(value) => call.with(key, value.clone()),
        None => call,
    }
}

/// Plan the service calls for one outcome. Climate outcomes with a target
/// temperature yield two independent calls.
pub fn plan_outcome(outcome: &Outcome) -> Result<Vec<ServiceCall>, OutcomeError> {
    let entity_id = outcome
        .entity_id
        .as_deref()
        .ok_or(OutcomeError::MissingEntityId)?;
    let state = outcome
        .state
        .as_ref()
        .filter(|s| !s.is_null())
        .ok_or_else(|| OutcomeError::MissingState(entity_id.to_string()))?;

    let prefix = entity_id.split('.').next().unwrap_or_default();
    let domain = prefix
        .parse::<Domain>()
        .unwrap_or_else(|_| Domain::Other(prefix.to_string()));
    let state_str = state.as_str().unwrap_or_default();

    let unsupported = || OutcomeError::UnsupportedState {
        entity_id: entity_id.to_string(),
        state: state.clone(),
    };

    let calls = match domain {
        Domain::Light => {
            if state_str == "on" {
                let call = ["brightness", "color_temp", "rgb_color", "xy_color"]
                    .into_iter()
                    .fold(ServiceCall::new(prefix, "turn_on", entity_id), |call, key| {
                        copy_attr(call, &outcome.attributes, key)
                    });
                vec![call]
            } else {
                vec![ServiceCall::new(prefix, "turn_off", entity_id)]
            }
        }

        Domain::AlarmControlPanel => {
            if !ALARM_SERVICES.contains(&state_str) {
                return Err(unsupported());
            }
            vec![copy_attr(
                ServiceCall::new(prefix, state_str, entity_id),
                &outcome.attributes,
                "code",
            )]
        }

        Domain::Cover => {
            // A target position takes precedence over the named states.
            if let Some(position) = outcome.attributes.get("position") {
                vec![ServiceCall::new(prefix, "set_cover_position", entity_id)
                    .with("position", position.clone())]
            } else {
                let service = match state_str {
                    "open" => "open_cover",
                    "closed" => "close_cover",
                    "stop" => "stop_cover",
                    _ => return Err(unsupported()),
                };
                vec![ServiceCall::new(prefix, service, entity_id)]
            }
        }

        Domain::Climate => {
            let mut calls = Vec::new();
            if HVAC_MODES.contains(&state_str) {
                calls.push(
                    ServiceCall::new(prefix, "set_hvac_mode", entity_id)
                        .with("hvac_mode", state.clone()),
                );
            }
            if let Some(temperature) = outcome.attributes.get("temperature") {
                calls.push(
                    ServiceCall::new(prefix, "set_temperature", entity_id)
                        .with("temperature", temperature.clone()),
                );
            }
            if calls.is_empty() {
                return Err(unsupported());
            }
            calls
        }

        Domain::Number => {
            vec![ServiceCall::new(prefix, "set_value", entity_id).with("value", state.clone())]
        }

        // switch and everything unrecognized share the on/off fallback
        Domain::Switch | Domain::Other(_) => {
            let service = if state_str == "on" { "turn_on" } else { "turn_off" };
            vec![ServiceCall::new(prefix, service, entity_id)]
        }
    };

    Ok(calls)
}

/// Execute every outcome of every scenario, isolating failures per outcome.
pub async fn apply_scenarios(hass: &dyn HomeAssistant, scenarios: &[Scenario]) {
    for scenario in scenarios {
        debug!(scenario = ?scenario.scenario_name, "processing scenario");

        for outcome in &scenario.outcomes {
            let calls = match plan_outcome(outcome) {
                Ok(calls) => calls,
                Err(e) => {
                    warn!(error = %e, "skipping scenario outcome");
                    continue;
                }
            };

            for call in calls {
                if let Err(e) = hass.call_service(&call).await {
                    error!(
                        domain = %call.domain,
                        service = %call.service,
                        error = %e,
                        "scenario service call failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hass::mock::MockHass;
    use serde_json::json;

    fn outcome(entity_id: &str, state: Value, attributes: Value) -> Outcome {
        Outcome {
            entity_id: Some(entity_id.to_string()),
            state: Some(state),
            attributes: attributes.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_light_on_copies_light_attributes() {
        let calls = plan_outcome(&outcome(
            "light.kitchen",
            json!("on"),
            json!({"brightness": 128, "preset_mode": "reading"}),
        ))
        .unwrap();

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].service, "turn_on");
        assert_eq!(calls[0].data["brightness"], json!(128));
        // Only the light attributes are mapped.
        assert!(!calls[0].data.contains_key("preset_mode"));
    }

    #[test]
    fn test_light_off_drops_attributes() {
        let calls = plan_outcome(&outcome(
            "light.kitchen",
            json!("off"),
            json!({"brightness": 128}),
        ))
        .unwrap();
        assert_eq!(calls[0].service, "turn_off");
        assert!(!calls[0].data.contains_key("brightness"));
    }

    #[test]
    fn test_climate_heat_with_temperature_yields_two_calls() {
        let calls = plan_outcome(&outcome(
            "climate.living_room",
            json!("heat"),
            json!({"temperature": 21}),
        ))
        .unwrap();

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].service, "set_hvac_mode");
        assert_eq!(calls[0].data["hvac_mode"], json!("heat"));
        assert_eq!(calls[1].service, "set_temperature");
        assert_eq!(calls[1].data["temperature"], json!(21));
    }

    #[test]
    fn test_alarm_unknown_state_is_skipped() {
        let err = plan_outcome(&outcome("alarm_control_panel.home", json!("armed_maybe"), json!({})))
            .unwrap_err();
        assert!(matches!(err, OutcomeError::UnsupportedState { .. }));

        let calls =
            plan_outcome(&outcome("alarm_control_panel.home", json!("armed_night"), json!({})))
                .unwrap();
        assert_eq!(calls[0].service, "armed_night");
    }

    #[test]
    fn test_cover_position_overrides_state() {
        let calls = plan_outcome(&outcome("cover.blinds", json!("open"), json!({"position": 40})))
            .unwrap();
        assert_eq!(calls[0].service, "set_cover_position");
        assert_eq!(calls[0].data["position"], json!(40));
    }

    #[test]
    fn test_number_uses_raw_state_value() {
        let calls = plan_outcome(&outcome("number.volume", json!(7), json!({}))).unwrap();
        assert_eq!(calls[0].service, "set_value");
        assert_eq!(calls[0].data["value"], json!(7));
    }

    #[test]
    fn test_unknown_domain_falls_back_to_on_off() {
        let calls = plan_outcome(&outcome("media_player.tv", json!("on"), json!({}))).unwrap();
        assert_eq!(calls[0].domain, "media_player");
        assert_eq!(calls[0].service, "turn_on");
    }

    #[tokio::test]
    async fn test_bad_outcome_does_not_abort_siblings() {
        let hass = MockHass::default();
        let scenarios = vec![Scenario {
            scenario_name: Some("evening".to_string()),
            outcomes: vec![
                Outcome {
                    entity_id: None,
                    state: Some(json!("on")),
                    attributes: Map::new(),
                },
                outcome("switch.porch", json!("on"), json!({})),
            ],
        }];

        apply_scenarios(&hass, &scenarios).await;

        let calls = hass.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].data["entity_id"], json!("switch.porch"));
    }

    #[tokio::test]
    async fn test_failed_service_call_does_not_abort_batch() {
        let hass = MockHass::default();
        hass.fail_services.lock().unwrap().push("turn_off".to_string());

        let scenarios = vec![Scenario {
            scenario_name: None,
            outcomes: vec![
                outcome("light.kitchen", json!("off"), json!({})),
                outcome("light.hall", json!("on"), json!({})),
            ],
        }];

        apply_scenarios(&hass, &scenarios).await;
        assert_eq!(hass.calls().len(), 1);
    }
}
