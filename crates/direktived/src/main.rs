use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use direktived::cloud::{CloudApi, CloudClient, WebhookRegistration};
use direktived::config::{Config, LoggingConfig};
use direktived::directives::{Coordinator, DirectiveStore};
use direktived::dispatch;
use direktived::entry::{EntryStore, Subscription};
use direktived::hass::mqtt::{run_listener, BridgeEvent, MqttClient, RumqttcClient};
use direktived::hass::{HomeAssistant, RestHass};
use direktived::publisher::Publisher;
use direktived::sensor;
use direktived::server::{self, AppState};

#[derive(Parser)]
#[command(name = "direktived", about = "Home Assistant bridge for Direktive.ai")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "direktived.toml")]
    config: PathBuf,

    /// Directory holding persisted state
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
}

fn init_tracing(logging: &LoggingConfig) {
    let mut filter = tracing_subscriber::filter::Targets::new()
        .with_default(tracing_subscriber::filter::LevelFilter::from(logging.level));
    for (target, level) in &logging.overrides {
        filter = filter.with_target(
            target.clone(),
            tracing_subscriber::filter::LevelFilter::from(*level),
        );
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    init_tracing(&config.logging);

    info!("direktived starting");

    let entry = Arc::new(Mutex::new(
        EntryStore::open(&cli.data_dir).context("failed to open entry state")?,
    ));
    let encryption_key = entry.lock().unwrap().entry().encryption_key.clone();

    let api: Arc<dyn CloudApi> = Arc::new(CloudClient::new(
        &config.api.base_url,
        &config.api.api_key,
        Some(&encryption_key),
    ));

    // Connectivity is a hard requirement at startup.
    api.health().await.context("cloud health check failed")?;
    info!("cloud API reachable at {}", config.api.base_url);

    match api.subscription().await {
        Ok(subscription) => {
            entry.lock().unwrap().update(|e| {
                e.subscription = Some(Subscription {
                    plan: subscription.plan,
                    active: true,
                    directive_limit: None,
                });
            })?;
        }
        Err(e) => warn!(error = %e, "failed to refresh subscription plan"),
    }

    register_webhook_once(&config, api.as_ref(), &entry).await?;

    let hass: Arc<dyn HomeAssistant> = Arc::new(RestHass::new(
        &config.homeassistant.base_url,
        &config.homeassistant.access_token,
    ));

    let store = Arc::new(DirectiveStore::new());
    let coordinator = Arc::new(Coordinator::new(api.clone(), store.clone()));
    if let Err(e) = coordinator.refresh().await {
        warn!(error = %e, "initial directive refresh failed");
    }

    let publisher = Arc::new(Publisher::new(
        api.clone(),
        hass.clone(),
        entry.clone(),
        &config.entities,
    ));
    if let Err(e) = publisher.initial_sync().await {
        warn!(error = %e, "initial bulk sync failed, retrying next start");
    }

    let mut sensor_shutdown_tx = None;
    if let Some(mqtt_config) = &config.mqtt {
        let mut listener_client = RumqttcClient::new(mqtt_config, "listener");
        listener_client
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("MQTT connect failed: {e}"))?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let state_topic = mqtt_config.state_topic.clone();
        let scenario_topic = mqtt_config.scenario_trigger_topic.clone();
        tokio::spawn(async move {
            if let Err(e) =
                run_listener(Box::new(listener_client), state_topic, scenario_topic, event_tx)
                    .await
            {
                error!(error = %e, "MQTT listener failed");
            }
        });

        let pump_publisher = publisher.clone();
        let pump_hass = hass.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    BridgeEvent::StateChanged(change) => {
                        pump_publisher.publish_state_change(&change).await;
                    }
                    BridgeEvent::ScenarioTriggers(raw) => {
                        match pump_publisher.decode_scenarios(raw) {
                            Ok(scenarios) => {
                                dispatch::apply_scenarios(pump_hass.as_ref(), &scenarios).await;
                            }
                            Err(e) => error!(error = %e, "undecodable scenario trigger payload"),
                        }
                    }
                }
            }
        });

        let mut sensor_client = RumqttcClient::new(mqtt_config, "sensor");
        sensor_client
            .connect()
            .await
            .map_err(|e| anyhow::anyhow!("MQTT connect failed: {e}"))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        sensor_shutdown_tx = Some(shutdown_tx);
        let discovery_prefix = mqtt_config.discovery_prefix.clone();
        let snapshots = store.subscribe();
        tokio::spawn(async move {
            if let Err(e) =
                sensor::run(Box::new(sensor_client), &discovery_prefix, snapshots, shutdown_rx)
                    .await
            {
                error!(error = %e, "sensor task failed");
            }
        });
    } else {
        info!("no [mqtt] section configured, state changes and sensor disabled");
    }

    let (server_shutdown_tx, server_shutdown_rx) = oneshot::channel();
    let state = AppState::new(entry.clone(), coordinator.clone(), hass.clone());
    let server_handle = tokio::spawn(server::serve(
        config.server.listen.clone(),
        config.server.port,
        state,
        server_shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    coordinator.shutdown();
    if let Some(tx) = sensor_shutdown_tx {
        let _ = tx.send(());
    }
    let _ = server_shutdown_tx.send(());
    server_handle.await??;

    info!("direktived stopped");
    Ok(())
}

/// Register our webhook URL with the cloud once per installation. A failure
/// leaves the flag unset so the next start tries again.
async fn register_webhook_once(
    config: &Config,
    api: &dyn CloudApi,
    entry: &Arc<Mutex<EntryStore>>,
) -> anyhow::Result<()> {
    let registration = {
        let entry = entry.lock().unwrap();
        let data = entry.entry();
        if data.webhook_registered_to_api {
            return Ok(());
        }
        WebhookRegistration {
            webhook_ha_id: data.webhook_id.clone(),
            webhook_secret: data.webhook_secret.clone(),
            ha_base_url: config.homeassistant.base_url.clone(),
            ha_country: config.homeassistant.country.clone().unwrap_or_default(),
            ha_timezone: config.homeassistant.timezone.clone().unwrap_or_default(),
            ha_location: config
                .homeassistant
                .location_name
                .clone()
                .unwrap_or_default(),
        }
    };

    match api.register_webhook(&registration).await {
        Ok(()) => {
            entry
                .lock()
                .unwrap()
                .update(|e| e.webhook_registered_to_api = true)?;
            info!("webhook registered with cloud API");
        }
        Err(e) => warn!(error = %e, "webhook registration failed, retrying next start"),
    }
    Ok(())
}
