mod alert;
mod board;
mod card;
mod config;
mod control;
mod display;
mod error;
mod keys;
mod mqtt;
mod payload;
mod sampler;
mod sim;
mod state;
mod upload;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use alert::AnomalyDetector;
use board::{KeyPins, OutputBoard};
use display::LogDisplay;
use keys::{KeyRecognizer, KeyTiming, QueueHandler};
use mqtt::{Topics, Uplink};
use sampler::Sampler;
use sim::{EnvironmentSim, Scenario};
use state::StateStore;
use upload::UploadScheduler;
use web::AppState;

/// Bound on queued key presses awaiting the action task.
const KEY_QUEUE: usize = 16;
const CARD_QUEUE: usize = 8;
const OUTBOUND_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);
    let scenario = env::var("SIM_SCENARIO")
        .map(|s| Scenario::from_str_lossy(&s))
        .unwrap_or(Scenario::Calm);
    let sim_card = env::var("SIM_CARD_USER").ok().filter(|s| !s.is_empty());
    let sim_card_hold = env::var("SIM_CARD_HOLD_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs);

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "station.toml".to_string());
    let cfg = config::load(&config_path)?;
    let timing = cfg.timing.clone();

    info!(
        config = %config_path,
        %scenario,
        auto_power_off = cfg.auto_power_off,
        prefix = %cfg.mqtt.topic_prefix,
        "station starting"
    );

    // ── Shared state ────────────────────────────────────────────────
    let store = StateStore::new();

    // ── Output board ────────────────────────────────────────────────
    let board = OutputBoard::new(&cfg.outputs).context("failed to initialise output board")?;
    tokio::spawn(board::run_output_driver(board, store.subscribe_outputs()));

    // ── Keys ────────────────────────────────────────────────────────
    let key_pins = KeyPins::new(&cfg.keys).context("failed to initialise key inputs")?;
    let (key_tx, key_rx) = mpsc::channel(KEY_QUEUE);
    let recognizer = KeyRecognizer::new(
        cfg.keys.iter().map(|k| k.id),
        KeyTiming::from(&timing),
        key_pins,
        QueueHandler::new(key_tx, &cfg.keys),
    );
    tokio::spawn(keys::run_recognizer(
        recognizer,
        Duration::from_millis(timing.key_tick_ms),
    ));
    tokio::spawn(keys::run_actions(store.clone(), key_rx));

    // ── Card reader ─────────────────────────────────────────────────
    let (card_tx, card_rx) = mpsc::channel(CARD_QUEUE);
    tokio::spawn(card::run_consumer(store.clone(), card_rx));
    tokio::spawn(card::run_sim_reader(sim_card, sim_card_hold, card_tx));

    // ── MQTT ────────────────────────────────────────────────────────
    let topics = Arc::new(Topics::new(&cfg.mqtt.topic_prefix));
    let mut mqttoptions = MqttOptions::new(cfg.mqtt.client_id.clone(), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_secs));
    if let (Some(user), Some(pass)) = (&cfg.mqtt.username, &cfg.mqtt.password) {
        mqttoptions.set_credentials(user.clone(), pass.clone());
    }
    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);

    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    tokio::spawn(mqtt::run_publisher(client.clone(), out_rx));
    let uplink = Arc::new(Uplink::new(Arc::clone(&topics), out_tx.clone()));

    // ── Display ─────────────────────────────────────────────────────
    let (display_tx, display_rx) = watch::channel(None);
    tokio::spawn(display::run_display(
        LogDisplay,
        display_rx,
        Duration::from_millis(timing.display_timeout_ms),
    ));

    // ── Sampling cycle ──────────────────────────────────────────────
    let sampler = Sampler::new(
        EnvironmentSim::new(scenario),
        store.clone(),
        AnomalyDetector::from_config(&cfg),
        cfg.auto_control.clone(),
        UploadScheduler::from_timing(&timing),
        Arc::clone(&uplink),
        display_tx,
    );
    tokio::spawn(sampler::run(
        sampler,
        Duration::from_millis(timing.sample_period_ms),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = AppState {
        store: store.clone(),
        uplink,
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_port).await {
            error!(error = %e, "web server stopped");
        }
    });

    store.record_system(format!("simulation scenario {scenario}")).await;

    mqtt::run_event_loop(eventloop, client, store, topics, out_tx).await;
    Ok(())
}
