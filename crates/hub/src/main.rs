mod config;
mod db;
mod error;
mod feeder;
mod feedlog;
mod mqtt;
mod notify;
mod pond;
mod schedule;
mod state;
mod store;
mod timefmt;
mod trigger;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use mqtt::{extract_status_pond, FeederStatusMsg, MqttFeeder};
use pond::{PondRegistry, PondServices, PondSession};
use state::{StateNotifier, SystemState};
use store::{MemoryStore, SharedStore};
use timefmt::SystemClock;
use web::AppState;

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
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:aquafeed.db?mode=rwc".to_string());

    // ── Store ───────────────────────────────────────────────────────
    let store: SharedStore = if db_url == "memory" {
        warn!("DB_URL=memory: feeding data will not survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        let db = Db::connect(&db_url).await?;
        db.migrate().await?;
        Arc::new(db)
    };

    // ── Config file (seed pond keys) ────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    config::apply(&cfg, store.as_ref()).await?;

    if cfg.ponds.is_empty() {
        warn!("no ponds configured; nothing will be fed");
    }

    // ── Shared state (ephemeral, for /api/status) ───────────────────
    let shared = Arc::new(RwLock::new(SystemState::new()));
    shared.write().await.record_system("hub started".to_string());

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("aquafeed-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);

    // ── Pond sessions ───────────────────────────────────────────────
    let services = PondServices {
        store: store.clone(),
        notifier: Arc::new(StateNotifier::new(shared.clone())),
        feeder: Arc::new(MqttFeeder::new(client.clone())),
        clock: Arc::new(SystemClock::new(cfg.feeding.offset())),
        respect_manual_mode: cfg.feeding.respect_manual_mode,
        poll_interval: cfg.feeding.poll_interval(),
    };

    let mut registry = PondRegistry::new();
    for p in &cfg.ponds {
        registry.insert(PondSession::open(&services, &p.pond_id, &p.name).await);
    }
    info!(
        ponds = registry.ids().len(),
        utc_offset = %cfg.feeding.utc_offset,
        "pond sessions open"
    );

    // ── Web server ──────────────────────────────────────────────────
    let app = AppState {
        ponds: Arc::new(registry),
        system: Arc::clone(&shared),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!("{e:#}");
        }
    });

    // ── MQTT event loop ─────────────────────────────────────────────
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(pond_id) = extract_status_pond(&p.topic) else {
                    debug!(topic = %p.topic, "unhandled topic");
                    continue;
                };
                match serde_json::from_slice::<FeederStatusMsg>(&p.payload) {
                    Ok(msg) => {
                        info!(pond = %pond_id, ts = msg.ts, kg = msg.kg, ok = msg.ok, "feeder status");
                        let mut st = shared.write().await;
                        st.record_feeder(pond_id, msg.kg, msg.ok, msg.detail);
                    }
                    Err(e) => {
                        warn!(topic = %p.topic, "bad feeder status json: {e}");
                        let mut st = shared.write().await;
                        st.record_error(format!("bad feeder status json: {e}"));
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean sessions drop subscriptions across reconnects.
                if let Err(e) = client.try_subscribe("feeder/+/status", QoS::AtLeastOnce) {
                    warn!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}
