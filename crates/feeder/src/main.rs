mod auger;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use auger::{run_duration, Auger};

/// Payload of `feeder/<pond_id>/feed`.
#[derive(Debug, Deserialize)]
struct FeedCommand {
    ts: i64,
    kg: f64,
    diameter_mm: u32,
    #[serde(default)]
    method: String,
}

/// Payload of `feeder/<pond_id>/status`.
#[derive(Debug, Serialize)]
struct StatusMsg {
    ts: i64,
    kg: f64,
    ok: bool,
    detail: String,
}

/// Commands older than this were queued through an outage and are not run.
const MAX_COMMAND_AGE_SECS: i64 = 60;

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Dispense one command and describe the outcome. `now` is unix seconds.
async fn dispense(auger: &mut Auger, cmd: &FeedCommand, now: i64) -> StatusMsg {
    let age = now - cmd.ts;
    if age > MAX_COMMAND_AGE_SECS {
        warn!(ts = cmd.ts, age_secs = age, "stale feed command dropped");
        return StatusMsg {
            ts: now,
            kg: cmd.kg,
            ok: false,
            detail: "stale command".to_string(),
        };
    }

    let (ok, detail) = match run_duration(cmd.kg, cmd.diameter_mm) {
        Ok(d) => {
            info!(kg = cmd.kg, diameter_mm = cmd.diameter_mm, secs = d.as_secs_f64(), "dispensing");
            auger.run_for(d).await;
            (true, format!("ran {:.1}s", d.as_secs_f64()))
        }
        Err(e) => {
            warn!("feed command rejected: {e}");
            (false, e.to_string())
        }
    };
    StatusMsg {
        ts: now_unix(),
        kg: cmd.kg,
        ok,
        detail,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let pond_id = env::var("POND_ID").unwrap_or_else(|_| "pond-a".to_string());
    let relay_gpio: u8 = env::var("RELAY_GPIO")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(17);
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let mut auger = Auger::new(relay_gpio, active_low)?;

    let mut mqttoptions = MqttOptions::new(format!("aquafeed-feeder-{pond_id}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    let feed_topic = format!("feeder/{pond_id}/feed");
    let status_topic = format!("feeder/{pond_id}/status");

    // Runs are serialized; the event loop keeps polling while the motor turns.
    let (tx, mut rx) = mpsc::channel::<FeedCommand>(8);
    let publisher = client.clone();
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            info!(ts = cmd.ts, method = %cmd.method, "feed command");
            let status = dispense(&mut auger, &cmd, now_unix()).await;
            match serde_json::to_vec(&status) {
                Ok(payload) => {
                    if let Err(e) =
                        publisher.try_publish(&status_topic, QoS::AtLeastOnce, false, payload)
                    {
                        error!("status publish error: {e}");
                    }
                }
                Err(e) => error!("status encode error: {e}"),
            }
        }
    });

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(topic = %feed_topic, "feeder connected to mqtt");
                if let Err(e) = client.try_subscribe(&feed_topic, QoS::AtLeastOnce) {
                    warn!("subscribe failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) if p.topic == feed_topic => {
                match serde_json::from_slice::<FeedCommand>(&p.payload) {
                    Ok(cmd) => {
                        if tx.try_send(cmd).is_err() {
                            warn!("feed queue full, command dropped");
                        }
                    }
                    Err(e) => warn!("bad feed command json: {e}"),
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. retrying...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_unix_is_recent() {
        let ts = now_unix();
        assert!(ts > 1_704_067_200, "timestamp too old: {ts}");
        assert!(ts < 2_208_988_800, "timestamp too far in future: {ts}");
    }

    #[test]
    fn feed_command_parses_hub_payload() {
        let json = r#"{"ts":1700000000,"kg":1.5,"diameter_mm":30,"method":"auto"}"#;
        let cmd: FeedCommand = serde_json::from_str(json).unwrap();
        assert_eq!(cmd.kg, 1.5);
        assert_eq!(cmd.diameter_mm, 30);
        assert_eq!(cmd.method, "auto");
    }

    #[test]
    fn feed_command_missing_quantity_fails() {
        assert!(serde_json::from_str::<FeedCommand>(r#"{"ts":1,"diameter_mm":30}"#).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dispense_reports_run_time() {
        let mut auger = Auger::new(17, true).unwrap();
        let cmd = FeedCommand {
            ts: 1,
            kg: 1.0,
            diameter_mm: 30,
            method: "manual".into(),
        };
        let status = dispense(&mut auger, &cmd, 5).await;
        assert!(status.ok);
        assert_eq!(status.detail, "ran 10.0s");
        assert_eq!(auger.runs, 1);
    }

    #[tokio::test]
    async fn dispense_rejects_bad_diameter_without_running() {
        let mut auger = Auger::new(17, true).unwrap();
        let cmd = FeedCommand {
            ts: 1,
            kg: 1.0,
            diameter_mm: 25,
            method: "auto".into(),
        };
        let status = dispense(&mut auger, &cmd, 5).await;
        assert!(!status.ok);
        assert_eq!(auger.runs, 0);
    }

    #[tokio::test]
    async fn dispense_drops_command_queued_through_outage() {
        let mut auger = Auger::new(17, true).unwrap();
        let queued_at = 1_700_000_000;
        let cmd = FeedCommand {
            ts: queued_at,
            kg: 1.0,
            diameter_mm: 30,
            method: "auto".into(),
        };
        // Broker came back three hours later.
        let status = dispense(&mut auger, &cmd, queued_at + 3 * 3600).await;
        assert!(!status.ok);
        assert_eq!(status.detail, "stale command");
        assert_eq!(auger.runs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispense_runs_command_within_age_limit() {
        let mut auger = Auger::new(17, true).unwrap();
        let cmd = FeedCommand {
            ts: 1_700_000_000,
            kg: 0.5,
            diameter_mm: 40,
            method: "auto".into(),
        };
        let status = dispense(&mut auger, &cmd, 1_700_000_000 + MAX_COMMAND_AGE_SECS).await;
        assert!(status.ok);
        assert_eq!(auger.runs, 1);
    }

    #[test]
    fn status_serializes_hub_fields() {
        let msg = StatusMsg {
            ts: 1,
            kg: 0.5,
            ok: true,
            detail: "ran 5.0s".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 4);
        assert_eq!(json["ok"], true);
    }
}
