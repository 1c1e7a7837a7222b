use anyhow::Context;
use async_trait::async_trait;
use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;

use crate::feeder::{FeedCommand, Feeder};

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

/// Payload of `feeder/<pond_id>/status`, published by a feeder node after
/// each run.
#[derive(Debug, Deserialize)]
pub(crate) struct FeederStatusMsg {
    pub(crate) ts: i64,
    pub(crate) kg: f64,
    pub(crate) ok: bool,
    #[serde(default)]
    pub(crate) detail: String,
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

pub(crate) fn feed_topic(pond_id: &str) -> String {
    format!("feeder/{pond_id}/feed")
}

/// Extract pond_id from "feeder/<pond_id>/status".
pub(crate) fn extract_status_pond(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "feeder" && parts[2] == "status" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Publishes feed commands; the hub's event loop owns the connection.
///
/// Never waits on the request queue: a full queue (broker unreachable) is a
/// failed dispatch, not a stalled caller.
pub struct MqttFeeder {
    client: AsyncClient,
}

impl MqttFeeder {
    pub fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Feeder for MqttFeeder {
    async fn dispense(&self, pond_id: &str, cmd: &FeedCommand) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(cmd).context("encode feed command")?;
        self.client
            .try_publish(feed_topic(pond_id), QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish feed command for {pond_id}"))?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedlog::FeedMethod;

    // -- topics -------------------------------------------------------------

    #[test]
    fn feed_topic_format() {
        assert_eq!(feed_topic("pond-a"), "feeder/pond-a/feed");
    }

    #[test]
    fn extract_status_pond_valid_topic() {
        assert_eq!(extract_status_pond("feeder/pond-a/status"), Some("pond-a"));
    }

    #[test]
    fn extract_status_pond_wrong_suffix() {
        assert_eq!(extract_status_pond("feeder/pond-a/feed"), None);
    }

    #[test]
    fn extract_status_pond_wrong_prefix() {
        assert_eq!(extract_status_pond("sensor/pond-a/status"), None);
    }

    #[test]
    fn extract_status_pond_segment_counts() {
        assert_eq!(extract_status_pond("feeder/status"), None);
        assert_eq!(extract_status_pond("feeder/a/b/status"), None);
        assert_eq!(extract_status_pond("feeder//status"), None);
        assert_eq!(extract_status_pond(""), None);
    }

    // -- payloads -----------------------------------------------------------

    #[test]
    fn feed_command_serializes_method_lowercase() {
        let cmd = FeedCommand {
            ts: 1_700_000_000,
            kg: 1.5,
            diameter_mm: 30,
            method: FeedMethod::Auto,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["method"], "auto");
        assert_eq!(json["diameter_mm"], 30);
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn status_msg_deserialize_valid() {
        let json = r#"{"ts":1700000000,"kg":1.5,"ok":true,"detail":"ran 15s"}"#;
        let msg: FeederStatusMsg = serde_json::from_str(json).unwrap();
        assert_eq!(msg.ts, 1_700_000_000);
        assert!(msg.ok);
        assert_eq!(msg.detail, "ran 15s");
    }

    #[test]
    fn status_msg_detail_optional() {
        let json = r#"{"ts":1,"kg":0.5,"ok":false}"#;
        let msg: FeederStatusMsg = serde_json::from_str(json).unwrap();
        assert!(!msg.ok);
        assert!(msg.detail.is_empty());
    }

    #[test]
    fn status_msg_missing_field_fails() {
        assert!(serde_json::from_str::<FeederStatusMsg>(r#"{"ts":1}"#).is_err());
    }

    #[tokio::test]
    async fn mqtt_feeder_queues_publish_without_broker() {
        // The event loop is never polled; publishes sit in the request queue.
        let opts = rumqttc::MqttOptions::new("test-feeder", "127.0.0.1", 1883);
        let (client, _el) = AsyncClient::new(opts, 10);
        let feeder = MqttFeeder::new(client);
        let cmd = FeedCommand {
            ts: 1,
            kg: 1.0,
            diameter_mm: 20,
            method: FeedMethod::Manual,
        };
        feeder.dispense("pond-a", &cmd).await.unwrap();
    }

    #[tokio::test]
    async fn full_request_queue_fails_fast() {
        let opts = rumqttc::MqttOptions::new("test-feeder", "127.0.0.1", 1);
        let (client, _el) = AsyncClient::new(opts, 20);
        let feeder = MqttFeeder::new(client);
        let cmd = FeedCommand {
            ts: 1,
            kg: 1.0,
            diameter_mm: 30,
            method: FeedMethod::Auto,
        };

        let mut failed = 0;
        for i in 0..25 {
            let sent = tokio::time::timeout(
                std::time::Duration::from_secs(2),
                feeder.dispense("pond-a", &cmd),
            )
            .await
            .unwrap_or_else(|_| panic!("dispense #{i} blocked"));
            if sent.is_err() {
                failed += 1;
            }
        }
        // The event loop is never polled, so the queue cannot drain.
        assert!(failed >= 5, "only {failed} dispatches failed");
    }
}
