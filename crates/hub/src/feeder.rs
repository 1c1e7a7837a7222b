//! Feed dispatch seam. The hub only asks a feeder to dispense; the physical
//! run happens on the feeder node, which reports back over MQTT.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::feedlog::FeedMethod;

/// Payload of `feeder/<pond_id>/feed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedCommand {
    pub ts: i64,
    pub kg: f64,
    pub diameter_mm: u32,
    pub method: FeedMethod,
}

#[async_trait]
pub trait Feeder: Send + Sync {
    async fn dispense(&self, pond_id: &str, cmd: &FeedCommand) -> anyhow::Result<()>;
}

pub type SharedFeeder = Arc<dyn Feeder>;

#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingFeeder {
    pub(crate) sent: std::sync::Mutex<Vec<(String, FeedCommand)>>,
    pub(crate) fail: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl RecordingFeeder {
    pub(crate) fn sent(&self) -> Vec<(String, FeedCommand)> {
        self.sent.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl Feeder for RecordingFeeder {
    async fn dispense(&self, pond_id: &str, cmd: &FeedCommand) -> anyhow::Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("feeder offline");
        }
        self.sent
            .lock()
            .unwrap()
            .push((pond_id.to_string(), cmd.clone()));
        Ok(())
    }
}
