//! Feed-Log Writer: append-only feeding records partitioned by pond and day
//! at `feed_logs/{pond}/{YYYY-MM-DD}/{HH:MM}`.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::store::{watch_children, SharedStore, Subscription};
use crate::timefmt::{hhmm, yyyy_mm_dd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedMethod {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedLogEntry {
    /// Older records carry no date; it is filled from the partition key.
    #[serde(default)]
    pub date: String,
    pub time: String,
    #[serde(deserialize_with = "quantity_from_number_or_text")]
    pub quantity: f64,
    pub method: FeedMethod,
    pub status: FeedStatus,
}

impl FeedLogEntry {
    pub fn new(at: OffsetDateTime, quantity: f64, method: FeedMethod, status: FeedStatus) -> Self {
        Self {
            date: yyyy_mm_dd(at),
            time: hhmm(at),
            quantity,
            method,
            status,
        }
    }
}

/// Quantities were historically written as text (`"1.0"`).
fn quantity_from_number_or_text<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Quantity {
        Number(f64),
        Text(String),
    }
    match Quantity::deserialize(d)? {
        Quantity::Number(n) => Ok(n),
        Quantity::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

pub fn day_path(pond_id: &str, date: &str) -> String {
    format!("feed_logs/{pond_id}/{date}")
}

pub fn entry_path(pond_id: &str, date: &str, time: &str) -> String {
    format!("feed_logs/{pond_id}/{date}/{time}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    Appended,
    /// An entry already exists for that minute and was left untouched.
    AlreadyLogged,
}

#[derive(Clone)]
pub struct FeedLog {
    store: SharedStore,
}

impl FeedLog {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Write `entry` unless its minute is already taken. Entries are never
    /// overwritten.
    pub async fn append(&self, pond_id: &str, entry: &FeedLogEntry) -> Result<AppendOutcome, FeedError> {
        let path = entry_path(pond_id, &entry.date, &entry.time);

        let existing = self
            .store
            .get(&path)
            .await
            .map_err(FeedError::persistence("feed log entry"))?;
        if existing.is_some() {
            debug!(pond = %pond_id, path = %path, "feed log minute already taken");
            return Ok(AppendOutcome::AlreadyLogged);
        }

        let value = serde_json::to_value(entry)
            .map_err(|e| FeedError::Validation(format!("unserializable log entry: {e}")))?;
        self.store
            .set(&path, value)
            .await
            .map_err(FeedError::persistence("feed log entry"))?;
        Ok(AppendOutcome::Appended)
    }

    /// One day's entries, ascending by time.
    pub async fn entries_for_day(&self, pond_id: &str, date: &str) -> Result<Vec<FeedLogEntry>, FeedError> {
        let children = self
            .store
            .children(&day_path(pond_id, date))
            .await
            .map_err(FeedError::read("feed log"))?;
        Ok(sorted_entries(date, children))
    }

    /// Sorted view of one day, delivered now and on every change to it.
    pub fn subscribe_day<F>(&self, pond_id: &str, date: &str, mut on_change: F) -> Subscription
    where
        F: FnMut(Vec<FeedLogEntry>) + Send + 'static,
    {
        let day = date.to_string();
        let task = watch_children(self.store.clone(), day_path(pond_id, date), move |children| {
            on_change(sorted_entries(&day, children))
        });
        Subscription::from_tasks(vec![task])
    }
}

fn sorted_entries(date: &str, children: Vec<(String, Value)>) -> Vec<FeedLogEntry> {
    let mut entries: Vec<FeedLogEntry> = children
        .into_iter()
        .filter_map(|(key, v)| match serde_json::from_value::<FeedLogEntry>(v) {
            Ok(mut e) => {
                if e.date.is_empty() {
                    e.date = date.to_string();
                }
                Some(e)
            }
            Err(err) => {
                warn!(date, key = %key, "skipping unreadable feed log entry: {err}");
                None
            }
        })
        .collect();
    entries.sort_by(|a, b| a.time.cmp(&b.time));
    entries
}

// ===========================================================================
// Tests
// ===========================================================================
