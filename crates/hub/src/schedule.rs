//! Schedule Store Adapter: the single read/write path for a pond's feeding
//! schedule, feeding mode and feeder configuration.
//!
//! Every write is normalized or validated here before it reaches the store,
//! and every mutation yields exactly one success or error notice. Local state
//! is never updated from a write; it follows the store through
//! [`ScheduleAdapter::subscribe`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{FeedError, LoadError, StoreError};
use crate::notify::{Notice, SharedNotifier};
use crate::store::{watch_value, SharedStore, Subscription};
use crate::timefmt::normalize_hhmm;

/// Feeder apertures the hardware accepts, in millimetres.
pub const FEEDER_DIAMETERS_MM: [u32; 3] = [20, 30, 40];

// ---------------------------------------------------------------------------
// Store paths
// ---------------------------------------------------------------------------

pub fn schedule_path(pond_id: &str) -> String {
    format!("{pond_id}/feeding_schedule")
}

pub fn mode_path(pond_id: &str) -> String {
    format!("{pond_id}/feeding_mode")
}

pub fn feed_kg_path(pond_id: &str) -> String {
    format!("{pond_id}/feed_kg")
}

pub fn diameter_path(pond_id: &str) -> String {
    format!("{pond_id}/feeder_diameter")
}

pub fn manual_feed_path(pond_id: &str) -> String {
    format!("{pond_id}/manual_feed")
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Cached view of a pond's feeding keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedingState {
    pub schedule: Vec<String>,
    pub manual_mode: bool,
    pub feed_kg: f64,
    pub feeder_diameter: u32,
}

impl Default for FeedingState {
    fn default() -> Self {
        Self {
            schedule: Vec::new(),
            manual_mode: false,
            feed_kg: 1.0,
            feeder_diameter: 30,
        }
    }
}

/// Validate, deduplicate and sort schedule entries into canonical `HH:MM`.
pub fn normalize_schedule<S: AsRef<str>>(times: &[S]) -> Result<Vec<String>, FeedError> {
    let mut out = BTreeSet::new();
    for t in times {
        let t = t.as_ref();
        let canon = normalize_hhmm(t)
            .ok_or_else(|| FeedError::Validation(format!("'{t}' is not a HH:MM time of day")))?;
        out.insert(canon);
    }
    Ok(out.into_iter().collect())
}

/// Schedule as found in the store, which other writers may have left
/// unsorted or dirty. Entries that are not times are dropped.
fn schedule_from_store(value: Option<Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    let set: BTreeSet<String> = items
        .iter()
        .filter_map(Value::as_str)
        .filter_map(normalize_hhmm)
        .collect();
    set.into_iter().collect()
}

pub fn validate_config(kg: f64, diameter_mm: u32) -> Result<(), FeedError> {
    let mut errors = Vec::new();
    if !kg.is_finite() || kg <= 0.0 {
        errors.push(format!("feed quantity must be a positive number of kg, got {kg}"));
    }
    if !FEEDER_DIAMETERS_MM.contains(&diameter_mm) {
        errors.push(format!(
            "feeder diameter {diameter_mm} mm is not one of {FEEDER_DIAMETERS_MM:?}"
        ));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(FeedError::Validation(errors.join("; ")))
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ScheduleAdapter {
    store: SharedStore,
    notifier: SharedNotifier,
}

impl ScheduleAdapter {
    pub fn new(store: SharedStore, notifier: SharedNotifier) -> Self {
        Self { store, notifier }
    }

    /// Read all four keys concurrently. Missing keys keep `prior`; keys that
    /// fail to read or decode also keep `prior` and are reported together in
    /// one [`LoadError`].
    pub async fn load_initial(
        &self,
        pond_id: &str,
        prior: &FeedingState,
    ) -> Result<FeedingState, LoadError> {
        let (sched_path, mode_p, kg_path, dia_path) = (
            schedule_path(pond_id),
            mode_path(pond_id),
            feed_kg_path(pond_id),
            diameter_path(pond_id),
        );
        let (sched, mode, kg, dia) = tokio::join!(
            self.store.get(&sched_path),
            self.store.get(&mode_p),
            self.store.get(&kg_path),
            self.store.get(&dia_path),
        );

        let mut state = prior.clone();
        let mut failed = Vec::new();

        match sched {
            Ok(None) | Ok(Some(Value::Null)) => {}
            Ok(Some(v @ Value::Array(_))) => state.schedule = schedule_from_store(Some(v)),
            _ => failed.push("feeding_schedule"),
        }
        match decode::<bool>(mode) {
            Ok(Some(m)) => state.manual_mode = m,
            Ok(None) => {}
            Err(()) => failed.push("feeding_mode"),
        }
        match decode::<f64>(kg) {
            Ok(Some(v)) if v.is_finite() && v > 0.0 => state.feed_kg = v,
            Ok(None) => {}
            _ => failed.push("feed_kg"),
        }
        match decode::<u32>(dia) {
            Ok(Some(v)) if FEEDER_DIAMETERS_MM.contains(&v) => state.feeder_diameter = v,
            Ok(None) => {}
            _ => failed.push("feeder_diameter"),
        }

        if failed.is_empty() {
            info!(pond = %pond_id, times = state.schedule.len(), "feeding state loaded");
            return Ok(state);
        }

        let err = LoadError {
            pond_id: pond_id.to_string(),
            failed_keys: failed,
            recovered: state,
        };
        warn!(pond = %pond_id, "{err}");
        self.notifier
            .notify(Notice::error(pond_id, "Failed to load data"))
            .await;
        Err(err)
    }

    /// Live schedule and mode listeners. Both fire once with the current
    /// value and then on every change, including this adapter's own writes.
    pub fn subscribe<S, M>(&self, pond_id: &str, mut on_schedule: S, mut on_mode: M) -> Subscription
    where
        S: FnMut(Vec<String>) + Send + 'static,
        M: FnMut(bool) + Send + 'static,
    {
        let sched = watch_value(self.store.clone(), schedule_path(pond_id), move |v| {
            on_schedule(schedule_from_store(v))
        });
        let mode = watch_value(self.store.clone(), mode_path(pond_id), move |v| {
            if let Some(Value::Bool(m)) = v {
                on_mode(m);
            }
        });
        Subscription::from_tasks(vec![sched, mode])
    }

    /// Live feeder configuration listeners. Values that fail validation are
    /// ignored.
    pub fn subscribe_config<K, D>(&self, pond_id: &str, mut on_kg: K, mut on_diameter: D) -> Subscription
    where
        K: FnMut(f64) + Send + 'static,
        D: FnMut(u32) + Send + 'static,
    {
        let kg = watch_value(self.store.clone(), feed_kg_path(pond_id), move |v| {
            if let Some(kg) = v.as_ref().and_then(Value::as_f64) {
                if kg.is_finite() && kg > 0.0 {
                    on_kg(kg);
                }
            }
        });
        let dia = watch_value(self.store.clone(), diameter_path(pond_id), move |v| {
            if let Some(d) = v.as_ref().and_then(Value::as_u64) {
                if let Ok(d) = u32::try_from(d) {
                    if FEEDER_DIAMETERS_MM.contains(&d) {
                        on_diameter(d);
                    }
                }
            }
        });
        Subscription::from_tasks(vec![kg, dia])
    }

    /// Normalize and persist the whole schedule. Returns what was written.
    pub async fn set_schedule<S: AsRef<str>>(
        &self,
        pond_id: &str,
        times: &[S],
    ) -> Result<Vec<String>, FeedError> {
        let result: Result<Vec<String>, FeedError> = async {
            let normalized = normalize_schedule(times)?;
            self.store
                .set(&schedule_path(pond_id), json!(normalized))
                .await
                .map_err(FeedError::persistence("feeding schedule"))?;
            Ok(normalized)
        }
        .await;

        self.report(pond_id, result, "Schedule updated", "Failed to update schedule")
            .await
    }

    /// The schedule as stored right now, for read-modify-write edits. A
    /// subscriber's cached copy may not yet reflect another writer's change.
    pub async fn stored_schedule(&self, pond_id: &str) -> Result<Vec<String>, FeedError> {
        match self.store.get(&schedule_path(pond_id)).await {
            Ok(v) => Ok(schedule_from_store(v)),
            Err(e) => {
                let err = FeedError::read("feeding schedule")(e);
                self.report(pond_id, Err(err), "", "Failed to update schedule")
                    .await
            }
        }
    }

    /// Add one time to `current`. `Ok(None)` when it is already scheduled;
    /// nothing is written in that case.
    pub async fn add_time(
        &self,
        pond_id: &str,
        current: &[String],
        time: &str,
    ) -> Result<Option<Vec<String>>, FeedError> {
        let Some(canon) = normalize_hhmm(time) else {
            let err = FeedError::Validation(format!("'{time}' is not a HH:MM time of day"));
            return self
                .report(pond_id, Err(err), "", "Failed to update schedule")
                .await;
        };
        if current.contains(&canon) {
            return Ok(None);
        }
        let mut updated = current.to_vec();
        updated.push(canon);
        self.set_schedule(pond_id, &updated).await.map(Some)
    }

    /// Remove one time from `current`. `Ok(None)` when it was not scheduled.
    pub async fn remove_time(
        &self,
        pond_id: &str,
        current: &[String],
        time: &str,
    ) -> Result<Option<Vec<String>>, FeedError> {
        let target = normalize_hhmm(time).unwrap_or_else(|| time.to_string());
        if !current.contains(&target) {
            return Ok(None);
        }
        let updated: Vec<&String> = current.iter().filter(|t| **t != target).collect();
        self.set_schedule(pond_id, &updated).await.map(Some)
    }

    pub async fn set_mode(&self, pond_id: &str, manual: bool) -> Result<(), FeedError> {
        let result = self
            .store
            .set(&mode_path(pond_id), json!(manual))
            .await
            .map_err(FeedError::persistence("feeding mode"));

        let ok_msg = if manual {
            "Manual feeding mode enabled"
        } else {
            "Automatic feeding mode enabled"
        };
        self.report(pond_id, result, ok_msg, "Failed to update mode")
            .await
    }

    /// Validate then write quantity and aperture. Nothing is written when
    /// validation fails; the first failed write aborts the rest.
    pub async fn set_config(
        &self,
        pond_id: &str,
        kg: f64,
        diameter_mm: u32,
    ) -> Result<(), FeedError> {
        let result: Result<(), FeedError> = async {
            validate_config(kg, diameter_mm)?;
            self.store
                .set(&feed_kg_path(pond_id), json!(kg))
                .await
                .map_err(FeedError::persistence("feed quantity"))?;
            self.store
                .set(&diameter_path(pond_id), json!(diameter_mm))
                .await
                .map_err(FeedError::persistence("feeder diameter"))?;
            Ok(())
        }
        .await;

        self.report(
            pond_id,
            result,
            "Feeding configuration saved",
            "Failed to update config",
        )
        .await
    }

    /// Turn an operation result into exactly one notice.
    async fn report<T>(
        &self,
        pond_id: &str,
        result: Result<T, FeedError>,
        ok_msg: &str,
        fail_msg: &str,
    ) -> Result<T, FeedError> {
        match &result {
            Ok(_) => {
                info!(pond = %pond_id, "{ok_msg}");
                self.notifier.notify(Notice::success(pond_id, ok_msg)).await;
            }
            Err(FeedError::Validation(detail)) => {
                warn!(pond = %pond_id, "rejected: {detail}");
                self.notifier.notify(Notice::error(pond_id, detail.clone())).await;
            }
            Err(e) => {
                warn!(pond = %pond_id, "{fail_msg}: {e}");
                self.notifier.notify(Notice::error(pond_id, fail_msg)).await;
            }
        }
        result
    }
}

/// `Err(())` for a failed read or a value of the wrong shape.
fn decode<T: serde::de::DeserializeOwned>(
    read: Result<Option<Value>, StoreError>,
) -> Result<Option<T>, ()> {
    match read {
        Ok(None) | Ok(Some(Value::Null)) => Ok(None),
        Ok(Some(v)) => serde_json::from_value(v).map(Some).map_err(|_| ()),
        Err(_) => Err(()),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
