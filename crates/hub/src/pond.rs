//! Pond sessions: one per configured pond, owning the cached feeding state,
//! its store subscriptions and the auto-feed trigger task.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::FeedError;
use crate::feeder::{FeedCommand, SharedFeeder};
use crate::feedlog::{AppendOutcome, FeedLog, FeedLogEntry, FeedMethod, FeedStatus};
use crate::notify::{Notice, SharedNotifier};
use crate::schedule::{manual_feed_path, FeedingState, ScheduleAdapter};
use crate::store::{SharedStore, Subscription};
use crate::timefmt::{is_yyyy_mm_dd, yyyy_mm_dd, SharedClock};
use crate::trigger::{self, AutoFeedTrigger};

/// Dependencies shared by every pond session.
#[derive(Clone)]
pub struct PondServices {
    pub store: SharedStore,
    pub notifier: SharedNotifier,
    pub feeder: SharedFeeder,
    pub clock: SharedClock,
    pub respect_manual_mode: bool,
    pub poll_interval: Duration,
}

pub struct PondSession {
    pond_id: String,
    name: String,
    store: SharedStore,
    adapter: ScheduleAdapter,
    log: FeedLog,
    feeder: SharedFeeder,
    notifier: SharedNotifier,
    clock: SharedClock,
    state: watch::Receiver<FeedingState>,
    _subscriptions: [Subscription; 2],
    trigger: JoinHandle<()>,
}

impl PondSession {
    /// Load the pond's keys, start following the store and start the trigger.
    /// A failed initial load is already reported by the adapter; the session
    /// opens with whatever did load.
    pub async fn open(services: &PondServices, pond_id: &str, name: &str) -> Self {
        let adapter = ScheduleAdapter::new(services.store.clone(), services.notifier.clone());
        let log = FeedLog::new(services.store.clone());

        let initial = match adapter.load_initial(pond_id, &FeedingState::default()).await {
            Ok(state) => state,
            Err(e) => e.recovered,
        };

        let (tx, rx) = watch::channel(initial);
        let tx = Arc::new(tx);

        let (tx_s, tx_m) = (tx.clone(), tx.clone());
        let schedule_sub = adapter.subscribe(
            pond_id,
            move |schedule| tx_s.send_modify(|s| s.schedule = schedule),
            move |manual| tx_m.send_modify(|s| s.manual_mode = manual),
        );
        let (tx_k, tx_d) = (tx.clone(), tx);
        let config_sub = adapter.subscribe_config(
            pond_id,
            move |kg| tx_k.send_modify(|s| s.feed_kg = kg),
            move |d| tx_d.send_modify(|s| s.feeder_diameter = d),
        );

        let auto = AutoFeedTrigger::new(
            pond_id,
            services.respect_manual_mode,
            log.clone(),
            services.feeder.clone(),
            services.notifier.clone(),
        );
        let trigger = tokio::spawn(trigger::run(
            auto,
            services.clock.clone(),
            rx.clone(),
            services.poll_interval,
        ));

        info!(pond = %pond_id, name, "pond session opened");

        Self {
            pond_id: pond_id.to_string(),
            name: name.to_string(),
            store: services.store.clone(),
            adapter,
            log,
            feeder: services.feeder.clone(),
            notifier: services.notifier.clone(),
            clock: services.clock.clone(),
            state: rx,
            _subscriptions: [schedule_sub, config_sub],
            trigger,
        }
    }

    /// Stop the subscriptions and the trigger together.
    pub fn close(self) {
        info!(pond = %self.pond_id, "pond session closed");
    }

    pub fn pond_id(&self) -> &str {
        &self.pond_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Latest cached state. Follows the store, never local writes.
    pub fn state(&self) -> FeedingState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<FeedingState> {
        self.state.clone()
    }

    pub async fn set_schedule<S: AsRef<str>>(&self, times: &[S]) -> Result<Vec<String>, FeedError> {
        self.adapter.set_schedule(&self.pond_id, times).await
    }

    /// Edits start from the stored schedule, not the cached one.
    pub async fn add_time(&self, time: &str) -> Result<Option<Vec<String>>, FeedError> {
        let current = self.adapter.stored_schedule(&self.pond_id).await?;
        self.adapter.add_time(&self.pond_id, &current, time).await
    }

    pub async fn remove_time(&self, time: &str) -> Result<Option<Vec<String>>, FeedError> {
        let current = self.adapter.stored_schedule(&self.pond_id).await?;
        self.adapter.remove_time(&self.pond_id, &current, time).await
    }

    pub async fn set_mode(&self, manual: bool) -> Result<(), FeedError> {
        self.adapter.set_mode(&self.pond_id, manual).await
    }

    pub async fn set_config(&self, kg: f64, diameter_mm: u32) -> Result<(), FeedError> {
        self.adapter.set_config(&self.pond_id, kg, diameter_mm).await
    }

    /// Feed now with the current quantity, whatever the feeding mode.
    ///
    /// The `manual_feed` flag must persist before anything is dispatched.
    pub async fn feed_now(&self) -> Result<FeedLogEntry, FeedError> {
        let now = self.clock.now();
        let state = self.state();

        if let Err(e) = self
            .store
            .set(&manual_feed_path(&self.pond_id), json!(true))
            .await
        {
            warn!(pond = %self.pond_id, "manual feed flag write failed: {e}");
            self.notifier
                .notify(Notice::error(&self.pond_id, "Failed to trigger manual feed"))
                .await;
            return Err(FeedError::Persistence {
                what: "manual feed flag",
                source: e,
            });
        }

        let cmd = FeedCommand {
            ts: now.unix_timestamp(),
            kg: state.feed_kg,
            diameter_mm: state.feeder_diameter,
            method: FeedMethod::Manual,
        };
        let status = match self.feeder.dispense(&self.pond_id, &cmd).await {
            Ok(()) => FeedStatus::Success,
            Err(e) => {
                error!(pond = %self.pond_id, "manual feed dispatch failed: {e:#}");
                FeedStatus::Failed
            }
        };

        let entry = FeedLogEntry::new(now, state.feed_kg, FeedMethod::Manual, status);
        match self.log.append(&self.pond_id, &entry).await {
            Ok(AppendOutcome::Appended) => {}
            Ok(AppendOutcome::AlreadyLogged) => {
                info!(pond = %self.pond_id, time = %entry.time, "manual feed shares a minute with a logged feeding");
            }
            Err(e) => {
                warn!(pond = %self.pond_id, "manual feed log write failed: {e}");
                self.notifier
                    .notify(Notice::error(&self.pond_id, "Failed to record feeding"))
                    .await;
            }
        }

        if status == FeedStatus::Success {
            info!(pond = %self.pond_id, kg = state.feed_kg, "manual feed triggered");
            self.notifier
                .notify(Notice::success(
                    &self.pond_id,
                    format!("Manual feed triggered for {}", self.pond_id),
                ))
                .await;
        } else {
            self.notifier
                .notify(Notice::error(&self.pond_id, "Feeder did not accept the feed command"))
                .await;
        }

        Ok(entry)
    }

    /// Entries for `date`, or for today in the hub's clock when `None`.
    pub async fn logs(&self, date: Option<&str>) -> Result<(String, Vec<FeedLogEntry>), FeedError> {
        let date = match date {
            Some(d) if is_yyyy_mm_dd(d) => d.to_string(),
            Some(d) => {
                return Err(FeedError::Validation(format!("'{d}' is not a YYYY-MM-DD date")));
            }
            None => yyyy_mm_dd(self.clock.now()),
        };
        let entries = self.log.entries_for_day(&self.pond_id, &date).await?;
        Ok((date, entries))
    }

    pub async fn todays_logs(&self) -> Result<Vec<FeedLogEntry>, FeedError> {
        self.logs(None).await.map(|(_, entries)| entries)
    }

    /// Live view of one day's log.
    pub fn watch_logs<F>(&self, date: &str, on_change: F) -> Subscription
    where
        F: FnMut(Vec<FeedLogEntry>) + Send + 'static,
    {
        self.log.subscribe_day(&self.pond_id, date, on_change)
    }
}

impl Drop for PondSession {
    fn drop(&mut self) {
        self.trigger.abort();
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PondRegistry {
    ponds: BTreeMap<String, PondSession>,
}

impl PondRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: PondSession) {
        if let Some(old) = self.ponds.insert(session.pond_id.clone(), session) {
            old.close();
        }
    }

    pub fn get(&self, pond_id: &str) -> Result<&PondSession, FeedError> {
        self.ponds
            .get(pond_id)
            .ok_or_else(|| FeedError::UnknownPond(pond_id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.ponds.keys().cloned().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
