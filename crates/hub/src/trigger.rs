//! Auto-feed trigger: fires a pond's scheduled feedings from a polling tick.
//!
//! ## Per-pond state machine
//!
//! ```text
//! Idle ──[tick]──▶ Check ──[minute != last_fired && HH:MM scheduled]──▶ Fire
//!  ▲                 │                                                   │
//!  └──[no match]─────┘                                                   │
//!  └──────────────────────[record last_fired]────────────────────────────┘
//! ```
//!
//! At most one fire per wall-clock minute however many ticks land in it. A
//! minute that is never polled is never fired later.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::feeder::{FeedCommand, SharedFeeder};
use crate::feedlog::{AppendOutcome, FeedLog, FeedLogEntry, FeedMethod, FeedStatus};
use crate::notify::{Notice, SharedNotifier};
use crate::schedule::FeedingState;
use crate::timefmt::{hhmm, MinuteStamp, SharedClock};

/// Default polling cadence.
pub const DEFAULT_POLL_INTERVAL_SEC: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Current minute is not scheduled.
    NoMatch,
    /// This minute already fired (or was suppressed).
    AlreadyHandled,
    /// Scheduled, but the pond is in manual mode.
    Suppressed,
    Fired(FeedLogEntry),
}

pub struct AutoFeedTrigger {
    pond_id: String,
    respect_manual_mode: bool,
    last_fired: Option<MinuteStamp>,
    log: FeedLog,
    feeder: SharedFeeder,
    notifier: SharedNotifier,
}

impl AutoFeedTrigger {
    pub fn new(
        pond_id: &str,
        respect_manual_mode: bool,
        log: FeedLog,
        feeder: SharedFeeder,
        notifier: SharedNotifier,
    ) -> Self {
        Self {
            pond_id: pond_id.to_string(),
            respect_manual_mode,
            last_fired: None,
            log,
            feeder,
            notifier,
        }
    }

    /// Evaluate one poll tick against the latest cached state.
    pub async fn tick(&mut self, now: OffsetDateTime, state: &FeedingState) -> TickOutcome {
        let minute = MinuteStamp::of(now);
        if self.last_fired == Some(minute) {
            return TickOutcome::AlreadyHandled;
        }

        let time_now = hhmm(now);
        if !state.schedule.iter().any(|t| *t == time_now) {
            return TickOutcome::NoMatch;
        }

        // Marked before any I/O: a failed fire is not retried this minute.
        self.last_fired = Some(minute);

        if self.respect_manual_mode && state.manual_mode {
            info!(pond = %self.pond_id, time = %time_now, "trigger: manual mode, scheduled feeding skipped");
            self.notifier
                .notify(Notice::info(
                    &self.pond_id,
                    format!("Scheduled feeding at {time_now} skipped (manual mode)"),
                ))
                .await;
            return TickOutcome::Suppressed;
        }

        TickOutcome::Fired(self.fire(now, state).await)
    }

    async fn fire(&self, now: OffsetDateTime, state: &FeedingState) -> FeedLogEntry {
        let cmd = FeedCommand {
            ts: now.unix_timestamp(),
            kg: state.feed_kg,
            diameter_mm: state.feeder_diameter,
            method: FeedMethod::Auto,
        };

        let status = match self.feeder.dispense(&self.pond_id, &cmd).await {
            Ok(()) => FeedStatus::Success,
            Err(e) => {
                error!(pond = %self.pond_id, "trigger: feed dispatch failed: {e:#}");
                self.notifier
                    .notify(Notice::error(&self.pond_id, "Feeder did not accept the feed command"))
                    .await;
                FeedStatus::Failed
            }
        };

        let entry = FeedLogEntry::new(now, state.feed_kg, FeedMethod::Auto, status);
        match self.log.append(&self.pond_id, &entry).await {
            Ok(AppendOutcome::Appended) => {}
            Ok(AppendOutcome::AlreadyLogged) => {
                debug!(pond = %self.pond_id, time = %entry.time, "trigger: minute already logged by another writer");
            }
            Err(e) => {
                warn!(pond = %self.pond_id, "trigger: feed log write failed: {e}");
                self.notifier
                    .notify(Notice::error(&self.pond_id, "Failed to record feeding"))
                    .await;
            }
        }

        info!(
            pond = %self.pond_id,
            time = %entry.time,
            kg = state.feed_kg,
            diameter_mm = state.feeder_diameter,
            "trigger: auto feeding fired"
        );
        self.notifier
            .notify(Notice::success(
                &self.pond_id,
                format!("Auto feeding initiated for {}", self.pond_id),
            ))
            .await;

        entry
    }
}

/// Poll forever at `interval`. Intended to be `tokio::spawn`-ed by the pond
/// session, which aborts it on close.
pub async fn run(
    mut trigger: AutoFeedTrigger,
    clock: SharedClock,
    state: watch::Receiver<FeedingState>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        pond = %trigger.pond_id,
        tick_sec = interval.as_secs_f64(),
        respect_manual_mode = trigger.respect_manual_mode,
        "trigger started"
    );

    loop {
        ticker.tick().await;
        let snapshot = state.borrow().clone();
        trigger.tick(clock.now(), &snapshot).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeder::RecordingFeeder;
    use crate::notify::{NoticeLevel, RecordingNotifier};
    use crate::store::MemoryStore;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use time::macros::datetime;

    struct Fixture {
        store: Arc<MemoryStore>,
        feeder: Arc<RecordingFeeder>,
        notes: Arc<RecordingNotifier>,
        log: FeedLog,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        Fixture {
            log: FeedLog::new(store.clone()),
            store,
            feeder: Arc::new(RecordingFeeder::default()),
            notes: Arc::new(RecordingNotifier::default()),
        }
    }

    fn trigger(f: &Fixture, respect_manual_mode: bool) -> AutoFeedTrigger {
        AutoFeedTrigger::new(
            "pond-a",
            respect_manual_mode,
            f.log.clone(),
            f.feeder.clone(),
            f.notes.clone(),
        )
    }

    fn scheduled(times: &[&str]) -> FeedingState {
        FeedingState {
            schedule: times.iter().map(|t| t.to_string()).collect(),
            ..FeedingState::default()
        }
    }

    async fn auto_entries(f: &Fixture, date: &str) -> Vec<FeedLogEntry> {
        f.log
            .entries_for_day("pond-a", date)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.method == FeedMethod::Auto)
            .collect()
    }

    // -- Once per minute ----------------------------------------------------

    #[tokio::test]
    async fn three_ticks_in_matching_minute_fire_once() {
        let f = fixture();
        let mut t = trigger(&f, true);
        let state = scheduled(&["08:00"]);

        let first = t.tick(datetime!(2026-10-14 08:00:05 UTC), &state).await;
        let second = t.tick(datetime!(2026-10-14 08:00:15 UTC), &state).await;
        let third = t.tick(datetime!(2026-10-14 08:00:25 UTC), &state).await;

        assert!(matches!(first, TickOutcome::Fired(_)));
        assert_eq!(second, TickOutcome::AlreadyHandled);
        assert_eq!(third, TickOutcome::AlreadyHandled);
        assert_eq!(auto_entries(&f, "2026-10-14").await.len(), 1);
        assert_eq!(f.feeder.sent().len(), 1);
        assert_eq!(f.notes.count(NoticeLevel::Success), 1);
    }

    #[tokio::test]
    async fn same_minute_of_hour_in_next_hour_fires_again() {
        let f = fixture();
        let mut t = trigger(&f, true);
        let state = scheduled(&["08:05", "09:05"]);

        assert!(matches!(
            t.tick(datetime!(2026-10-14 08:05:00 UTC), &state).await,
            TickOutcome::Fired(_)
        ));
        assert!(matches!(
            t.tick(datetime!(2026-10-14 09:05:00 UTC), &state).await,
            TickOutcome::Fired(_)
        ));
        assert_eq!(auto_entries(&f, "2026-10-14").await.len(), 2);
    }

    #[tokio::test]
    async fn same_time_next_day_fires_again() {
        let f = fixture();
        let mut t = trigger(&f, true);
        let state = scheduled(&["08:00"]);

        t.tick(datetime!(2026-10-14 08:00:00 UTC), &state).await;
        t.tick(datetime!(2026-10-15 08:00:00 UTC), &state).await;
        assert_eq!(auto_entries(&f, "2026-10-14").await.len(), 1);
        assert_eq!(auto_entries(&f, "2026-10-15").await.len(), 1);
    }

    // -- No backfill --------------------------------------------------------

    #[tokio::test]
    async fn unpolled_minute_is_never_backfilled() {
        let f = fixture();
        let mut t = trigger(&f, true);
        let state = scheduled(&["08:00"]);

        assert_eq!(
            t.tick(datetime!(2026-10-14 07:59:55 UTC), &state).await,
            TickOutcome::NoMatch
        );
        assert_eq!(
            t.tick(datetime!(2026-10-14 08:01:05 UTC), &state).await,
            TickOutcome::NoMatch
        );
        assert_eq!(
            t.tick(datetime!(2026-10-14 12:00:00 UTC), &state).await,
            TickOutcome::NoMatch
        );
        assert!(auto_entries(&f, "2026-10-14").await.is_empty());
        assert!(f.notes.all().is_empty());
    }

    #[tokio::test]
    async fn empty_schedule_never_fires() {
        let f = fixture();
        let mut t = trigger(&f, true);
        let state = FeedingState::default();
        assert_eq!(
            t.tick(datetime!(2026-10-14 00:00:00 UTC), &state).await,
            TickOutcome::NoMatch
        );
    }

    // -- Entry contents -----------------------------------------------------

    #[tokio::test]
    async fn fired_entry_carries_current_quantity() {
        let f = fixture();
        let mut t = trigger(&f, true);
        let state = FeedingState {
            feed_kg: 2.5,
            feeder_diameter: 40,
            ..scheduled(&["17:30"])
        };

        let TickOutcome::Fired(entry) = t.tick(datetime!(2026-10-14 17:30:30 UTC), &state).await
        else {
            panic!("expected fire");
        };
        assert_eq!(entry.quantity, 2.5);
        assert_eq!(entry.method, FeedMethod::Auto);
        assert_eq!(entry.status, FeedStatus::Success);
        assert_eq!(entry.date, "2026-10-14");
        assert_eq!(entry.time, "17:30");

        let (pond, cmd) = &f.feeder.sent()[0];
        assert_eq!(pond, "pond-a");
        assert_eq!(cmd.diameter_mm, 40);
        assert_eq!(cmd.kg, 2.5);
    }

    // -- Manual-mode gating -------------------------------------------------

    #[tokio::test]
    async fn manual_mode_suppresses_when_gated() {
        let f = fixture();
        let mut t = trigger(&f, true);
        let state = FeedingState {
            manual_mode: true,
            ..scheduled(&["08:00"])
        };

        assert_eq!(
            t.tick(datetime!(2026-10-14 08:00:00 UTC), &state).await,
            TickOutcome::Suppressed
        );
        assert!(f.feeder.sent().is_empty());
        assert!(auto_entries(&f, "2026-10-14").await.is_empty());
        assert_eq!(f.notes.count(NoticeLevel::Info), 1);
    }

    #[tokio::test]
    async fn switching_to_auto_mid_minute_does_not_fire_late() {
        let f = fixture();
        let mut t = trigger(&f, true);
        let manual = FeedingState {
            manual_mode: true,
            ..scheduled(&["08:00"])
        };
        let auto = scheduled(&["08:00"]);

        t.tick(datetime!(2026-10-14 08:00:00 UTC), &manual).await;
        assert_eq!(
            t.tick(datetime!(2026-10-14 08:00:20 UTC), &auto).await,
            TickOutcome::AlreadyHandled
        );
    }

    #[tokio::test]
    async fn manual_mode_fires_when_gating_disabled() {
        let f = fixture();
        let mut t = trigger(&f, false);
        let state = FeedingState {
            manual_mode: true,
            ..scheduled(&["08:00"])
        };
        assert!(matches!(
            t.tick(datetime!(2026-10-14 08:00:00 UTC), &state).await,
            TickOutcome::Fired(_)
        ));
    }

    // -- Failure semantics --------------------------------------------------

    #[tokio::test]
    async fn log_failure_still_notifies_and_does_not_retry() {
        let f = fixture();
        f.store.fail_writes(true);
        let mut t = trigger(&f, true);
        let state = scheduled(&["08:00"]);

        let out = t.tick(datetime!(2026-10-14 08:00:00 UTC), &state).await;
        assert!(matches!(out, TickOutcome::Fired(_)));
        assert_eq!(f.notes.count(NoticeLevel::Success), 1);
        assert_eq!(f.notes.count(NoticeLevel::Error), 1);

        f.store.fail_writes(false);
        assert_eq!(
            t.tick(datetime!(2026-10-14 08:00:30 UTC), &state).await,
            TickOutcome::AlreadyHandled
        );
        assert!(auto_entries(&f, "2026-10-14").await.is_empty());
        assert_eq!(f.feeder.sent().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_failure_is_logged_as_failed() {
        let f = fixture();
        f.feeder.fail.store(true, Ordering::SeqCst);
        let mut t = trigger(&f, true);

        let TickOutcome::Fired(entry) = t
            .tick(datetime!(2026-10-14 08:00:00 UTC), &scheduled(&["08:00"]))
            .await
        else {
            panic!("expected fire");
        };
        assert_eq!(entry.status, FeedStatus::Failed);
        let logged = auto_entries(&f, "2026-10-14").await;
        assert_eq!(logged[0].status, FeedStatus::Failed);
    }

    #[tokio::test]
    async fn second_trigger_same_minute_collapses_in_log() {
        let f = fixture();
        let mut a = trigger(&f, true);
        let mut b = trigger(&f, true);
        let state = scheduled(&["08:00"]);

        a.tick(datetime!(2026-10-14 08:00:01 UTC), &state).await;
        b.tick(datetime!(2026-10-14 08:00:07 UTC), &state).await;
        assert_eq!(auto_entries(&f, "2026-10-14").await.len(), 1);
    }

    // -- Loop ---------------------------------------------------------------

    #[tokio::test]
    async fn run_loop_fires_from_watched_state() {
        use crate::timefmt::ManualClock;

        let f = fixture();
        let clock = Arc::new(ManualClock::at(datetime!(2026-10-14 07:59:50 UTC)));
        let (tx, rx) = watch::channel(scheduled(&["08:00"]));
        let task = tokio::spawn(run(
            trigger(&f, true),
            clock.clone(),
            rx,
            Duration::from_millis(10),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(auto_entries(&f, "2026-10-14").await.is_empty());

        clock.advance(time::Duration::seconds(15));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(auto_entries(&f, "2026-10-14").await.len(), 1);

        // Schedule change picked up without restarting the loop.
        tx.send_replace(scheduled(&["08:01"]));
        clock.set(datetime!(2026-10-14 08:01:02 UTC));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(auto_entries(&f, "2026-10-14").await.len(), 2);

        task.abort();
    }
}
