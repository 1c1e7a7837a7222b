use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::notify::{Notice, NoticeLevel, Notifier};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub feeders: HashMap<String, FeederState>,
    pub events: VecDeque<SystemEvent>,
}

/// Last run report from a pond's feeder node.
#[derive(Clone, Serialize)]
pub struct FeederState {
    #[serde(with = "time::serde::rfc3339")]
    pub reported_at: OffsetDateTime,
    pub kg: f64,
    pub ok: bool,
    pub detail: String,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pond_id: Option<String>,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Success,
    Error,
    Info,
    Feeder,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub ponds: Vec<String>,
    pub feeders: HashMap<String, FeederState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            feeders: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a user-facing notice.
    pub fn record_notice(&mut self, notice: &Notice) {
        let kind = match notice.level {
            NoticeLevel::Success => EventKind::Success,
            NoticeLevel::Error => EventKind::Error,
            NoticeLevel::Info => EventKind::Info,
        };
        self.push_event(kind, Some(notice.pond_id.clone()), notice.message.clone());
    }

    /// Record a run report from a feeder node.
    pub fn record_feeder(&mut self, pond_id: &str, kg: f64, ok: bool, detail: String) {
        let summary = format!(
            "{pond_id}: feeder {} {kg} kg{}",
            if ok { "dispensed" } else { "FAILED" },
            if detail.is_empty() {
                String::new()
            } else {
                format!(" ({detail})")
            }
        );
        self.feeders.insert(
            pond_id.to_string(),
            FeederState {
                reported_at: OffsetDateTime::now_utc(),
                kg,
                ok,
                detail,
            },
        );
        self.push_event(EventKind::Feeder, Some(pond_id.to_string()), summary);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, None, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, None, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(&self, ponds: Vec<String>) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            ponds,
            feeders: self.feeders.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, pond_id: Option<String>, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            pond_id,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Production notification surface: log the notice and keep it in the event
/// ring buffer for `/api/status`.
pub struct StateNotifier {
    shared: SharedState,
}

impl StateNotifier {
    pub fn new(shared: SharedState) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl Notifier for StateNotifier {
    async fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Error => error!(pond = %notice.pond_id, "notice: {}", notice.message),
            _ => info!(pond = %notice.pond_id, level = ?notice.level, "notice: {}", notice.message),
        }
        self.shared.write().await.record_notice(&notice);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
