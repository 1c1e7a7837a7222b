//! Time-of-day handling shared by the schedule, trigger and feed-log paths.
//!
//! Wire formats are zero-padded 24-hour `HH:MM` for schedule entries and log
//! times, and `YYYY-MM-DD` for log partitions. The 12-hour form is for display
//! only.

use std::sync::Arc;

use time::{OffsetDateTime, UtcOffset};

// ---------------------------------------------------------------------------
// HH:MM parsing
// ---------------------------------------------------------------------------

/// Parse `H:MM` or `HH:MM` (24-hour) into `(hour, minute)`.
pub fn parse_hhmm(s: &str) -> Option<(u8, u8)> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    if !h.bytes().all(|b| b.is_ascii_digit()) || !m.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u8 = h.parse().ok()?;
    let minute: u8 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Canonical zero-padded `HH:MM`, or `None` if `s` is not a time of day.
pub fn normalize_hhmm(s: &str) -> Option<String> {
    parse_hhmm(s).map(|(h, m)| format!("{h:02}:{m:02}"))
}

/// `"13:30"` -> `"1:30 PM"`. Input that is not a time of day comes back
/// unchanged.
pub fn format_time_12h(time_24h: &str) -> String {
    let Some((hour, minute)) = parse_hhmm(time_24h) else {
        return time_24h.to_string();
    };
    let period = if hour >= 12 { "PM" } else { "AM" };
    let hour = match hour % 12 {
        0 => 12,
        h => h,
    };
    format!("{hour}:{minute:02} {period}")
}

// ---------------------------------------------------------------------------
// Formatting from a clock reading
// ---------------------------------------------------------------------------

pub fn hhmm(dt: OffsetDateTime) -> String {
    format!("{:02}:{:02}", dt.hour(), dt.minute())
}

pub fn yyyy_mm_dd(dt: OffsetDateTime) -> String {
    format!("{:04}-{:02}-{:02}", dt.year(), dt.month() as u8, dt.day())
}

/// True for a well-formed `YYYY-MM-DD` string.
pub fn is_yyyy_mm_dd(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 10
        && b[4] == b'-'
        && b[7] == b'-'
        && b.iter()
            .enumerate()
            .all(|(i, c)| i == 4 || i == 7 || c.is_ascii_digit())
}

/// Parse `"+07:00"`, `"-05:30"`, `"Z"` or `"UTC"`.
pub fn parse_utc_offset(s: &str) -> Option<UtcOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return Some(UtcOffset::UTC);
    }
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1i8, &s[1..]),
        b'-' => (-1i8, &s[1..]),
        _ => return None,
    };
    let (h, m) = parse_hhmm(rest)?;
    if rest.len() != 5 {
        return None;
    }
    UtcOffset::from_hms(sign * h as i8, sign * m as i8, 0).ok()
}

// ---------------------------------------------------------------------------
// Minute resolution
// ---------------------------------------------------------------------------

/// A wall-clock reading floored to the minute (unix minutes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinuteStamp(i64);

impl MinuteStamp {
    pub fn of(dt: OffsetDateTime) -> Self {
        Self(dt.unix_timestamp().div_euclid(60))
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock shifted into the hub's configured offset.
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

#[cfg(test)]
pub(crate) struct ManualClock(std::sync::Mutex<OffsetDateTime>);

#[cfg(test)]
impl ManualClock {
    pub(crate) fn at(dt: OffsetDateTime) -> Self {
        Self(std::sync::Mutex::new(dt))
    }

    pub(crate) fn set(&self, dt: OffsetDateTime) {
        *self.0.lock().unwrap() = dt;
    }

    pub(crate) fn advance(&self, by: time::Duration) {
        let mut t = self.0.lock().unwrap();
        *t += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.0.lock().unwrap()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
