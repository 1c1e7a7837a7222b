//! TOML config file loading, validation, and store seeding for ponds.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use time::UtcOffset;

use crate::schedule::{
    diameter_path, feed_kg_path, mode_path, normalize_schedule, schedule_path,
    FEEDER_DIAMETERS_MM,
};
use crate::store::RealtimeStore;
use crate::timefmt::{normalize_hhmm, parse_utc_offset};
use crate::trigger::DEFAULT_POLL_INTERVAL_SEC;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub feeding: FeedingSettings,
    #[serde(default)]
    pub ponds: Vec<PondEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FeedingSettings {
    pub poll_interval_sec: u64,
    pub respect_manual_mode: bool,
    pub utc_offset: String,
}

impl Default for FeedingSettings {
    fn default() -> Self {
        Self {
            poll_interval_sec: DEFAULT_POLL_INTERVAL_SEC,
            respect_manual_mode: true,
            utc_offset: "+00:00".to_string(),
        }
    }
}

impl FeedingSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    /// Only valid after [`Config::validate`]; falls back to UTC otherwise.
    pub fn offset(&self) -> UtcOffset {
        parse_utc_offset(&self.utc_offset).unwrap_or(UtcOffset::UTC)
    }
}

/// Seed values for one pond. They are written only where the store holds
/// nothing yet.
#[derive(Debug, Deserialize)]
pub struct PondEntry {
    pub pond_id: String,
    pub name: String,
    #[serde(default = "default_feed_kg")]
    pub feed_kg: f64,
    #[serde(default = "default_feeder_diameter")]
    pub feeder_diameter: u32,
    #[serde(default)]
    pub schedule: Vec<String>,
    #[serde(default)]
    pub manual_mode: bool,
}

fn default_feed_kg() -> f64 {
    1.0
}

fn default_feeder_diameter() -> u32 {
    30
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A poll slower than this could step over a whole minute.
const MAX_POLL_INTERVAL_SEC: u64 = 59;

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_feeding(&mut errors);
        self.validate_ponds(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_feeding(&self, errors: &mut Vec<String>) {
        let f = &self.feeding;
        if !(1..=MAX_POLL_INTERVAL_SEC).contains(&f.poll_interval_sec) {
            errors.push(format!(
                "feeding: poll_interval_sec {} out of range [1, {MAX_POLL_INTERVAL_SEC}]",
                f.poll_interval_sec
            ));
        }
        if parse_utc_offset(&f.utc_offset).is_none() {
            errors.push(format!(
                "feeding: utc_offset '{}' is not of the form +HH:MM / -HH:MM / Z",
                f.utc_offset
            ));
        }
    }

    fn validate_ponds(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, p) in self.ponds.iter().enumerate() {
            let ctx = || {
                if p.pond_id.is_empty() {
                    format!("ponds[{i}]")
                } else {
                    format!("pond '{}'", p.pond_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if p.pond_id.trim().is_empty() {
                errors.push(format!("{}: pond_id is empty", ctx()));
            } else if p.pond_id.contains('/') || p.pond_id.trim() != p.pond_id {
                errors.push(format!(
                    "{}: pond_id must not contain '/' or surrounding whitespace",
                    ctx()
                ));
            } else if !seen_ids.insert(&p.pond_id) {
                errors.push(format!("{}: duplicate pond_id", ctx()));
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Feeder config ───────────────────────────────────
            if !p.feed_kg.is_finite() || p.feed_kg <= 0.0 {
                errors.push(format!(
                    "{}: feed_kg must be positive, got {}",
                    ctx(),
                    p.feed_kg
                ));
            }
            if !FEEDER_DIAMETERS_MM.contains(&p.feeder_diameter) {
                errors.push(format!(
                    "{}: feeder_diameter {} is not one of {FEEDER_DIAMETERS_MM:?}",
                    ctx(),
                    p.feeder_diameter
                ));
            }

            // ── Schedule ────────────────────────────────────────
            for t in &p.schedule {
                if normalize_hhmm(t).is_none() {
                    errors.push(format!(
                        "{}: schedule entry '{t}' is not a HH:MM time of day",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Seed each pond's keys that the store does not hold yet. Returns how many
/// keys were written.
pub async fn apply(config: &Config, store: &dyn RealtimeStore) -> Result<usize> {
    let mut seeded = 0;

    for p in &config.ponds {
        let schedule = normalize_schedule(&p.schedule)
            .with_context(|| format!("pond '{}': bad schedule", p.pond_id))?;
        let seeds: [(String, Value); 4] = [
            (schedule_path(&p.pond_id), json!(schedule)),
            (mode_path(&p.pond_id), json!(p.manual_mode)),
            (feed_kg_path(&p.pond_id), json!(p.feed_kg)),
            (diameter_path(&p.pond_id), json!(p.feeder_diameter)),
        ];

        for (path, value) in seeds {
            let existing = store
                .get(&path)
                .await
                .with_context(|| format!("failed to read '{path}'"))?;
            if existing.is_none() {
                store
                    .set(&path, value)
                    .await
                    .with_context(|| format!("failed to seed '{path}'"))?;
                seeded += 1;
            }
        }
    }

    tracing::info!(ponds = config.ponds.len(), seeded, "config applied");

    Ok(seeded)
}

// ===========================================================================
// Tests
// ===========================================================================
