use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

const DEFAULT_ARRIVAL_POLL_SECS: u64 = 15;
const DEFAULT_VEHICLE_POLL_SECS: u64 = 5;
const DEFAULT_THREE_MINUTE_LEAD_SECS: u64 = 180;
const DEFAULT_MIN_FIRE_DELAY_SECS: u64 = 1;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PROGRESS_TICK_MS: u64 = 1000;

const MAX_SECS: u64 = 86_400;
const MAX_PROGRESS_TICK_MS: u64 = 60_000;

/// Tunables for one tracking engine. Every session created by a manager
/// shares the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub arrival_poll_interval_secs: u64,
    pub vehicle_poll_interval_secs: u64,
    pub three_minute_lead_seconds: u64,
    pub minimum_fire_delay_seconds: u64,
    pub fetch_timeout_secs: u64,
    pub progress_tick_millis: u64,
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            arrival_poll_interval_secs: DEFAULT_ARRIVAL_POLL_SECS,
            vehicle_poll_interval_secs: DEFAULT_VEHICLE_POLL_SECS,
            three_minute_lead_seconds: DEFAULT_THREE_MINUTE_LEAD_SECS,
            minimum_fire_delay_seconds: DEFAULT_MIN_FIRE_DELAY_SECS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            progress_tick_millis: DEFAULT_PROGRESS_TICK_MS,
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Reads the JSON config at `path` (if any) and applies `TRILIVE_*`
    /// environment overrides on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config.normalized())
    }

    /// A missing file yields defaults; a file that fails to parse is logged and
    /// ignored rather than refusing to track.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read engine config from {}", path.display()))?;

        Ok(serde_json::from_str(&contents).unwrap_or_else(|err| {
            warn!("Ignoring malformed engine config {}: {err}", path.display());
            Self::default()
        }))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path, serialized)
            .with_context(|| format!("Failed to write engine config to {}", path.display()))
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read_u64 = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring {key}={raw:?}: not a whole number");
                    None
                }
            }
        };

        if let Some(value) = read_u64("TRILIVE_ARRIVAL_POLL_SECS") {
            self.arrival_poll_interval_secs = value;
        }
        if let Some(value) = read_u64("TRILIVE_VEHICLE_POLL_SECS") {
            self.vehicle_poll_interval_secs = value;
        }
        if let Some(value) = read_u64("TRILIVE_THREE_MINUTE_LEAD_SECS") {
            self.three_minute_lead_seconds = value;
        }
        if let Some(value) = read_u64("TRILIVE_MIN_FIRE_DELAY_SECS") {
            self.minimum_fire_delay_seconds = value;
        }
        if let Some(value) = read_u64("TRILIVE_FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = value;
        }
        if let Some(value) = lookup("TRILIVE_DEBUG") {
            self.debug = value == "1" || value.eq_ignore_ascii_case("true");
        }
    }

    /// Zero intervals would spin the tickers and huge ones overflow time
    /// arithmetic; clamp everything to at most a day.
    pub fn normalized(mut self) -> Self {
        self.arrival_poll_interval_secs = self.arrival_poll_interval_secs.clamp(1, MAX_SECS);
        self.vehicle_poll_interval_secs = self.vehicle_poll_interval_secs.clamp(1, MAX_SECS);
        self.fetch_timeout_secs = self.fetch_timeout_secs.clamp(1, MAX_SECS);
        self.three_minute_lead_seconds = self.three_minute_lead_seconds.min(MAX_SECS);
        self.minimum_fire_delay_seconds = self.minimum_fire_delay_seconds.clamp(1, MAX_SECS);
        self.progress_tick_millis = self.progress_tick_millis.clamp(10, MAX_PROGRESS_TICK_MS);
        self
    }

    pub fn arrival_poll_interval(&self) -> Duration {
        Duration::from_secs(self.arrival_poll_interval_secs)
    }

    pub fn vehicle_poll_interval(&self) -> Duration {
        Duration::from_secs(self.vehicle_poll_interval_secs)
    }

    pub fn three_minute_lead(&self) -> chrono::TimeDelta {
        bounded_seconds(self.three_minute_lead_seconds)
    }

    pub fn minimum_fire_delay(&self) -> chrono::TimeDelta {
        bounded_seconds(self.minimum_fire_delay_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_millis)
    }
}

fn bounded_seconds(secs: u64) -> chrono::TimeDelta {
    let bounded = i64::try_from(secs.min(MAX_SECS)).unwrap_or(i64::MAX);
    chrono::TimeDelta::seconds(bounded)
}
