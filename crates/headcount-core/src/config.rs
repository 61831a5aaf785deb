//! Recognition settings held in the store's key/value table.

use crate::store::{AttendanceStore, StoreError};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub const MATCH_THRESHOLD_KEY: &str = "match_threshold";
pub const DEDUP_INTERVAL_KEY: &str = "dedup_interval_secs";

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;
pub const DEFAULT_DEDUP_INTERVAL_SECS: f64 = 5.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("match threshold must be in (0, 1], got {0}")]
    ThresholdOutOfRange(f32),
    #[error("dedup interval must be a non-negative number of seconds that fits a duration, got {0}")]
    InvalidInterval(f64),
    #[error("config key {key} has unparsable value {value:?}")]
    Malformed { key: &'static str, value: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validated thresholds shared by the matcher and the dedup limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RecognitionConfig {
    pub match_threshold: f32,
    #[serde(serialize_with = "serialize_secs")]
    pub dedup_interval: Duration,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            dedup_interval: Duration::from_secs_f64(DEFAULT_DEDUP_INTERVAL_SECS),
        }
    }
}

impl RecognitionConfig {
    pub fn new(match_threshold: f32, dedup_interval_secs: f64) -> Result<Self, ConfigError> {
        if !(match_threshold > 0.0 && match_threshold <= 1.0) {
            return Err(ConfigError::ThresholdOutOfRange(match_threshold));
        }
        let dedup_interval = Duration::try_from_secs_f64(dedup_interval_secs)
            .map_err(|_| ConfigError::InvalidInterval(dedup_interval_secs))?;
        Ok(Self {
            match_threshold,
            dedup_interval,
        })
    }

    /// Read both keys from the store. Missing keys fall back to defaults.
    pub fn load(store: &dyn AttendanceStore) -> Result<Self, ConfigError> {
        let threshold = match store.get_config(MATCH_THRESHOLD_KEY)? {
            Some(raw) => parse(MATCH_THRESHOLD_KEY, &raw)?,
            None => DEFAULT_MATCH_THRESHOLD,
        };
        let interval = match store.get_config(DEDUP_INTERVAL_KEY)? {
            Some(raw) => parse(DEDUP_INTERVAL_KEY, &raw)?,
            None => DEFAULT_DEDUP_INTERVAL_SECS,
        };
        Self::new(threshold, interval)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::Malformed {
        key,
        value: raw.to_string(),
    })
}
