use headcount_core::{PipelineSettings, ShutdownMode, UnknownPolicy};
use std::path::PathBuf;
use std::time::Duration;

/// Which D-Bus bus the service registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
}

/// Daemon configuration, loaded from environment variables.
///
/// Recognition thresholds are not here: they live in the database's config
/// table so operators can change them and call `ReloadConfig`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// How long the recognition thread blocks on an empty queue.
    pub poll_interval: Duration,
    pub unknown_policy: UnknownPolicy,
    pub shutdown_mode: ShutdownMode,
    pub bus: BusKind,
}

impl Config {
    /// Load configuration from `HEADCOUNT_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("headcount");

        let db_path = get("HEADCOUNT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        Self {
            db_path,
            poll_interval: Duration::from_millis(parsed(&get, "HEADCOUNT_POLL_INTERVAL_MS", 250)),
            unknown_policy: parsed(&get, "HEADCOUNT_UNKNOWN_POLICY", UnknownPolicy::AlwaysNew),
            shutdown_mode: parsed(&get, "HEADCOUNT_SHUTDOWN_MODE", ShutdownMode::Discard),
            bus: match get("HEADCOUNT_BUS").as_deref() {
                Some("system") => BusKind::System,
                _ => BusKind::Session,
            },
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            poll_interval: self.poll_interval,
            unknown_policy: self.unknown_policy,
            shutdown_mode: self.shutdown_mode,
        }
    }
}

fn parsed<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match get(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable setting; using default");
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[("HOME", "/home/usher")]);
        assert_eq!(c.db_path, PathBuf::from("/home/usher/.local/share/headcount/attendance.db"));
        assert_eq!(c.poll_interval, Duration::from_millis(250));
        assert_eq!(c.unknown_policy, UnknownPolicy::AlwaysNew);
        assert_eq!(c.shutdown_mode, ShutdownMode::Discard);
        assert_eq!(c.bus, BusKind::Session);
    }

    #[test]
    fn test_overrides() {
        let c = config(&[
            ("XDG_DATA_HOME", "/var/lib"),
            ("HEADCOUNT_POLL_INTERVAL_MS", "1000"),
            ("HEADCOUNT_UNKNOWN_POLICY", "match-existing"),
            ("HEADCOUNT_SHUTDOWN_MODE", "drain"),
            ("HEADCOUNT_BUS", "system"),
        ]);
        assert_eq!(c.db_path, PathBuf::from("/var/lib/headcount/attendance.db"));
        assert_eq!(c.poll_interval, Duration::from_secs(1));
        assert_eq!(c.unknown_policy, UnknownPolicy::MatchExisting);
        assert_eq!(c.shutdown_mode, ShutdownMode::Drain);
        assert_eq!(c.bus, BusKind::System);
    }

    #[test]
    fn test_explicit_db_path_and_bad_values() {
        let c = config(&[
            ("HEADCOUNT_DB_PATH", "/srv/church.db"),
            ("HEADCOUNT_POLL_INTERVAL_MS", "soon"),
            ("HEADCOUNT_UNKNOWN_POLICY", "cluster"),
        ]);
        assert_eq!(c.db_path, PathBuf::from("/srv/church.db"));
        assert_eq!(c.poll_interval, Duration::from_millis(250));
        assert_eq!(c.unknown_policy, UnknownPolicy::AlwaysNew);
    }
}
