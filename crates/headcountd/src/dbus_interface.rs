use crate::store::SqliteStore;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use headcount_core::enroll::{enroll_identity, EnrollError};
use headcount_core::{
    AttendanceStore, FeatureExtractor, Pipeline, PipelineError, Point2, Profile,
    RecognitionConfig, StoreError, SubjectId,
};
use std::sync::Arc;
use zbus::interface;

/// Largest `limit` accepted by `RecentAttendance`.
const MAX_ATTENDANCE_ROWS: u32 = 1000;

/// D-Bus interface for the Headcount attendance daemon.
///
/// Bus name: org.freedesktop.Headcount1
/// Object path: /org/freedesktop/Headcount1
///
/// Structured payloads travel as JSON strings.
pub struct HeadcountService {
    pipeline: Arc<Pipeline>,
    store: Arc<SqliteStore>,
    extractor: FeatureExtractor,
}

impl HeadcountService {
    pub fn new(pipeline: Arc<Pipeline>, store: Arc<SqliteStore>) -> Self {
        Self {
            pipeline,
            store,
            extractor: FeatureExtractor::default(),
        }
    }
}

#[interface(name = "org.freedesktop.Headcount1")]
impl HeadcountService {
    /// Submit the landmark sets of one frame. Returns per-face extraction
    /// results; attribution happens asynchronously.
    async fn process_detections(&self, detections: &str) -> zbus::fdo::Result<String> {
        let point_sets = parse_point_sets(detections)?;
        let metadata = self.pipeline.process_detections(&point_sets);
        tracing::debug!(faces = point_sets.len(), "detections submitted");
        to_json(&metadata)
    }

    /// Rebuild the identity gallery from the database. Returns the new
    /// generation number.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u64> {
        let pipeline = Arc::clone(&self.pipeline);
        let report = blocking(move || pipeline.reload_gallery()).await?.map_err(failed)?;
        tracing::info!(generation = report.generation, loaded = report.loaded, "gallery reload requested");
        Ok(report.generation)
    }

    /// Re-read thresholds from the config table.
    async fn reload_config(&self) -> zbus::fdo::Result<String> {
        let pipeline = Arc::clone(&self.pipeline);
        let config = blocking(move || pipeline.reload_config()).await?.map_err(failed)?;
        to_json(&config)
    }

    /// Enroll a person from several landmark sets. Returns the new identity
    /// id; the gallery is reloaded before replying.
    async fn enroll(&self, name: &str, profile: &str, samples: &str) -> zbus::fdo::Result<i64> {
        tracing::info!(name, "enroll requested");
        let profile = parse_profile(profile)?;
        let point_sets = parse_point_sets(samples)?;

        let extractor = self.extractor.clone();
        let store = Arc::clone(&self.store);
        let pipeline = Arc::clone(&self.pipeline);
        let name = name.to_string();
        blocking(move || {
            let id = enroll_from_points(store.as_ref(), &extractor, &name, &profile, &point_sets)
                .map_err(|e| match e {
                    EnrollError::Store(e) => failed(e),
                    other => zbus::fdo::Error::InvalidArgs(other.to_string()),
                })?;
            pipeline.reload_gallery().map_err(failed)?;
            Ok(id)
        })
        .await?
    }

    /// Validate and store new recognition settings, then apply them.
    async fn set_config(
        &self,
        match_threshold: f64,
        dedup_interval_secs: f64,
    ) -> zbus::fdo::Result<String> {
        let config = RecognitionConfig::new(match_threshold as f32, dedup_interval_secs)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let store = Arc::clone(&self.store);
        let pipeline = Arc::clone(&self.pipeline);
        let applied = blocking(move || {
            store.save_recognition_config(&config).map_err(failed)?;
            pipeline.reload_config().map_err(failed)
        })
        .await??;
        to_json(&applied)
    }

    /// Include or exclude an identity from matching, then reload the
    /// gallery. Returns false if no identity has that id.
    async fn set_identity_active(&self, id: i64, active: bool) -> zbus::fdo::Result<bool> {
        let store = Arc::clone(&self.store);
        let pipeline = Arc::clone(&self.pipeline);
        blocking(move || {
            match store.set_identity_active(id, active) {
                Ok(()) => {}
                Err(StoreError::NotFound(_)) => return Ok(false),
                Err(e) => return Err(failed(e)),
            }
            tracing::info!(id, active, "identity activation changed");
            pipeline.reload_gallery().map_err(failed)?;
            Ok(true)
        })
        .await?
    }

    /// Open unknown tracks, most frequently seen first.
    async fn list_unknown_tracks(&self) -> zbus::fdo::Result<String> {
        let store = Arc::clone(&self.store);
        let tracks = blocking(move || store.list_open_unknown_tracks()).await?.map_err(failed)?;
        let rows: Vec<_> = tracks
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id,
                    "temporary_code": t.temporary_code,
                    "first_seen_at": t.first_seen_at,
                    "last_seen_at": t.last_seen_at,
                    "occurrence_count": t.occurrence_count,
                })
            })
            .collect();
        to_json(&rows)
    }

    /// Count another sighting of an unknown track. Returns false if no open
    /// track has that id.
    async fn bump_unknown_track(&self, id: i64) -> zbus::fdo::Result<bool> {
        let pipeline = Arc::clone(&self.pipeline);
        track_outcome(id, blocking(move || pipeline.bump_unknown_track(id)).await?)
    }

    /// Close an unknown track. Returns false if no open track has that id.
    async fn resolve_unknown_track(&self, id: i64) -> zbus::fdo::Result<bool> {
        let pipeline = Arc::clone(&self.pipeline);
        track_outcome(id, blocking(move || pipeline.resolve_unknown_track(id)).await?)
    }

    /// Turn an open unknown track into a known identity using the track's
    /// stored vector. Returns the new identity id, or -1 if no open track
    /// has that id.
    async fn promote_unknown_track(
        &self,
        id: i64,
        name: &str,
        profile: &str,
    ) -> zbus::fdo::Result<i64> {
        let name = name.trim();
        if name.is_empty() {
            return Err(zbus::fdo::Error::InvalidArgs("display name must not be empty".into()));
        }
        let profile = parse_profile(profile)?;
        let pipeline = Arc::clone(&self.pipeline);
        let name = name.to_string();
        match blocking(move || pipeline.promote_unknown_track(id, &name, profile)).await? {
            Ok(identity_id) => Ok(identity_id),
            Err(PipelineError::Store(StoreError::NotFound(_))) => {
                tracing::info!(id, "no open unknown track with that id");
                Ok(-1)
            }
            Err(e) => Err(failed(e)),
        }
    }

    /// Attendance between two bounds, oldest first, with names and
    /// temporary codes. Bounds are RFC 3339 timestamps or `YYYY-MM-DD`
    /// dates; a date as `to` includes that whole day.
    async fn attendance_report(&self, from: &str, to: &str) -> zbus::fdo::Result<String> {
        let from = parse_bound(from, false)?;
        let to = parse_bound(to, true)?;
        if from >= to {
            return Err(zbus::fdo::Error::InvalidArgs("report range is empty".into()));
        }
        let store = Arc::clone(&self.store);
        let rows = blocking(move || store.attendance_report(from, to)).await?.map_err(failed)?;
        to_json(&rows)
    }

    /// Latest attendance records, newest first.
    async fn recent_attendance(&self, limit: u32) -> zbus::fdo::Result<String> {
        let limit = limit.clamp(1, MAX_ATTENDANCE_ROWS);
        let store = Arc::clone(&self.store);
        let events = blocking(move || store.recent_attendance(limit)).await?.map_err(failed)?;
        to_json(&events)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let gallery = self.pipeline.gallery();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "running": self.pipeline.is_running(),
            "gallery": {
                "generation": gallery.generation(),
                "identities": gallery.len(),
                "dimension": gallery.dimension(),
            },
            "config": self.pipeline.config(),
            "stats": self.pipeline.stats(),
        })
        .to_string())
    }
}

/// Extract every sample and enroll the usable ones.
fn enroll_from_points(
    store: &dyn AttendanceStore,
    extractor: &FeatureExtractor,
    name: &str,
    profile: &Profile,
    point_sets: &[Vec<Point2>],
) -> Result<SubjectId, EnrollError> {
    let samples: Vec<_> = point_sets.iter().filter_map(|p| extractor.extract(p)).collect();
    if samples.len() < point_sets.len() {
        tracing::warn!(
            submitted = point_sets.len(),
            usable = samples.len(),
            "some enrollment samples yielded no features"
        );
    }
    enroll_identity(store, name, profile, &samples)
}

fn parse_point_sets(json: &str) -> zbus::fdo::Result<Vec<Vec<Point2>>> {
    serde_json::from_str(json).map_err(|e| {
        zbus::fdo::Error::InvalidArgs(format!("expected [[[x, y], ...], ...]: {e}"))
    })
}

fn parse_profile(json: &str) -> zbus::fdo::Result<Profile> {
    if json.trim().is_empty() {
        return Ok(Profile::default());
    }
    serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid profile: {e}")))
}

/// Parse a report bound. A bare date means its midnight (UTC), or the next
/// midnight when it closes the range.
fn parse_bound(raw: &str, end: bool) -> zbus::fdo::Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        zbus::fdo::Error::InvalidArgs(format!("expected RFC 3339 time or YYYY-MM-DD, got {raw:?}"))
    })?;
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    Ok(if end { midnight + Duration::days(1) } else { midnight })
}

fn track_outcome(id: SubjectId, result: Result<(), PipelineError>) -> zbus::fdo::Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(PipelineError::Store(StoreError::NotFound(_))) => {
            tracing::info!(id, "no open unknown track with that id");
            Ok(false)
        }
        Err(e) => Err(failed(e)),
    }
}

/// Run store or pipeline work off the async executor.
async fn blocking<T, F>(f: F) -> zbus::fdo::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("worker task failed: {e}")))
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "request failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    /// A face whose landmarks sit on a slightly perturbed grid.
    fn face(jitter: f32) -> Vec<Point2> {
        (0..468)
            .map(|i| {
                let x = (i % 22) as f32 * 10.0 + jitter * (i % 3) as f32;
                let y = (i / 22) as f32 * 10.0 - jitter * (i % 5) as f32;
                (x, y)
            })
            .collect()
    }

    #[test]
    fn test_parse_point_sets() {
        let sets = parse_point_sets("[[[1.0, 2.0], [3.5, 4.0]], []]").unwrap();
        assert_eq!(sets, vec![vec![(1.0, 2.0), (3.5, 4.0)], vec![]]);
        assert!(matches!(parse_point_sets("{\"x\": 1}"), Err(zbus::fdo::Error::InvalidArgs(_))));
    }

    #[test]
    fn test_parse_profile() {
        assert_eq!(parse_profile("  ").unwrap(), Profile::default());
        let p = parse_profile(r#"{"age": 30, "phone": "555-0100"}"#).unwrap();
        assert_eq!(p.age, Some(30));
        assert_eq!(p.phone.as_deref(), Some("555-0100"));
        assert!(parse_profile("[1]").is_err());
    }

    #[test]
    fn test_parse_bound() {
        let day = |d: u32, h: u32| Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).unwrap();
        assert_eq!(parse_bound("2026-03-01", false).unwrap(), day(1, 0));
        assert_eq!(parse_bound("2026-03-01", true).unwrap(), day(2, 0));
        assert_eq!(parse_bound("2026-03-01T09:00:00-03:00", true).unwrap(), day(1, 12));
        assert!(matches!(parse_bound("yesterday", false), Err(zbus::fdo::Error::InvalidArgs(_))));
    }

    #[test]
    fn test_track_outcome() {
        assert!(track_outcome(1, Ok(())).unwrap());
        assert!(!track_outcome(1, Err(PipelineError::Store(StoreError::NotFound(1)))).unwrap());
        assert!(track_outcome(1, Err(PipelineError::Stopped)).is_err());
    }

    #[test]
    fn test_enroll_from_points_skips_unusable_samples() {
        let store = SqliteStore::open_in_memory().unwrap();
        let extractor = FeatureExtractor::default();
        let samples = vec![face(0.0), face(0.5), vec![], face(1.0)];
        let id = enroll_from_points(&store, &extractor, " Ana ", &Profile::default(), &samples).unwrap();

        let rows = store.list_active_known_identities().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].display_name, "Ana");
    }

    #[test]
    fn test_enroll_from_points_needs_three_usable() {
        let store = SqliteStore::open_in_memory().unwrap();
        let extractor = FeatureExtractor::default();
        let samples = vec![face(0.0), vec![], vec![(f32::NAN, 0.0)]];
        let err = enroll_from_points(&store, &extractor, "Ana", &Profile::default(), &samples).unwrap_err();
        assert!(matches!(err, EnrollError::NotEnoughSamples(1)));
        assert!(store.list_active_known_identities().unwrap().is_empty());
    }
}
