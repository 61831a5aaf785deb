//! Asynchronous recognition pipeline.
//!
//! The frame-processing caller extracts feature vectors and enqueues them
//! without waiting. A single named consumer thread drains the queue in FIFO
//! order: match against the current gallery generation, apply the dedup
//! cooldown, open unknown tracks, and write attendance. A failure on one
//! detection is logged and never stops the loop; only the shutdown sentinel
//! does.

use crate::config::{ConfigError, RecognitionConfig};
use crate::dedup::DedupLimiter;
use crate::features::FeatureExtractor;
use crate::gallery::{GalleryError, GallerySnapshot, IdentityGallery, ReloadReport};
use crate::matcher::{CosineMatcher, Matcher};
use crate::snapshot::SnapshotCell;
use crate::store::{AttendanceStore, StoreError};
use crate::types::{
    AttendanceEvent, FeatureVector, Point2, Profile, SubjectId, SubjectKey, SubjectKind,
};
use crate::unknown::{UnknownPolicy, UnknownTrackRegistry};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is stopped")]
    Stopped,
    #[error("recognition thread panicked")]
    WorkerPanicked,
    #[error("failed to spawn recognition thread: {0}")]
    Spawn(std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What happens to detections still queued behind the shutdown sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShutdownMode {
    /// Drain and drop them, logging how many.
    #[default]
    Discard,
    /// Process them before stopping.
    Drain,
}

impl std::str::FromStr for ShutdownMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discard" => Ok(Self::Discard),
            "drain" => Ok(Self::Drain),
            other => Err(format!("unknown shutdown mode {other:?}: expected discard or drain")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Longest the consumer blocks before re-checking the queue.
    pub poll_interval: Duration,
    pub unknown_policy: UnknownPolicy,
    pub shutdown_mode: ShutdownMode,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            unknown_policy: UnknownPolicy::default(),
            shutdown_mode: ShutdownMode::default(),
        }
    }
}

/// One extracted face waiting for attribution.
#[derive(Debug, Clone)]
pub struct Detection {
    pub features: FeatureVector,
    pub observed_at: DateTime<Utc>,
}

/// Per-face result of [`Pipeline::process_detections`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionMetadata {
    pub index: usize,
    pub extracted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
    pub enqueued: bool,
}

type Reply<T = ()> = Sender<Result<T, StoreError>>;

/// Messages sent from the handle to the consumer thread.
enum PipelineMessage {
    Detection(Detection),
    BumpTrack {
        track_id: SubjectId,
        seen_at: DateTime<Utc>,
        reply: Reply,
    },
    ResolveTrack {
        track_id: SubjectId,
        reply: Reply,
    },
    PromoteTrack {
        track_id: SubjectId,
        display_name: String,
        profile: Profile,
        reply: Reply<SubjectId>,
    },
    Shutdown,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    processed: AtomicU64,
    known_recorded: AtomicU64,
    duplicates_suppressed: AtomicU64,
    unknown_created: AtomicU64,
    unknown_bumped: AtomicU64,
    unknown_promoted: AtomicU64,
    unknown_recorded: AtomicU64,
    persistence_failures: AtomicU64,
    processing_panics: AtomicU64,
    discarded_on_shutdown: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub processed: u64,
    pub known_recorded: u64,
    pub duplicates_suppressed: u64,
    pub unknown_created: u64,
    pub unknown_bumped: u64,
    pub unknown_promoted: u64,
    pub unknown_recorded: u64,
    pub persistence_failures: u64,
    pub processing_panics: u64,
    pub discarded_on_shutdown: u64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PipelineStats {
            enqueued: load(&self.enqueued),
            processed: load(&self.processed),
            known_recorded: load(&self.known_recorded),
            duplicates_suppressed: load(&self.duplicates_suppressed),
            unknown_created: load(&self.unknown_created),
            unknown_bumped: load(&self.unknown_bumped),
            unknown_promoted: load(&self.unknown_promoted),
            unknown_recorded: load(&self.unknown_recorded),
            persistence_failures: load(&self.persistence_failures),
            processing_panics: load(&self.processing_panics),
            discarded_on_shutdown: load(&self.discarded_on_shutdown),
        }
    }
}

/// Handle to a running pipeline. Share it behind an `Arc`.
pub struct Pipeline {
    tx: Sender<PipelineMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Held for reading while sending, for writing while pushing the
    /// sentinel, so nothing from this handle lands behind the sentinel.
    stopped: RwLock<bool>,
    extractor: FeatureExtractor,
    gallery: Arc<IdentityGallery>,
    config: Arc<SnapshotCell<RecognitionConfig>>,
    store: Arc<dyn AttendanceStore>,
    counters: Arc<Counters>,
}

impl Pipeline {
    /// Load config and gallery, then spawn the consumer thread.
    ///
    /// Fails fast if the store cannot provide a valid config or the initial
    /// gallery.
    pub fn start(
        store: Arc<dyn AttendanceStore>,
        extractor: FeatureExtractor,
        settings: PipelineSettings,
    ) -> Result<Self, PipelineError> {
        let config = RecognitionConfig::load(store.as_ref())?;
        tracing::info!(
            threshold = config.match_threshold,
            dedup_secs = config.dedup_interval.as_secs_f64(),
            "recognition config loaded"
        );

        let gallery = Arc::new(IdentityGallery::new(Arc::clone(&store)));
        gallery.reload()?;

        let mut registry = UnknownTrackRegistry::new(Arc::clone(&store), settings.unknown_policy);
        registry.hydrate()?;

        let config = Arc::new(SnapshotCell::new(config));
        let counters = Arc::new(Counters::default());
        let (tx, rx) = crossbeam_channel::unbounded();

        let consumer = Consumer {
            rx,
            gallery: Arc::clone(&gallery),
            config: Arc::clone(&config),
            store: Arc::clone(&store),
            dedup: DedupLimiter::new(),
            registry,
            counters: Arc::clone(&counters),
            settings,
        };

        let worker = std::thread::Builder::new()
            .name("headcount-recognizer".into())
            .spawn(move || consumer.run())
            .map_err(PipelineError::Spawn)?;

        Ok(Self {
            tx,
            worker: Mutex::new(Some(worker)),
            stopped: RwLock::new(false),
            extractor,
            gallery,
            config,
            store,
            counters,
        })
    }

    /// Extract and enqueue every face in a frame. Returns immediately with
    /// per-face extraction results; attribution happens on the consumer.
    pub fn process_detections(&self, point_sets: &[Vec<Point2>]) -> Vec<DetectionMetadata> {
        let observed_at = Utc::now();
        point_sets
            .iter()
            .enumerate()
            .map(|(index, points)| match self.extractor.extract(points) {
                Some(features) => {
                    let dimension = Some(features.len());
                    let enqueued = match self.enqueue(features, observed_at) {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(index, error = %e, "dropping query");
                            false
                        }
                    };
                    DetectionMetadata {
                        index,
                        extracted: true,
                        dimension,
                        enqueued,
                    }
                }
                None => {
                    tracing::debug!(index, points = points.len(), "feature extraction failed; dropping query");
                    DetectionMetadata {
                        index,
                        extracted: false,
                        dimension: None,
                        enqueued: false,
                    }
                }
            })
            .collect()
    }

    /// Queue one feature vector. Never blocks.
    pub fn enqueue(
        &self,
        features: FeatureVector,
        observed_at: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        self.send(PipelineMessage::Detection(Detection {
            features,
            observed_at,
        }))?;
        bump(&self.counters.enqueued);
        Ok(())
    }

    fn send(&self, message: PipelineMessage) -> Result<(), PipelineError> {
        let stopped = self.stopped.read().unwrap_or_else(|e| e.into_inner());
        if *stopped {
            return Err(PipelineError::Stopped);
        }
        self.tx.send(message).map_err(|_| PipelineError::Stopped)
    }

    /// Rebuild the gallery from the store. Safe while detections are in
    /// flight; they see either the old or the new generation.
    pub fn reload_gallery(&self) -> Result<ReloadReport, GalleryError> {
        self.gallery.reload()
    }

    /// Re-read thresholds from the store. The last good config stays in
    /// effect on error.
    pub fn reload_config(&self) -> Result<RecognitionConfig, ConfigError> {
        match RecognitionConfig::load(self.store.as_ref()) {
            Ok(config) => {
                self.config.publish(config);
                tracing::info!(
                    threshold = config.match_threshold,
                    dedup_secs = config.dedup_interval.as_secs_f64(),
                    "recognition config reloaded"
                );
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(error = %e, "config reload failed; keeping current config");
                Err(e)
            }
        }
    }

    pub fn config(&self) -> RecognitionConfig {
        *self.config.load()
    }

    pub fn gallery(&self) -> Arc<GallerySnapshot> {
        self.gallery.snapshot()
    }

    /// Record another sighting of an unknown track, after a human decided a
    /// later track was the same person.
    pub fn bump_unknown_track(&self, track_id: SubjectId) -> Result<(), PipelineError> {
        self.request(|reply| PipelineMessage::BumpTrack {
            track_id,
            seen_at: Utc::now(),
            reply,
        })
    }

    /// Close an unknown track (converted to a known identity or discarded).
    pub fn resolve_unknown_track(&self, track_id: SubjectId) -> Result<(), PipelineError> {
        self.request(|reply| PipelineMessage::ResolveTrack { track_id, reply })
    }

    /// Create a known identity from an open unknown track's vector, resolve
    /// the track and reload the gallery so the person matches from now on.
    pub fn promote_unknown_track(
        &self,
        track_id: SubjectId,
        display_name: &str,
        profile: Profile,
    ) -> Result<SubjectId, PipelineError> {
        let display_name = display_name.to_string();
        self.request(|reply| PipelineMessage::PromoteTrack {
            track_id,
            display_name,
            profile,
            reply,
        })
    }

    /// Maintenance runs on the consumer so the registry has one owner and
    /// stays ordered with detections. Blocks until the consumer replies.
    fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> PipelineMessage,
    ) -> Result<T, PipelineError> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.send(make(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| PipelineError::Stopped)?
            .map_err(PipelineError::from)
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        !*self.stopped.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Push the shutdown sentinel and join the consumer.
    ///
    /// Detections enqueued before this call are processed. Calling it again
    /// returns the final stats.
    pub fn shutdown(&self) -> Result<PipelineStats, PipelineError> {
        {
            let mut stopped = self.stopped.write().unwrap_or_else(|e| e.into_inner());
            if !*stopped {
                *stopped = true;
                tracing::info!("pipeline shutdown requested");
                // The consumer may already be gone; joining below still works.
                let _ = self.tx.send(PipelineMessage::Shutdown);
            }
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = worker {
            worker.join().map_err(|_| PipelineError::WorkerPanicked)?;
            let stats = self.stats();
            tracing::info!(?stats, "pipeline stopped");
        }
        Ok(self.stats())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "pipeline did not stop cleanly");
        }
    }
}

/// State owned by the consumer thread.
struct Consumer {
    rx: Receiver<PipelineMessage>,
    gallery: Arc<IdentityGallery>,
    config: Arc<SnapshotCell<RecognitionConfig>>,
    store: Arc<dyn AttendanceStore>,
    dedup: DedupLimiter,
    registry: UnknownTrackRegistry,
    counters: Arc<Counters>,
    settings: PipelineSettings,
}

impl Consumer {
    fn run(mut self) {
        tracing::info!(
            poll_ms = self.settings.poll_interval.as_millis() as u64,
            policy = ?self.registry.policy(),
            "recognition thread started"
        );
        loop {
            match self.rx.recv_timeout(self.settings.poll_interval) {
                Ok(PipelineMessage::Shutdown) => {
                    self.finish();
                    break;
                }
                Ok(message) => self.handle(message),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("pipeline handle dropped without shutdown");
                    break;
                }
            }
        }
        tracing::info!("recognition thread exiting");
    }

    /// Deal with whatever is still queued behind the sentinel.
    fn finish(&mut self) {
        let mut discarded = 0u64;
        while let Ok(message) = self.rx.try_recv() {
            match (message, self.settings.shutdown_mode) {
                (PipelineMessage::Shutdown, _) => {}
                (PipelineMessage::Detection(_), ShutdownMode::Discard) => discarded += 1,
                (message, _) => self.handle(message),
            }
        }
        if discarded > 0 {
            self.counters
                .discarded_on_shutdown
                .fetch_add(discarded, Ordering::Relaxed);
            tracing::warn!(discarded, "discarded detections queued after shutdown");
        }
    }

    fn handle(&mut self, message: PipelineMessage) {
        match message {
            PipelineMessage::Detection(detection) => {
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| self.process_detection(detection)));
                bump(&self.counters.processed);
                if outcome.is_err() {
                    bump(&self.counters.processing_panics);
                    tracing::error!("panic while processing detection; continuing");
                }
            }
            PipelineMessage::BumpTrack {
                track_id,
                seen_at,
                reply,
            } => {
                let result = self.registry.bump_existing_track(track_id, seen_at);
                if result.is_ok() {
                    bump(&self.counters.unknown_bumped);
                }
                let _ = reply.send(result);
            }
            PipelineMessage::ResolveTrack { track_id, reply } => {
                let result = self.registry.resolve(track_id);
                if result.is_ok() {
                    tracing::info!(track_id, "unknown track resolved");
                }
                let _ = reply.send(result);
            }
            PipelineMessage::PromoteTrack {
                track_id,
                display_name,
                profile,
                reply,
            } => {
                let result = self.registry.promote(track_id, &display_name, &profile);
                if result.is_ok() {
                    bump(&self.counters.unknown_promoted);
                    if let Err(e) = self.gallery.reload() {
                        tracing::warn!(track_id, error = %e, "gallery reload after promotion failed");
                    }
                }
                let _ = reply.send(result);
            }
            PipelineMessage::Shutdown => {}
        }
    }

    fn process_detection(&mut self, detection: Detection) {
        let config = self.config.load();
        let gallery = self.gallery.snapshot();
        let result = CosineMatcher.compare(
            &detection.features,
            gallery.identities(),
            config.match_threshold,
        );

        match result.subject_id {
            Some(id) => self.record_known(id, &gallery, result.confidence, &detection, &config),
            None => self.record_unknown(&detection, &config),
        }
    }

    fn record_known(
        &mut self,
        id: SubjectId,
        gallery: &GallerySnapshot,
        confidence: f32,
        detection: &Detection,
        config: &RecognitionConfig,
    ) {
        let key = SubjectKey::known(id);
        let name = gallery.get(id).map(|i| i.display_name.as_str()).unwrap_or("?");

        if !self
            .dedup
            .should_record(key, detection.observed_at, config.dedup_interval)
        {
            bump(&self.counters.duplicates_suppressed);
            tracing::debug!(id, name, confidence, "duplicate sighting within dedup interval");
            return;
        }

        let event = AttendanceEvent {
            subject_id: id,
            subject_kind: SubjectKind::Known,
            timestamp: detection.observed_at,
            confidence,
        };
        match self.store.record_attendance(&event) {
            Ok(()) => {
                self.dedup.mark_recorded(key, detection.observed_at);
                bump(&self.counters.known_recorded);
                tracing::info!(id, name, confidence, generation = gallery.generation(), "attendance recorded");
            }
            Err(e) => {
                bump(&self.counters.persistence_failures);
                tracing::warn!(id, name, error = %e, "attendance write failed; will retry on next sighting");
            }
        }
    }

    fn record_unknown(&mut self, detection: &Detection, config: &RecognitionConfig) {
        let registration = match self.registry.register_unmatched(
            &detection.features,
            detection.observed_at,
            config.match_threshold,
        ) {
            Ok(r) => r,
            Err(e) => {
                bump(&self.counters.persistence_failures);
                tracing::warn!(error = %e, "failed to register unknown track; dropping query");
                return;
            }
        };

        if registration.created {
            bump(&self.counters.unknown_created);
        } else {
            bump(&self.counters.unknown_bumped);
        }

        let event = AttendanceEvent {
            subject_id: registration.track_id,
            subject_kind: SubjectKind::Unknown,
            timestamp: detection.observed_at,
            confidence: 0.0,
        };
        match self.store.record_attendance(&event) {
            Ok(()) => {
                bump(&self.counters.unknown_recorded);
                tracing::info!(
                    track_id = registration.track_id,
                    code = %registration.temporary_code,
                    new_track = registration.created,
                    "unknown face recorded"
                );
            }
            Err(e) => {
                bump(&self.counters.persistence_failures);
                tracing::warn!(track_id = registration.track_id, error = %e, "attendance write for unknown track failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::{DEDUP_INTERVAL_KEY, MATCH_THRESHOLD_KEY};
    use crate::store::{MemoryStore, StoredIdentity, StoredUnknownTrack};
    use crate::types::Profile;
    use chrono::TimeZone;
    use std::sync::atomic::AtomicUsize;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn fv(values: &[f32]) -> FeatureVector {
        FeatureVector::new(values.to_vec())
    }

    fn enroll(store: &MemoryStore, name: &str, values: &[f32]) -> SubjectId {
        store
            .insert_known_identity(name, &Profile::default(), &codec::encode(&fv(values)))
            .unwrap()
    }

    fn store_with(threshold: &str, dedup_secs: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.set_config(MATCH_THRESHOLD_KEY, threshold);
        store.set_config(DEDUP_INTERVAL_KEY, dedup_secs);
        store
    }

    fn start(store: Arc<dyn AttendanceStore>) -> Pipeline {
        Pipeline::start(store, FeatureExtractor::default(), PipelineSettings::default()).unwrap()
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(std::time::Instant::now() < deadline, "timed out waiting for consumer");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn kinds(store: &MemoryStore) -> Vec<(SubjectKind, SubjectId)> {
        store
            .attendance()
            .iter()
            .map(|e| (e.subject_kind, e.subject_id))
            .collect()
    }

    /// Delegates to a [`MemoryStore`] but fails or panics on chosen
    /// attendance writes (1-based).
    struct FaultyStore {
        inner: MemoryStore,
        writes: AtomicUsize,
        fail_on: Vec<usize>,
        panic_on: Vec<usize>,
    }

    impl FaultyStore {
        fn new(fail_on: Vec<usize>, panic_on: Vec<usize>) -> Self {
            Self {
                inner: MemoryStore::new(),
                writes: AtomicUsize::new(0),
                fail_on,
                panic_on,
            }
        }
    }

    impl AttendanceStore for FaultyStore {
        fn list_active_known_identities(&self) -> Result<Vec<StoredIdentity>, StoreError> {
            self.inner.list_active_known_identities()
        }
        fn insert_known_identity(&self, name: &str, profile: &Profile, features: &[u8]) -> Result<SubjectId, StoreError> {
            self.inner.insert_known_identity(name, profile, features)
        }
        fn insert_unknown_track(&self, code: &str, features: &[u8], seen_at: DateTime<Utc>) -> Result<SubjectId, StoreError> {
            self.inner.insert_unknown_track(code, features, seen_at)
        }
        fn list_open_unknown_tracks(&self) -> Result<Vec<StoredUnknownTrack>, StoreError> {
            self.inner.list_open_unknown_tracks()
        }
        fn bump_unknown_track(&self, id: SubjectId, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
            self.inner.bump_unknown_track(id, seen_at)
        }
        fn resolve_unknown_track(&self, id: SubjectId) -> Result<(), StoreError> {
            self.inner.resolve_unknown_track(id)
        }
        fn promote_unknown_track(&self, id: SubjectId, name: &str, profile: &Profile) -> Result<SubjectId, StoreError> {
            self.inner.promote_unknown_track(id, name, profile)
        }
        fn record_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_on.contains(&n) {
                panic!("simulated driver panic on write {n}");
            }
            if self.fail_on.contains(&n) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.record_attendance(event)
        }
        fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get_config(key)
        }
    }

    #[test]
    fn test_end_to_end_known_duplicate_and_unknown() {
        let store = store_with("0.6", "5");
        let ana = enroll(&store, "A", &[1.0, 0.0, 0.0]);
        let pipeline = start(store.clone());

        pipeline.enqueue(fv(&[1.0, 0.0, 0.0]), at(0)).unwrap();
        pipeline.enqueue(fv(&[1.0, 0.0, 0.0]), at(1)).unwrap();
        pipeline.enqueue(fv(&[0.0, 1.0, 0.0]), at(2)).unwrap();
        let stats = pipeline.shutdown().unwrap();

        let events = store.attendance();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].subject_kind, SubjectKind::Known);
        assert_eq!(events[0].subject_id, ana);
        assert!((events[0].confidence - 1.0).abs() < 1e-6);
        assert_eq!(events[1].subject_kind, SubjectKind::Unknown);
        assert_eq!(events[1].confidence, 0.0);

        let tracks = store.unknown_tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, events[1].subject_id);

        assert_eq!(stats.processed, 3);
        assert_eq!(stats.known_recorded, 1);
        assert_eq!(stats.duplicates_suppressed, 1);
        assert_eq!(stats.unknown_created, 1);
    }

    #[test]
    fn test_dedup_within_interval() {
        let store = store_with("0.6", "5");
        enroll(&store, "A", &[1.0, 0.0]);
        let pipeline = start(store.clone());
        pipeline.enqueue(fv(&[1.0, 0.0]), at(0)).unwrap();
        pipeline.enqueue(fv(&[1.0, 0.0]), at(3)).unwrap();
        pipeline.shutdown().unwrap();
        assert_eq!(store.attendance().len(), 1);
    }

    #[test]
    fn test_dedup_after_interval() {
        let store = store_with("0.6", "5");
        enroll(&store, "A", &[1.0, 0.0]);
        let pipeline = start(store.clone());
        pipeline.enqueue(fv(&[1.0, 0.0]), at(0)).unwrap();
        pipeline.enqueue(fv(&[1.0, 0.0]), at(6)).unwrap();
        pipeline.shutdown().unwrap();
        assert_eq!(store.attendance().len(), 2);
    }

    #[test]
    fn test_empty_gallery_opens_one_track_per_query() {
        let store = store_with("0.6", "5");
        let pipeline = start(store.clone());
        for i in 0..5 {
            pipeline.enqueue(fv(&[1.0, 0.0]), at(i)).unwrap();
        }
        let stats = pipeline.shutdown().unwrap();

        assert_eq!(store.unknown_tracks().len(), 5);
        let events = store.attendance();
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.subject_kind == SubjectKind::Unknown));
        assert_eq!(stats.unknown_created, 5);
    }

    #[test]
    fn test_match_existing_policy_reuses_unknown_track() {
        let store = store_with("0.6", "5");
        let settings = PipelineSettings {
            unknown_policy: UnknownPolicy::MatchExisting,
            ..PipelineSettings::default()
        };
        let pipeline = Pipeline::start(store.clone(), FeatureExtractor::default(), settings).unwrap();
        for i in 0..3 {
            pipeline.enqueue(fv(&[1.0, 0.0]), at(i)).unwrap();
        }
        let stats = pipeline.shutdown().unwrap();

        let tracks = store.unknown_tracks();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].occurrence_count, 3);
        // Unknown sightings are always recorded.
        assert_eq!(store.attendance().len(), 3);
        assert_eq!((stats.unknown_created, stats.unknown_bumped), (1, 2));
    }

    #[test]
    fn test_failed_write_does_not_start_cooldown() {
        let store = Arc::new(FaultyStore::new(vec![1], vec![]));
        store.inner.set_config(DEDUP_INTERVAL_KEY, "5");
        enroll(&store.inner, "A", &[1.0, 0.0]);
        let pipeline = start(store.clone());

        pipeline.enqueue(fv(&[1.0, 0.0]), at(0)).unwrap();
        pipeline.enqueue(fv(&[1.0, 0.0]), at(1)).unwrap();
        let stats = pipeline.shutdown().unwrap();

        let events = store.inner.attendance();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, at(1));
        assert_eq!(stats.persistence_failures, 1);
    }

    #[test]
    fn test_panic_in_one_detection_does_not_stop_loop() {
        let store = Arc::new(FaultyStore::new(vec![], vec![1]));
        store.inner.set_config(DEDUP_INTERVAL_KEY, "0");
        enroll(&store.inner, "A", &[1.0, 0.0]);
        let pipeline = start(store.clone());

        pipeline.enqueue(fv(&[1.0, 0.0]), at(0)).unwrap();
        pipeline.enqueue(fv(&[1.0, 0.0]), at(1)).unwrap();
        let stats = pipeline.shutdown().unwrap();

        assert_eq!(stats.processing_panics, 1);
        assert_eq!(stats.processed, 2);
        assert_eq!(store.inner.attendance().len(), 1);
    }

    #[test]
    fn test_enqueue_after_shutdown_is_rejected() {
        let pipeline = start(Arc::new(MemoryStore::new()));
        pipeline.shutdown().unwrap();
        assert!(matches!(
            pipeline.enqueue(fv(&[1.0]), at(0)),
            Err(PipelineError::Stopped)
        ));
        assert!(!pipeline.is_running());
        // Second shutdown is a no-op.
        assert!(pipeline.shutdown().is_ok());
    }

    #[test]
    fn test_process_detections_annotates_each_face() {
        let store = store_with("0.6", "5");
        let pipeline = start(store.clone());
        let extractor = FeatureExtractor::default();

        let mesh: Vec<Point2> = (0..468)
            .map(|i| {
                let t = i as f32 * 0.37;
                (100.0 + t.cos() * i as f32, 120.0 + t.sin() * i as f32)
            })
            .collect();
        let meta = pipeline.process_detections(&[mesh, Vec::new()]);
        pipeline.shutdown().unwrap();

        assert_eq!(meta.len(), 2);
        assert_eq!(
            meta[0],
            DetectionMetadata {
                index: 0,
                extracted: true,
                dimension: Some(extractor.full_dimension()),
                enqueued: true,
            }
        );
        assert!(!meta[1].extracted && !meta[1].enqueued);
        assert_eq!(store.unknown_tracks().len(), 1);
    }

    #[test]
    fn test_reload_gallery_picks_up_new_identity() {
        let store = store_with("0.6", "5");
        let pipeline = start(store.clone());
        let ana = enroll(&store, "A", &[1.0, 0.0]);
        let report = pipeline.reload_gallery().unwrap();
        assert_eq!(report.loaded, 1);

        pipeline.enqueue(fv(&[1.0, 0.0]), at(0)).unwrap();
        pipeline.shutdown().unwrap();
        assert_eq!(kinds(&store), vec![(SubjectKind::Known, ana)]);
    }

    #[test]
    fn test_reload_config_changes_threshold() {
        let store = store_with("0.6", "0");
        enroll(&store, "A", &[1.0, 0.0]);
        let pipeline = start(store.clone());

        // cos ≈ 0.8: a match at 0.6, not at 0.9.
        pipeline.enqueue(fv(&[0.8, 0.6]), at(0)).unwrap();
        wait_until(|| store.attendance().len() == 1);
        store.set_config(MATCH_THRESHOLD_KEY, "0.9");
        assert_eq!(pipeline.reload_config().unwrap().match_threshold, 0.9);
        pipeline.enqueue(fv(&[0.8, 0.6]), at(1)).unwrap();
        pipeline.shutdown().unwrap();

        let kinds: Vec<_> = kinds(&store).into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![SubjectKind::Known, SubjectKind::Unknown]);
    }

    #[test]
    fn test_bad_config_reload_keeps_previous() {
        let store = store_with("0.6", "5");
        let pipeline = start(store.clone());
        store.set_config(MATCH_THRESHOLD_KEY, "2.0");
        assert!(pipeline.reload_config().is_err());
        assert_eq!(pipeline.config().match_threshold, 0.6);
        pipeline.shutdown().unwrap();
    }

    #[test]
    fn test_start_fails_on_invalid_config() {
        let store = store_with("0", "5");
        let result = Pipeline::start(store, FeatureExtractor::default(), PipelineSettings::default());
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_bump_and_resolve_through_pipeline() {
        let store = store_with("0.6", "5");
        let pipeline = start(store.clone());
        pipeline.enqueue(fv(&[1.0, 0.0]), at(0)).unwrap();
        wait_until(|| !store.unknown_tracks().is_empty());
        let track = store.unknown_tracks()[0].clone();

        pipeline.bump_unknown_track(track.id).unwrap();
        pipeline.resolve_unknown_track(track.id).unwrap();
        assert!(matches!(
            pipeline.bump_unknown_track(999),
            Err(PipelineError::Store(StoreError::NotFound(999)))
        ));
        assert!(matches!(
            pipeline.bump_unknown_track(track.id),
            Err(PipelineError::Store(StoreError::NotFound(_)))
        ));
        assert!(matches!(
            pipeline.resolve_unknown_track(track.id),
            Err(PipelineError::Store(StoreError::NotFound(_)))
        ));
        pipeline.shutdown().unwrap();

        let track = &store.unknown_tracks()[0];
        assert_eq!(track.occurrence_count, 2);
        assert!(track.resolved);
        assert_eq!(pipeline.stats().unknown_bumped, 1);
    }

    #[test]
    fn test_promoted_track_matches_as_known() {
        let store = store_with("0.6", "5");
        let pipeline = start(store.clone());
        pipeline.enqueue(fv(&[0.0, 1.0]), at(0)).unwrap();
        wait_until(|| !store.unknown_tracks().is_empty());
        let track = store.unknown_tracks()[0].clone();

        let id = pipeline
            .promote_unknown_track(track.id, "Joana", Profile::default())
            .unwrap();
        assert_eq!(pipeline.gallery().get(id).map(|i| i.display_name.as_str()), Some("Joana"));
        assert!(matches!(
            pipeline.promote_unknown_track(track.id, "Joana", Profile::default()),
            Err(PipelineError::Store(StoreError::NotFound(_)))
        ));

        pipeline.enqueue(fv(&[0.0, 1.0]), at(10)).unwrap();
        pipeline.shutdown().unwrap();

        assert_eq!(
            kinds(&store),
            vec![(SubjectKind::Unknown, track.id), (SubjectKind::Known, id)]
        );
        assert!(store.unknown_tracks()[0].resolved);
        assert_eq!(pipeline.stats().unknown_promoted, 1);
    }

    #[test]
    fn test_enqueue_racing_shutdown_is_never_lost() {
        let store = store_with("0.6", "0");
        enroll(&store, "A", &[1.0, 0.0]);
        let pipeline = Arc::new(start(store.clone()));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let pipeline = Arc::clone(&pipeline);
                std::thread::spawn(move || {
                    let mut accepted = 0u64;
                    for i in 0..500 {
                        if pipeline.enqueue(fv(&[1.0, 0.0]), at(i)).is_ok() {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(2));
        pipeline.shutdown().unwrap();
        let accepted: u64 = producers.into_iter().map(|p| p.join().unwrap()).sum();

        let stats = pipeline.stats();
        assert_eq!(stats.enqueued, accepted);
        assert_eq!(stats.processed, accepted);
        assert_eq!(stats.discarded_on_shutdown, 0);
        assert_eq!(stats.known_recorded + stats.duplicates_suppressed, accepted);
    }

    #[test]
    fn test_reload_during_burst_never_loses_identity() {
        let store = store_with("0.6", "0");
        let ana = enroll(&store, "A", &[0.6, 0.8]);
        for i in 0..20 {
            enroll(&store, &format!("decoy-{i}"), &[-0.8, 0.6]);
        }
        let pipeline = Arc::new(start(store.clone()));

        let reloader = {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let report = pipeline.reload_gallery().unwrap();
                    assert_eq!(report.loaded, 21);
                }
            })
        };
        for i in 0..1000 {
            pipeline.enqueue(fv(&[0.6, 0.8]), at(i)).unwrap();
        }
        reloader.join().unwrap();
        let stats = pipeline.shutdown().unwrap();

        assert_eq!(stats.processed, 1000);
        assert_eq!(stats.known_recorded, 1000);
        assert_eq!(stats.unknown_created, 0);
        assert!(store.attendance().iter().all(|e| e.subject_id == ana));
    }

    /// Drive a consumer directly so the queue contents behind the sentinel
    /// are fixed before it runs.
    fn run_with_tail(mode: ShutdownMode) -> (Arc<MemoryStore>, PipelineStats) {
        let store = store_with("0.6", "5");
        let shared: Arc<dyn AttendanceStore> = store.clone();
        let counters = Arc::new(Counters::default());
        let (tx, rx) = crossbeam_channel::unbounded();
        let consumer = Consumer {
            rx,
            gallery: Arc::new(IdentityGallery::new(Arc::clone(&shared))),
            config: Arc::new(SnapshotCell::new(RecognitionConfig::default())),
            store: shared.clone(),
            dedup: DedupLimiter::new(),
            registry: UnknownTrackRegistry::new(shared, UnknownPolicy::AlwaysNew),
            counters: Arc::clone(&counters),
            settings: PipelineSettings {
                shutdown_mode: mode,
                ..PipelineSettings::default()
            },
        };

        let detection = |secs| {
            PipelineMessage::Detection(Detection {
                features: fv(&[1.0, 0.0]),
                observed_at: at(secs),
            })
        };
        tx.send(detection(0)).unwrap();
        tx.send(PipelineMessage::Shutdown).unwrap();
        tx.send(detection(1)).unwrap();
        tx.send(detection(2)).unwrap();
        consumer.run();
        (store, counters.snapshot())
    }

    #[test]
    fn test_discard_mode_drops_tail() {
        let (store, stats) = run_with_tail(ShutdownMode::Discard);
        assert_eq!(store.attendance().len(), 1);
        assert_eq!(stats.discarded_on_shutdown, 2);
    }

    #[test]
    fn test_drain_mode_processes_tail() {
        let (store, stats) = run_with_tail(ShutdownMode::Drain);
        assert_eq!(store.attendance().len(), 3);
        assert_eq!(stats.discarded_on_shutdown, 0);
        assert_eq!(stats.processed, 3);
    }

    #[test]
    fn test_metadata_json_omits_missing_dimension() {
        let meta = DetectionMetadata {
            index: 1,
            extracted: false,
            dimension: None,
            enqueued: false,
        };
        assert_eq!(
            serde_json::to_value(&meta).unwrap(),
            serde_json::json!({"index": 1, "extracted": false, "enqueued": false})
        );
    }

    #[test]
    fn test_shutdown_mode_from_str() {
        assert_eq!("drain".parse::<ShutdownMode>(), Ok(ShutdownMode::Drain));
        assert!("later".parse::<ShutdownMode>().is_err());
    }
}
