//! Persistence boundary.
//!
//! The core never touches SQL. It talks to an [`AttendanceStore`], which the
//! daemon backs with SQLite and tests back with [`MemoryStore`]. Feature
//! vectors cross this boundary as [`codec`](crate::codec) blobs.

use crate::types::{AttendanceEvent, Profile, SubjectId};
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("no such record: {0}")]
    NotFound(SubjectId),
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("store query failed: {0}")]
    Query(String),
}

/// A known identity row, feature vector still encoded.
#[derive(Debug, Clone)]
pub struct StoredIdentity {
    pub id: SubjectId,
    pub display_name: String,
    pub profile: Profile,
    pub features: Vec<u8>,
}

/// An unknown track row, feature vector still encoded.
#[derive(Debug, Clone)]
pub struct StoredUnknownTrack {
    pub id: SubjectId,
    pub temporary_code: String,
    pub features: Vec<u8>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: u32,
    pub resolved: bool,
}

/// Operations the recognition core needs from persistent storage.
///
/// Shared between the gallery reload path and the pipeline consumer thread,
/// so implementations synchronize internally.
pub trait AttendanceStore: Send + Sync {
    fn list_active_known_identities(&self) -> Result<Vec<StoredIdentity>, StoreError>;

    fn insert_known_identity(
        &self,
        display_name: &str,
        profile: &Profile,
        features: &[u8],
    ) -> Result<SubjectId, StoreError>;

    /// Persist a new unknown track with occurrence count 1. A taken
    /// temporary code is reported as [`StoreError::Conflict`].
    fn insert_unknown_track(
        &self,
        temporary_code: &str,
        features: &[u8],
        seen_at: DateTime<Utc>,
    ) -> Result<SubjectId, StoreError>;

    /// Unresolved tracks, most frequently seen first, then most recent.
    fn list_open_unknown_tracks(&self) -> Result<Vec<StoredUnknownTrack>, StoreError>;

    /// Bump `last_seen_at` and the occurrence count of an open track.
    /// Resolved or missing tracks are [`StoreError::NotFound`].
    fn bump_unknown_track(&self, id: SubjectId, seen_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Mark an open track resolved. Resolved or missing tracks are
    /// [`StoreError::NotFound`].
    fn resolve_unknown_track(&self, id: SubjectId) -> Result<(), StoreError>;

    /// Create an active known identity from an open track's stored vector
    /// and resolve the track, in one step.
    fn promote_unknown_track(
        &self,
        id: SubjectId,
        display_name: &str,
        profile: &Profile,
    ) -> Result<SubjectId, StoreError>;

    fn record_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError>;

    fn get_config(&self, key: &str) -> Result<Option<String>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    identities: Vec<(StoredIdentity, bool)>,
    unknowns: Vec<StoredUnknownTrack>,
    attendance: Vec<AttendanceEvent>,
    config: Vec<(String, String)>,
    next_id: SubjectId,
}

impl MemoryState {
    fn allocate_id(&mut self) -> SubjectId {
        self.next_id += 1;
        self.next_id
    }

    fn open_track_mut(&mut self, id: SubjectId) -> Result<&mut StoredUnknownTrack, StoreError> {
        self.unknowns
            .iter_mut()
            .find(|t| t.id == id && !t.resolved)
            .ok_or(StoreError::NotFound(id))
    }
}

/// Process-local store. Used by tests and for running the pipeline without
/// a database.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_config(&self, key: &str, value: &str) {
        let mut state = self.lock();
        state.config.retain(|(k, _)| k != key);
        state.config.push((key.to_string(), value.to_string()));
    }

    /// Insert a known identity with a raw (possibly corrupt) feature blob.
    pub fn insert_raw_identity(&self, display_name: &str, features: Vec<u8>) -> SubjectId {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.identities.push((
            StoredIdentity {
                id,
                display_name: display_name.to_string(),
                profile: Profile::default(),
                features,
            },
            true,
        ));
        id
    }

    pub fn deactivate_identity(&self, id: SubjectId) {
        let mut state = self.lock();
        for (identity, active) in state.identities.iter_mut() {
            if identity.id == id {
                *active = false;
            }
        }
    }

    pub fn attendance(&self) -> Vec<AttendanceEvent> {
        self.lock().attendance.clone()
    }

    pub fn unknown_tracks(&self) -> Vec<StoredUnknownTrack> {
        self.lock().unknowns.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave the vectors half-written.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AttendanceStore for MemoryStore {
    fn list_active_known_identities(&self) -> Result<Vec<StoredIdentity>, StoreError> {
        Ok(self
            .lock()
            .identities
            .iter()
            .filter(|(_, active)| *active)
            .map(|(identity, _)| identity.clone())
            .collect())
    }

    fn insert_known_identity(
        &self,
        display_name: &str,
        profile: &Profile,
        features: &[u8],
    ) -> Result<SubjectId, StoreError> {
        let mut state = self.lock();
        let id = state.allocate_id();
        state.identities.push((
            StoredIdentity {
                id,
                display_name: display_name.to_string(),
                profile: profile.clone(),
                features: features.to_vec(),
            },
            true,
        ));
        Ok(id)
    }

    fn insert_unknown_track(
        &self,
        temporary_code: &str,
        features: &[u8],
        seen_at: DateTime<Utc>,
    ) -> Result<SubjectId, StoreError> {
        let mut state = self.lock();
        if state.unknowns.iter().any(|t| t.temporary_code == temporary_code) {
            return Err(StoreError::Conflict(format!(
                "duplicate temporary code {temporary_code}"
            )));
        }
        let id = state.allocate_id();
        state.unknowns.push(StoredUnknownTrack {
            id,
            temporary_code: temporary_code.to_string(),
            features: features.to_vec(),
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            occurrence_count: 1,
            resolved: false,
        });
        Ok(id)
    }

    fn list_open_unknown_tracks(&self) -> Result<Vec<StoredUnknownTrack>, StoreError> {
        let mut open: Vec<StoredUnknownTrack> = self
            .lock()
            .unknowns
            .iter()
            .filter(|t| !t.resolved)
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            b.occurrence_count
                .cmp(&a.occurrence_count)
                .then(b.last_seen_at.cmp(&a.last_seen_at))
        });
        Ok(open)
    }

    fn bump_unknown_track(&self, id: SubjectId, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.lock();
        let track = state.open_track_mut(id)?;
        track.last_seen_at = track.last_seen_at.max(seen_at);
        track.occurrence_count += 1;
        Ok(())
    }

    fn resolve_unknown_track(&self, id: SubjectId) -> Result<(), StoreError> {
        self.lock().open_track_mut(id)?.resolved = true;
        Ok(())
    }

    fn promote_unknown_track(
        &self,
        id: SubjectId,
        display_name: &str,
        profile: &Profile,
    ) -> Result<SubjectId, StoreError> {
        let mut state = self.lock();
        let track = state.open_track_mut(id)?;
        track.resolved = true;
        let features = track.features.clone();
        let identity_id = state.allocate_id();
        state.identities.push((
            StoredIdentity {
                id: identity_id,
                display_name: display_name.to_string(),
                profile: profile.clone(),
                features,
            },
            true,
        ));
        Ok(identity_id)
    }

    fn record_attendance(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        self.lock().attendance.push(event.clone());
        Ok(())
    }

    fn get_config(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .lock()
            .config
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_inactive_identities_are_hidden() {
        let store = MemoryStore::new();
        let a = store.insert_raw_identity("a", vec![1]);
        let b = store.insert_raw_identity("b", vec![2]);
        store.deactivate_identity(a);
        let listed = store.list_active_known_identities().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, b);
    }

    #[test]
    fn test_open_tracks_ordered_by_count_then_recency() {
        let store = MemoryStore::new();
        let first = store.insert_unknown_track("TEMP_1", &[], at(0)).unwrap();
        let second = store.insert_unknown_track("TEMP_2", &[], at(10)).unwrap();
        let third = store.insert_unknown_track("TEMP_3", &[], at(5)).unwrap();
        store.bump_unknown_track(first, at(1)).unwrap();
        let order: Vec<_> = store
            .list_open_unknown_tracks()
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(order, vec![first, second, third]);
    }

    #[test]
    fn test_resolved_tracks_are_not_open() {
        let store = MemoryStore::new();
        let id = store.insert_unknown_track("TEMP_1", &[], at(0)).unwrap();
        store.resolve_unknown_track(id).unwrap();
        assert!(store.list_open_unknown_tracks().unwrap().is_empty());
        assert!(matches!(store.resolve_unknown_track(99), Err(StoreError::NotFound(99))));
    }

    #[test]
    fn test_resolved_track_cannot_be_bumped_or_resolved_again() {
        let store = MemoryStore::new();
        let id = store.insert_unknown_track("TEMP_1", &[], at(0)).unwrap();
        store.resolve_unknown_track(id).unwrap();
        assert!(matches!(store.bump_unknown_track(id, at(5)), Err(StoreError::NotFound(_))));
        assert!(matches!(store.resolve_unknown_track(id), Err(StoreError::NotFound(_))));
        let track = &store.unknown_tracks()[0];
        assert_eq!(track.occurrence_count, 1);
        assert_eq!(track.last_seen_at, at(0));
    }

    #[test]
    fn test_promote_copies_vector_and_resolves() {
        let store = MemoryStore::new();
        let track = store.insert_unknown_track("TEMP_1", &[7, 8, 9], at(0)).unwrap();
        let profile = Profile {
            age: Some(52),
            ..Profile::default()
        };
        let id = store.promote_unknown_track(track, "Joana", &profile).unwrap();

        let identities = store.list_active_known_identities().unwrap();
        assert_eq!(identities.len(), 1);
        assert_eq!(identities[0].id, id);
        assert_eq!(identities[0].display_name, "Joana");
        assert_eq!(identities[0].profile, profile);
        assert_eq!(identities[0].features, vec![7, 8, 9]);
        assert!(store.list_open_unknown_tracks().unwrap().is_empty());

        assert!(matches!(
            store.promote_unknown_track(track, "Joana", &profile),
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.list_active_known_identities().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_temporary_code_rejected() {
        let store = MemoryStore::new();
        store.insert_unknown_track("TEMP_1", &[], at(0)).unwrap();
        assert!(matches!(
            store.insert_unknown_track("TEMP_1", &[], at(1)),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_config_overwrite() {
        let store = MemoryStore::new();
        assert_eq!(store.get_config("match_threshold").unwrap(), None);
        store.set_config("match_threshold", "0.5");
        store.set_config("match_threshold", "0.7");
        assert_eq!(store.get_config("match_threshold").unwrap().as_deref(), Some("0.7"));
    }
}
