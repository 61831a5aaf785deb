//! Provisional tracks for faces that matched no known identity.

use crate::codec;
use crate::matcher::{CosineMatcher, Matcher};
use crate::store::{AttendanceStore, StoreError};
use crate::types::{FeatureVector, Profile, SubjectId, UnknownTrack};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Attempts at drawing a fresh temporary code before giving up.
const CODE_ATTEMPTS: usize = 3;

/// What to do with a query that matched no known identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnknownPolicy {
    /// Every miss opens a new track.
    #[default]
    AlwaysNew,
    /// Match against open tracks first, with the known-identity threshold,
    /// and bump the best hit instead of opening a new track.
    MatchExisting,
}

impl std::str::FromStr for UnknownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always-new" => Ok(Self::AlwaysNew),
            "match-existing" => Ok(Self::MatchExisting),
            other => Err(format!(
                "unknown policy {other:?}: expected always-new or match-existing"
            )),
        }
    }
}

/// Outcome of registering an unmatched face.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub track_id: SubjectId,
    pub temporary_code: String,
    /// False when an existing open track was bumped instead.
    pub created: bool,
}

/// Human-shareable code for a new track, e.g. `TEMP_3FA91C0B`.
pub fn temporary_code() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("TEMP_{}", hex[..8].to_uppercase())
}

/// Opens and maintains unknown tracks.
///
/// Owned by the pipeline consumer. Under [`UnknownPolicy::MatchExisting`] it
/// keeps the open tracks' vectors in memory so matching does not hit the store.
pub struct UnknownTrackRegistry {
    store: Arc<dyn AttendanceStore>,
    policy: UnknownPolicy,
    open_tracks: Vec<UnknownTrack>,
}

impl UnknownTrackRegistry {
    pub fn new(store: Arc<dyn AttendanceStore>, policy: UnknownPolicy) -> Self {
        Self {
            store,
            policy,
            open_tracks: Vec::new(),
        }
    }

    pub fn policy(&self) -> UnknownPolicy {
        self.policy
    }

    /// Load open tracks for matching. A no-op under `AlwaysNew`.
    pub fn hydrate(&mut self) -> Result<usize, StoreError> {
        if self.policy != UnknownPolicy::MatchExisting {
            return Ok(0);
        }
        let mut tracks = Vec::new();
        for row in self.store.list_open_unknown_tracks()? {
            match codec::decode(&row.features) {
                Ok(features) => tracks.push(UnknownTrack {
                    id: row.id,
                    temporary_code: row.temporary_code,
                    features,
                    first_seen_at: row.first_seen_at,
                    last_seen_at: row.last_seen_at,
                    occurrence_count: row.occurrence_count,
                    resolved: row.resolved,
                }),
                Err(e) => {
                    tracing::warn!(id = row.id, code = %row.temporary_code, error = %e, "skipping unknown track with corrupt feature vector");
                }
            }
        }
        tracks.sort_by_key(|t| t.id);
        self.open_tracks = tracks;
        tracing::info!(open = self.open_tracks.len(), "unknown tracks loaded for matching");
        Ok(self.open_tracks.len())
    }

    /// Attribute an unmatched face to a track.
    ///
    /// Under `AlwaysNew` this always persists a new track with occurrence
    /// count 1. Nothing is cached or returned if the store write fails.
    pub fn register_unmatched(
        &mut self,
        query: &FeatureVector,
        seen_at: DateTime<Utc>,
        threshold: f32,
    ) -> Result<Registration, StoreError> {
        if self.policy == UnknownPolicy::MatchExisting {
            let hit = CosineMatcher.compare(query, &self.open_tracks, threshold);
            if let Some(track_id) = hit.subject_id {
                self.bump_existing_track(track_id, seen_at)?;
                let temporary_code = self
                    .open_tracks
                    .iter()
                    .find(|t| t.id == track_id)
                    .map(|t| t.temporary_code.clone())
                    .unwrap_or_default();
                tracing::debug!(track_id, code = %temporary_code, similarity = hit.confidence, "query joined existing unknown track");
                return Ok(Registration {
                    track_id,
                    temporary_code,
                    created: false,
                });
            }
        }

        let blob = codec::encode(query);
        let mut attempt = 0;
        let (track_id, code) = loop {
            attempt += 1;
            let code = temporary_code();
            match self.store.insert_unknown_track(&code, &blob, seen_at) {
                Ok(id) => break (id, code),
                Err(StoreError::Conflict(msg)) if attempt < CODE_ATTEMPTS => {
                    tracing::debug!(code = %code, %msg, "temporary code taken; drawing another");
                }
                Err(e) => return Err(e),
            }
        };

        if self.policy == UnknownPolicy::MatchExisting {
            self.open_tracks.push(UnknownTrack {
                id: track_id,
                temporary_code: code.clone(),
                features: query.clone(),
                first_seen_at: seen_at,
                last_seen_at: seen_at,
                occurrence_count: 1,
                resolved: false,
            });
        }

        Ok(Registration {
            track_id,
            temporary_code: code,
            created: true,
        })
    }

    /// Record another sighting of an existing track.
    pub fn bump_existing_track(
        &mut self,
        track_id: SubjectId,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store.bump_unknown_track(track_id, seen_at)?;
        if let Some(track) = self.open_tracks.iter_mut().find(|t| t.id == track_id) {
            track.occurrence_count += 1;
            track.last_seen_at = track.last_seen_at.max(seen_at);
        }
        Ok(())
    }

    /// Close a track after it was converted to a known identity or
    /// discarded. Resolved tracks no longer attract new queries.
    pub fn resolve(&mut self, track_id: SubjectId) -> Result<(), StoreError> {
        self.store.resolve_unknown_track(track_id)?;
        self.open_tracks.retain(|t| t.id != track_id);
        Ok(())
    }

    /// Turn an open track into a known identity carrying the track's vector.
    /// The track is resolved in the same store step.
    pub fn promote(
        &mut self,
        track_id: SubjectId,
        display_name: &str,
        profile: &Profile,
    ) -> Result<SubjectId, StoreError> {
        let identity_id = self.store.promote_unknown_track(track_id, display_name, profile)?;
        self.open_tracks.retain(|t| t.id != track_id);
        tracing::info!(track_id, identity_id, name = display_name, "unknown track promoted to known identity");
        Ok(identity_id)
    }

    pub fn open_track_count(&self) -> usize {
        self.open_tracks.len()
    }
}
