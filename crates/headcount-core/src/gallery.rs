//! In-memory cache of enrolled identities, rebuilt wholesale on reload.

use crate::codec;
use crate::snapshot::SnapshotCell;
use crate::store::{AttendanceStore, StoreError};
use crate::types::{KnownIdentity, SubjectId};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery reload failed, keeping generation {kept}: {source}")]
    Store {
        kept: u64,
        #[source]
        source: StoreError,
    },
}

/// One immutable generation of the gallery.
///
/// Identities are ordered by ascending id, which is the iteration order the
/// matcher uses to break exact ties.
#[derive(Debug, Default)]
pub struct GallerySnapshot {
    generation: u64,
    dimension: Option<usize>,
    identities: Vec<KnownIdentity>,
}

impl GallerySnapshot {
    pub fn new(generation: u64, mut identities: Vec<KnownIdentity>) -> Self {
        identities.sort_by_key(|i| i.id);
        let dimension = identities.first().map(|i| i.features.len());
        Self {
            generation,
            dimension,
            identities,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Feature vector length shared by every identity in this generation.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn identities(&self) -> &[KnownIdentity] {
        &self.identities
    }

    pub fn get(&self, id: SubjectId) -> Option<&KnownIdentity> {
        self.identities
            .binary_search_by_key(&id, |i| i.id)
            .ok()
            .map(|idx| &self.identities[idx])
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Outcome of a successful reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadReport {
    pub generation: u64,
    pub loaded: usize,
    pub skipped: usize,
}

/// Reloadable identity cache shared between the reload caller and the
/// pipeline consumer.
pub struct IdentityGallery {
    store: Arc<dyn AttendanceStore>,
    current: SnapshotCell<GallerySnapshot>,
    /// Serializes reloads so generations are published in order.
    reload_lock: Mutex<()>,
}

impl IdentityGallery {
    /// Create an empty gallery (generation 0). Call [`reload`](Self::reload)
    /// to hydrate it.
    pub fn new(store: Arc<dyn AttendanceStore>) -> Self {
        Self {
            store,
            current: SnapshotCell::new(GallerySnapshot::default()),
            reload_lock: Mutex::new(()),
        }
    }

    /// The current generation. Cheap; holds no lock once returned.
    pub fn snapshot(&self) -> Arc<GallerySnapshot> {
        self.current.load()
    }

    /// Fetch all active identities and swap in a new generation.
    ///
    /// Records whose stored vector fails to decode, is empty, or has a length
    /// different from the first valid record are skipped. If the store itself
    /// fails, the previous generation stays in place.
    pub fn reload(&self) -> Result<ReloadReport, GalleryError> {
        let _guard = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.current.load();

        let mut rows = self
            .store
            .list_active_known_identities()
            .map_err(|source| {
                tracing::error!(error = %source, kept = previous.generation(), "gallery reload failed");
                GalleryError::Store {
                    kept: previous.generation(),
                    source,
                }
            })?;
        rows.sort_by_key(|r| r.id);

        let mut identities = Vec::with_capacity(rows.len());
        let mut dimension: Option<usize> = None;
        let mut skipped = 0;

        for row in rows {
            let features = match codec::decode(&row.features) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(id = row.id, name = %row.display_name, error = %e, "skipping identity with corrupt feature vector");
                    skipped += 1;
                    continue;
                }
            };
            if features.is_empty() {
                tracing::warn!(id = row.id, name = %row.display_name, "skipping identity with empty feature vector");
                skipped += 1;
                continue;
            }
            match dimension {
                None => dimension = Some(features.len()),
                Some(dim) if dim != features.len() => {
                    tracing::warn!(
                        id = row.id,
                        name = %row.display_name,
                        expected = dim,
                        actual = features.len(),
                        "skipping identity with mismatched feature dimension"
                    );
                    skipped += 1;
                    continue;
                }
                Some(_) => {}
            }
            identities.push(KnownIdentity {
                id: row.id,
                display_name: row.display_name,
                profile: row.profile,
                features,
            });
        }

        let generation = previous.generation() + 1;
        let loaded = identities.len();
        self.current.publish(GallerySnapshot::new(generation, identities));

        tracing::info!(generation, loaded, skipped, dimension, "gallery reloaded");
        Ok(ReloadReport {
            generation,
            loaded,
            skipped,
        })
    }
}
