//! Nearest-neighbor attribution of a query against enrolled vectors.

use crate::types::{FeatureVector, KnownIdentity, SubjectId, UnknownTrack};

/// Anything a query can be matched against.
pub trait Enrolled {
    fn subject_id(&self) -> SubjectId;
    fn features(&self) -> &FeatureVector;
}

impl Enrolled for KnownIdentity {
    fn subject_id(&self) -> SubjectId {
        self.id
    }

    fn features(&self) -> &FeatureVector {
        &self.features
    }
}

impl Enrolled for UnknownTrack {
    fn subject_id(&self) -> SubjectId {
        self.id
    }

    fn features(&self) -> &FeatureVector {
        &self.features
    }
}

/// Result of matching a query against a gallery.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    /// ID of the matched subject, if any candidate cleared the threshold.
    pub subject_id: Option<SubjectId>,
    /// Cosine similarity of the match, or 0.0 when nothing matched.
    pub confidence: f32,
}

impl MatchResult {
    pub const NO_MATCH: MatchResult = MatchResult {
        subject_id: None,
        confidence: 0.0,
    };

    pub fn matched(&self) -> bool {
        self.subject_id.is_some()
    }
}

/// Strategy for comparing a query against a gallery.
pub trait Matcher {
    fn compare<E: Enrolled>(&self, query: &FeatureVector, gallery: &[E], threshold: f32)
        -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Candidates of a different length than the query are skipped. Negative
/// similarity never matches. The first candidate in gallery order wins an
/// exact tie, so a gallery kept in a fixed order gives stable results.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare<E: Enrolled>(
        &self,
        query: &FeatureVector,
        gallery: &[E],
        threshold: f32,
    ) -> MatchResult {
        let mut best_sim = 0.0f32;
        let mut best_id: Option<SubjectId> = None;

        for entry in gallery {
            let Some(sim) = query.similarity(entry.features()) else {
                continue;
            };
            if !sim.is_finite() {
                tracing::warn!(subject = entry.subject_id(), "non-finite similarity; skipping candidate");
                continue;
            }
            if sim > threshold && sim > best_sim {
                best_sim = sim;
                best_id = Some(entry.subject_id());
            }
        }

        match best_id {
            Some(id) => MatchResult {
                subject_id: Some(id),
                confidence: best_sim,
            },
            None => MatchResult::NO_MATCH,
        }
    }
}
