//! Building a known identity from several captured samples.

use crate::codec;
use crate::store::{AttendanceStore, StoreError};
use crate::types::{FeatureVector, Profile, SubjectId};
use thiserror::Error;

/// Fewest extracted samples accepted for one enrollment.
pub const MIN_ENROLL_SAMPLES: usize = 3;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("need at least 3 usable samples, got {0}")]
    NotEnoughSamples(usize),
    #[error("samples disagree on feature dimension ({0} vs {1})")]
    DimensionMismatch(usize, usize),
    #[error("averaged samples cancel out to a zero vector")]
    Degenerate,
    #[error("display name must not be empty")]
    EmptyName,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Element-wise mean of the samples, re-normalized to unit length.
pub fn average_features(samples: &[FeatureVector]) -> Result<FeatureVector, EnrollError> {
    if samples.len() < MIN_ENROLL_SAMPLES {
        return Err(EnrollError::NotEnoughSamples(samples.len()));
    }
    let dim = samples[0].len();
    if let Some(odd) = samples.iter().find(|s| s.len() != dim) {
        return Err(EnrollError::DimensionMismatch(dim, odd.len()));
    }

    let mut sum = vec![0.0f32; dim];
    for sample in samples {
        for (acc, v) in sum.iter_mut().zip(&sample.values) {
            *acc += v;
        }
    }
    let count = samples.len() as f32;
    let mean = FeatureVector::new(sum.into_iter().map(|v| v / count).collect());

    let norm = mean.norm();
    if !norm.is_finite() || norm <= 0.0 {
        return Err(EnrollError::Degenerate);
    }
    Ok(FeatureVector::new(mean.values.iter().map(|v| v / norm).collect()))
}

/// Average `samples` and persist the result as a new active identity.
///
/// The gallery does not see the new identity until its next reload.
pub fn enroll_identity(
    store: &dyn AttendanceStore,
    display_name: &str,
    profile: &Profile,
    samples: &[FeatureVector],
) -> Result<SubjectId, EnrollError> {
    let display_name = display_name.trim();
    if display_name.is_empty() {
        return Err(EnrollError::EmptyName);
    }
    let features = average_features(samples)?;
    let id = store.insert_known_identity(display_name, profile, &codec::encode(&features))?;
    tracing::info!(id, name = display_name, samples = samples.len(), dims = features.len(), "identity enrolled");
    Ok(id)
}
