//! Landmark geometry → feature vector.
//!
//! Picks a fixed list of key landmarks from a dense face mesh, measures the
//! Euclidean distance between every pair of key points that lie within a
//! small window of each other in the list, and L2-normalizes the result.

use crate::types::{FeatureVector, Point2};

/// Face-mesh landmark indices used as key points (nose bridge, nose tip,
/// left cheek contour). Repeated indices are intentional: they pin the
/// layout of the distance vector.
pub const FACE_MESH_KEY_POINTS: [usize; 34] = [
    10, 151, 9, 8, 168, 6, 197, 195, 5, 4, 1, 19, 94, 125, 142, 36, 205, 206, 207, 213, 192, 147,
    187, 207, 206, 205, 36, 142, 126, 142, 36, 205, 206, 207,
];

/// Key point `i` is paired with the next `PAIR_WINDOW - 1` key points.
pub const PAIR_WINDOW: usize = 10;

/// Converts landmark point sets into feature vectors.
///
/// Pure and deterministic: identical coordinates always give bit-identical
/// vectors.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    key_points: Vec<usize>,
    window: usize,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(FACE_MESH_KEY_POINTS.to_vec(), PAIR_WINDOW)
    }
}

impl FeatureExtractor {
    pub fn new(key_points: Vec<usize>, window: usize) -> Self {
        Self {
            key_points,
            window: window.max(2),
        }
    }

    /// Length of the vector produced when every key point index is present.
    pub fn full_dimension(&self) -> usize {
        let n = self.key_points.len();
        (0..n).map(|i| (i + self.window).min(n) - i - 1).sum()
    }

    /// Extract a unit-norm feature vector from one face's landmarks.
    ///
    /// Pairs referencing an index past the end of `points` are skipped, so a
    /// sparser landmark model yields a shorter vector that never matches a
    /// full-mesh one. Returns `None` for empty input, non-finite coordinates,
    /// or a zero-norm result.
    pub fn extract(&self, points: &[Point2]) -> Option<FeatureVector> {
        if points.is_empty() {
            return None;
        }
        if points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return None;
        }

        let n = self.key_points.len();
        let mut raw = Vec::with_capacity(self.full_dimension());

        for i in 0..n {
            for j in (i + 1)..(i + self.window).min(n) {
                let (Some(a), Some(b)) = (
                    points.get(self.key_points[i]),
                    points.get(self.key_points[j]),
                ) else {
                    continue;
                };
                raw.push(((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt());
            }
        }

        let norm = raw.iter().map(|d| d * d).sum::<f32>().sqrt();
        if !norm.is_finite() || norm <= 0.0 {
            return None;
        }

        Some(FeatureVector::new(raw.iter().map(|d| d / norm).collect()))
    }
}
