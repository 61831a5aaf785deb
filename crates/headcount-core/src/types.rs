use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A 2D landmark point as produced by the landmark provider.
pub type Point2 = (f32, f32);

/// Store-assigned identifier of a known identity or unknown track.
pub type SubjectId = i64;

/// Unit-norm geometric descriptor of a face.
///
/// Vectors of different length come from different extraction layouts and
/// are never compared against each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Returns `None` when the lengths differ or either vector has zero norm.
    pub fn similarity(&self, other: &FeatureVector) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            Some((dot / denom).clamp(-1.0, 1.0))
        } else {
            None
        }
    }
}

/// Optional demographic attributes captured at enrollment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethnicity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// An enrolled person as held by the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownIdentity {
    pub id: SubjectId,
    pub display_name: String,
    pub profile: Profile,
    pub features: FeatureVector,
}

/// Provisional record for a face that matched no known identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownTrack {
    pub id: SubjectId,
    pub temporary_code: String,
    #[serde(skip)]
    pub features: FeatureVector,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub occurrence_count: u32,
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Known,
    Unknown,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Known => "known",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "known" => Some(Self::Known),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scope of dedup state: a known identity and an unknown track with the
/// same numeric id are different subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubjectKey {
    pub kind: SubjectKind,
    pub id: SubjectId,
}

impl SubjectKey {
    pub fn known(id: SubjectId) -> Self {
        Self { kind: SubjectKind::Known, id }
    }

    pub fn unknown(id: SubjectId) -> Self {
        Self { kind: SubjectKind::Unknown, id }
    }
}

impl std::fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// One append-only attendance record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub subject_id: SubjectId,
    pub subject_kind: SubjectKind,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
}
