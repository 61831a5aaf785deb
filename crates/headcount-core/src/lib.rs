//! headcount-core: attendance attribution engine.
//!
//! Turns facial landmark sets into geometric feature vectors, attributes
//! them to enrolled identities or provisional unknown tracks, and records
//! attendance with a per-subject cooldown, all on a dedicated recognition
//! thread fed by a non-blocking queue.

pub mod codec;
pub mod config;
pub mod dedup;
pub mod enroll;
pub mod features;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod unknown;

pub use config::RecognitionConfig;
pub use features::FeatureExtractor;
pub use gallery::{GallerySnapshot, IdentityGallery};
pub use matcher::{CosineMatcher, MatchResult, Matcher};
pub use pipeline::{Pipeline, PipelineError, PipelineSettings, PipelineStats, ShutdownMode};
pub use store::{AttendanceStore, MemoryStore, StoreError};
pub use types::{
    AttendanceEvent, FeatureVector, KnownIdentity, Point2, Profile, SubjectId, SubjectKey,
    SubjectKind, UnknownTrack,
};
pub use unknown::UnknownPolicy;
