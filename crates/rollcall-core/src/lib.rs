//! rollcall-core — Enrollment data model, gallery matching and face embedding extraction.
//!
//! Uses SCRFD for face detection and a FaceNet-style model for 128-d
//! embeddings, both running via ONNX Runtime for CPU inference. The
//! matcher and stores only ever see normalized [`Embedding`]s.

pub mod config;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod recognizer;
pub mod store;
pub mod types;

use std::path::PathBuf;

pub use config::Config;
pub use detector::FaceDetector;
pub use extractor::{EmbeddingExtractor, ExtractError, FaceExtractor};
pub use matcher::{CosineMatcher, Gallery, Match, MatchResult, Matcher};
pub use recognizer::FaceRecognizer;
pub use store::{AttendanceStore, EnrollmentStore, GalleryStore, MemoryStore, StoreError};
pub use types::{AttendanceRecord, BoundingBox, Embedding, Enrollment, Person};

/// Default directory holding the ONNX model files.
///
/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share/rollcall/models`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// Per-user data directory for the database and models.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("rollcall")
}

pub(crate) fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}
