use chrono::{DateTime, Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Tolerance used when checking that an embedding has unit length.
pub const NORM_TOLERANCE: f32 = 1e-3;

/// Cosine distances at or below this are rounding noise around an exact match.
pub const EXACT_MATCH_EPSILON: f64 = 1e-6;

/// Bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (128-dimensional for the FaceNet model).
///
/// Embeddings are L2-normalized once, when they are created by the
/// extractor. Nothing downstream normalizes again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    /// L2-normalize raw model output into an embedding.
    ///
    /// A zero vector is kept as-is; it will fail [`is_normalized`](Self::is_normalized).
    pub fn normalized(raw: Vec<f32>) -> Self {
        let norm = l2_norm(&raw);
        let values = if norm > 0.0 {
            raw.into_iter().map(|x| x / norm).collect()
        } else {
            raw
        };
        Self { values }
    }

    /// Wrap values that are already normalized (e.g. loaded from a store).
    pub fn from_normalized(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    pub fn is_normalized(&self) -> bool {
        (self.norm() - 1.0).abs() <= NORM_TOLERANCE
    }

    /// Cosine distance `1 - a·b` between two unit vectors, in `[0, 2]`.
    ///
    /// The dot product is accumulated in f64, and anything within
    /// [`EXACT_MATCH_EPSILON`] of zero is reported as exactly zero so an
    /// embedding always sits at distance 0 from itself.
    /// Returns `None` when the dimensions differ.
    pub fn cosine_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let dot: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| f64::from(a) * f64::from(b))
            .sum();
        let distance = (1.0 - dot).clamp(0.0, 2.0);
        if distance <= EXACT_MATCH_EPSILON {
            Some(0.0)
        } else {
            Some(distance as f32)
        }
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// An enrolled identity: an opaque id and its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub embedding: Embedding,
}

/// Display metadata kept next to an enrollment. Never used for matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: String,
    pub name: String,
    /// Class or team the person belongs to (may be empty).
    pub group: String,
    pub photo_path: Option<String>,
    pub enrolled_at: DateTime<Local>,
}

/// One attendance event. At most one exists per (person, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub person_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    /// `1 - cosine distance` of the match that produced this record.
    pub confidence: f32,
    pub photo_path: Option<String>,
}
