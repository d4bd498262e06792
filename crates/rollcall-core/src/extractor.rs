//! Turning one image into at most one normalized embedding.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use image::GrayImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("extraction failed: {0}")]
    Failed(String),
}

/// Produces an embedding from a decoded image.
///
/// `Ok(None)` means no usable face was found. That is a normal, frequent
/// outcome, not a fault. Implementations must be deterministic for identical
/// input and must return vectors that are already L2-normalized.
pub trait EmbeddingExtractor: Send + 'static {
    type Input: Send + 'static;

    fn extract(&mut self, input: &Self::Input) -> Result<Option<Embedding>, ExtractError>;
}

/// SCRFD detection followed by FaceNet embedding of the largest face.
pub struct FaceExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl FaceExtractor {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self {
            detector,
            recognizer,
        }
    }

    /// Load both models from their file paths.
    pub fn load(scrfd_path: &str, facenet_path: &str) -> Result<Self, ExtractError> {
        Ok(Self::new(
            FaceDetector::load(scrfd_path)?,
            FaceRecognizer::load(facenet_path)?,
        ))
    }
}

impl EmbeddingExtractor for FaceExtractor {
    type Input = GrayImage;

    fn extract(&mut self, input: &GrayImage) -> Result<Option<Embedding>, ExtractError> {
        let faces = self.detector.detect(input)?;
        let Some(largest) = faces
            .into_iter()
            .max_by(|a, b| a.area().total_cmp(&b.area()))
        else {
            tracing::debug!("no face detected");
            return Ok(None);
        };

        tracing::debug!(
            x = largest.x,
            y = largest.y,
            width = largest.width,
            height = largest.height,
            confidence = largest.confidence,
            "face detected"
        );

        match self.recognizer.extract(input, &largest) {
            Ok(embedding) => Ok(Some(embedding)),
            // A box that clamps to nothing is as good as no face.
            Err(RecognizerError::EmptyCrop) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
