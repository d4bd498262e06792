//! FaceNet face recognizer via ONNX Runtime.
//!
//! Crops a detected face with context padding, resizes it to 160x160 and
//! extracts a 128-dimensional embedding, L2-normalized before it leaves
//! this module.

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const FACENET_INPUT_SIZE: u32 = 160;
const FACENET_MEAN: f32 = 127.5;
const FACENET_STD: f32 = 128.0;
pub const FACENET_EMBEDDING_DIM: usize = 128;
/// Fraction of the face size added as context on every side of the crop.
const FACE_CROP_PADDING: f32 = 0.3;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} — place the FaceNet model in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face crop is empty")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// FaceNet-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the FaceNet ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded FaceNet model"
        );

        Ok(Self { session })
    }

    /// Extract a normalized embedding for `face` within `frame`.
    pub fn extract(
        &mut self,
        frame: &GrayImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let crop = crop_face(frame, face).ok_or(RecognizerError::EmptyCrop)?;
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding: {e}")))?;

        if raw.len() != FACENET_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {FACENET_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::normalized(raw.to_vec()))
    }
}

/// Crop the face box grown by [`FACE_CROP_PADDING`] on each side, clamped
/// to the frame, and resize it to the model input size.
fn crop_face(frame: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
    let pad_x = face.width * FACE_CROP_PADDING;
    let pad_y = face.height * FACE_CROP_PADDING;
    let left = (face.x - pad_x).max(0.0) as u32;
    let top = (face.y - pad_y).max(0.0) as u32;
    let right = ((face.x + face.width + pad_x).max(0.0) as u32).min(frame.width());
    let bottom = ((face.y + face.height + pad_y).max(0.0) as u32).min(frame.height());

    if right <= left || bottom <= top {
        return None;
    }

    let crop = imageops::crop_imm(frame, left, top, right - left, bottom - top).to_image();
    Some(imageops::resize(
        &crop,
        FACENET_INPUT_SIZE,
        FACENET_INPUT_SIZE,
        FilterType::Triangle,
    ))
}

/// NHWC float tensor, gray replicated into RGB, scaled to roughly [-1, 1].
fn preprocess(face: &GrayImage) -> Array4<f32> {
    let size = FACENET_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for (x, y, pixel) in face.enumerate_pixels() {
        let v = (pixel.0[0] as f32 - FACENET_MEAN) / FACENET_STD;
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = v;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn face(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_crop_face_resizes_to_input() {
        let frame = GrayImage::from_pixel(640, 480, Luma([90]));
        let crop = crop_face(&frame, &face(200.0, 100.0, 120.0, 150.0)).unwrap();
        assert_eq!(crop.dimensions(), (FACENET_INPUT_SIZE, FACENET_INPUT_SIZE));
        assert!(crop.pixels().all(|p| p.0[0] == 90));
    }

    #[test]
    fn test_crop_face_clamps_to_frame() {
        let frame = GrayImage::from_pixel(100, 100, Luma([10]));
        // Box hanging off the top-left corner still produces a crop.
        assert!(crop_face(&frame, &face(-20.0, -20.0, 50.0, 50.0)).is_some());
    }

    #[test]
    fn test_crop_face_outside_frame() {
        let frame = GrayImage::from_pixel(100, 100, Luma([10]));
        assert!(crop_face(&frame, &face(500.0, 500.0, 20.0, 20.0)).is_none());
    }

    #[test]
    fn test_preprocess_layout_and_normalization() {
        let crop = GrayImage::from_pixel(FACENET_INPUT_SIZE, FACENET_INPUT_SIZE, Luma([255]));
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 160, 160, 3]);
        let expected = (255.0 - FACENET_MEAN) / FACENET_STD;
        assert!((tensor[[0, 5, 7, 0]] - expected).abs() < 1e-6);
        assert_eq!(tensor[[0, 5, 7, 0]], tensor[[0, 5, 7, 2]]);
    }
}
