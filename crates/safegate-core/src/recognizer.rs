//! SFace face recognizer via ONNX Runtime.
//!
//! Crops each detected face, resizes it to 112x112 and extracts a
//! 128-dimensional L2-normalized encoding.

use crate::types::{BoundingBox, FaceEncoding, ENCODING_DIM};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SFACE_INPUT_SIZE: u32 = 112;
/// Fraction of the box size added on each side before cropping.
const CROP_MARGIN: f32 = 0.1;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face region {0:?} lies outside the frame")]
    EmptyCrop(BoundingBox),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// SFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the SFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded SFace model");

        Ok(Self { session })
    }

    /// Extract the encoding of one detected face.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<FaceEncoding, RecognizerError> {
        let (x, y, w, h) =
            crop_rect(face, image.width(), image.height()).ok_or_else(|| RecognizerError::EmptyCrop(face.clone()))?;
        let crop = imageops::crop_imm(image, x, y, w, h).to_image();
        let input = preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("encoding extraction: {e}")))?;

        if raw.len() != ENCODING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ENCODING_DIM}-dim encoding, got {}",
                raw.len()
            )));
        }

        Ok(FaceEncoding::new(l2_normalize(raw)))
    }
}

/// Expand a box by [`CROP_MARGIN`] and clamp it to the frame.
fn crop_rect(face: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
    let mx = face.width * CROP_MARGIN;
    let my = face.height * CROP_MARGIN;
    let x1 = (face.x - mx).max(0.0);
    let y1 = (face.y - my).max(0.0);
    let x2 = (face.x + face.width + mx).min(width as f32);
    let y2 = (face.y + face.height + my).min(height as f32);

    let w = (x2 - x1).floor();
    let h = (y2 - y1).floor();
    if w < 1.0 || h < 1.0 {
        return None;
    }
    Some((x1 as u32, y1 as u32, w as u32, h as u32))
}

/// Resize a face crop to 112x112 and lay it out as a NCHW RGB tensor (0–255).
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = SFACE_INPUT_SIZE as usize;
    let resized = imageops::resize(crop, SFACE_INPUT_SIZE, SFACE_INPUT_SIZE, FilterType::Triangle);
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c] as f32;
        }
    }

    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f64> {
    let norm = raw.iter().map(|&x| (x as f64).powi(2)).sum::<f64>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|&x| x as f64 / norm).collect()
    } else {
        raw.iter().map(|&x| x as f64).collect()
    }
}
