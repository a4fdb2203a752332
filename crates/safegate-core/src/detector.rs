//! UltraFace face detector via ONNX Runtime.
//!
//! Runs the RFB-320 variant of the Ultra-Light-Fast-Generic face detector.
//! The exported model already decodes its priors, so post-processing is a
//! score threshold followed by NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ULTRAFACE_INPUT_WIDTH: u32 = 320;
const ULTRAFACE_INPUT_HEIGHT: u32 = 240;
const ULTRAFACE_MEAN: f32 = 127.0;
const ULTRAFACE_STD: f32 = 128.0;
const ULTRAFACE_CONFIDENCE_THRESHOLD: f32 = 0.7;
const ULTRAFACE_NMS_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// UltraFace-based face detector.
pub struct FaceDetector {
    session: Session,
}

impl FaceDetector {
    /// Load the UltraFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded UltraFace model"
        );

        Ok(Self { session })
    }

    /// Detect faces in an RGB frame, returning boxes sorted by confidence.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let input = preprocess(image);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("scores: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("boxes: {e}")))?;

        if scores.len() / 2 != boxes.len() / 4 {
            return Err(DetectorError::InferenceFailed(format!(
                "prior count mismatch: {} scores, {} boxes",
                scores.len() / 2,
                boxes.len() / 4
            )));
        }

        let detections = decode(
            scores,
            boxes,
            image.width() as f32,
            image.height() as f32,
            ULTRAFACE_CONFIDENCE_THRESHOLD,
        );
        Ok(nms(detections, ULTRAFACE_NMS_THRESHOLD))
    }
}

/// Resize to the network input and normalize into a NCHW float tensor.
fn preprocess(image: &RgbImage) -> Array4<f32> {
    let resized = imageops::resize(
        image,
        ULTRAFACE_INPUT_WIDTH,
        ULTRAFACE_INPUT_HEIGHT,
        FilterType::Triangle,
    );

    let h = ULTRAFACE_INPUT_HEIGHT as usize;
    let w = ULTRAFACE_INPUT_WIDTH as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 - ULTRAFACE_MEAN) / ULTRAFACE_STD;
        }
    }

    tensor
}

/// Turn per-prior scores `[bg, face]` and normalized corner boxes into
/// pixel-space detections above `threshold`.
fn decode(scores: &[f32], boxes: &[f32], width: f32, height: f32, threshold: f32) -> Vec<BoundingBox> {
    let priors = (scores.len() / 2).min(boxes.len() / 4);
    let mut detections = Vec::new();

    for i in 0..priors {
        let score = scores[i * 2 + 1];
        if score <= threshold {
            continue;
        }

        let x1 = (boxes[i * 4] * width).clamp(0.0, width);
        let y1 = (boxes[i * 4 + 1] * height).clamp(0.0, height);
        let x2 = (boxes[i * 4 + 2] * width).clamp(0.0, width);
        let y2 = (boxes[i * 4 + 3] * height).clamp(0.0, height);
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Compute Intersection-over-Union between two bounding boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union_area = a.width * a.height + b.width * b.height - inter_area;

    if union_area > 0.0 {
        inter_area / union_area
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf }
    }

    #[test]
    fn test_iou_identical() {
        let a = make_bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = make_bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = make_bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.75),
        ];
        let result = nms(detections, 0.3);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_decode_scales_to_pixels() {
        // Two priors: background and a face covering the centre quarter.
        let scores = [0.9, 0.1, 0.05, 0.95];
        let boxes = [0.0, 0.0, 0.1, 0.1, 0.25, 0.25, 0.75, 0.75];
        let dets = decode(&scores, &boxes, 640.0, 480.0, 0.7);
        assert_eq!(dets.len(), 1);
        let face = &dets[0];
        assert!((face.x - 160.0).abs() < 1e-3);
        assert!((face.y - 120.0).abs() < 1e-3);
        assert!((face.width - 320.0).abs() < 1e-3);
        assert!((face.height - 240.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_drops_degenerate_boxes() {
        let scores = [0.0, 0.99];
        let boxes = [0.5, 0.5, 0.5, 0.9];
        assert!(decode(&scores, &boxes, 100.0, 100.0, 0.7).is_empty());
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let image = RgbImage::from_pixel(64, 48, Rgb([127, 255, 0]));
        let tensor = preprocess(&image);
        assert_eq!(
            tensor.shape(),
            &[1, 3, ULTRAFACE_INPUT_HEIGHT as usize, ULTRAFACE_INPUT_WIDTH as usize]
        );
        assert!(tensor[[0, 0, 10, 10]].abs() < 1e-6);
        assert!((tensor[[0, 1, 10, 10]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 10, 10]] + 127.0 / 128.0).abs() < 1e-6);
    }
}
