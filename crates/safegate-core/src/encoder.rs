//! Biometric encoder contract and its ONNX-backed implementation.
//!
//! The pipeline never sees model internals: it asks a [`FaceAnalyzer`] for
//! the encodings of every face in a frame and applies its own policy.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, FaceEncoding};
use image::RgbImage;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("encoder returned {encodings} encodings for {regions} face regions")]
    CountMismatch { regions: usize, encodings: usize },
    #[error("encoder did not answer within {0:?}")]
    Timeout(Duration),
    #[error("encoder unavailable: {0}")]
    Unavailable(String),
}

/// External face capability: locate faces, then encode each located region.
pub trait BiometricEncoder {
    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError>;

    /// Returns one encoding per region, in region order.
    fn encode(&mut self, image: &RgbImage, regions: &[BoundingBox]) -> Result<Vec<FaceEncoding>, EncoderError>;
}

/// Faces found in one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceAnalysis {
    NoFace,
    Single(FaceEncoding),
    /// Encodings in detector order (highest confidence first).
    Multiple(Vec<FaceEncoding>),
}

impl FaceAnalysis {
    pub fn face_count(&self) -> usize {
        match self {
            Self::NoFace => 0,
            Self::Single(_) => 1,
            Self::Multiple(all) => all.len(),
        }
    }
}

/// Run one locate + encode pass over a frame.
pub fn analyze<E: BiometricEncoder + ?Sized>(encoder: &mut E, image: &RgbImage) -> Result<FaceAnalysis, EncoderError> {
    let regions = encoder.locate_faces(image)?;
    if regions.is_empty() {
        return Ok(FaceAnalysis::NoFace);
    }

    let mut encodings = encoder.encode(image, &regions)?;
    if encodings.len() != regions.len() {
        return Err(EncoderError::CountMismatch {
            regions: regions.len(),
            encodings: encodings.len(),
        });
    }

    Ok(match encodings.len() {
        1 => FaceAnalysis::Single(encodings.remove(0)),
        _ => FaceAnalysis::Multiple(encodings),
    })
}

/// Thread-safe face analysis used by the access pipeline.
pub trait FaceAnalyzer: Send + Sync {
    fn analyze(&self, image: RgbImage) -> Result<FaceAnalysis, EncoderError>;
}

impl<E: BiometricEncoder + Send> FaceAnalyzer for Mutex<E> {
    fn analyze(&self, image: RgbImage) -> Result<FaceAnalysis, EncoderError> {
        let mut encoder = self
            .lock()
            .map_err(|_| EncoderError::Unavailable("encoder lock poisoned".into()))?;
        analyze(&mut *encoder, &image)
    }
}

/// UltraFace detection + SFace encoding.
pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceEncoder {
    pub fn load(detector_path: &str, recognizer_path: &str) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(detector_path)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self { detector, recognizer })
    }
}

impl BiometricEncoder for OnnxFaceEncoder {
    fn locate_faces(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError> {
        Ok(self.detector.detect(image)?)
    }

    fn encode(&mut self, image: &RgbImage, regions: &[BoundingBox]) -> Result<Vec<FaceEncoding>, EncoderError> {
        regions
            .iter()
            .map(|region| self.recognizer.extract(image, region).map_err(EncoderError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ENCODING_DIM;
    use image::Rgb;

    struct FixedEncoder {
        faces: usize,
        short_by: usize,
    }

    impl BiometricEncoder for FixedEncoder {
        fn locate_faces(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError> {
            Ok((0..self.faces)
                .map(|i| BoundingBox {
                    x: i as f32 * 10.0,
                    y: 0.0,
                    width: 10.0,
                    height: 10.0,
                    confidence: 1.0 - i as f32 * 0.1,
                })
                .collect())
        }

        fn encode(&mut self, _image: &RgbImage, regions: &[BoundingBox]) -> Result<Vec<FaceEncoding>, EncoderError> {
            Ok(regions
                .iter()
                .skip(self.short_by)
                .map(|r| FaceEncoding::new(vec![r.x as f64; ENCODING_DIM]))
                .collect())
        }
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]))
    }

    #[test]
    fn test_analyze_no_face() {
        let mut enc = FixedEncoder { faces: 0, short_by: 0 };
        assert_eq!(analyze(&mut enc, &frame()).unwrap(), FaceAnalysis::NoFace);
    }

    #[test]
    fn test_analyze_single_face() {
        let mut enc = FixedEncoder { faces: 1, short_by: 0 };
        let analysis = analyze(&mut enc, &frame()).unwrap();
        assert_eq!(analysis.face_count(), 1);
        assert!(matches!(analysis, FaceAnalysis::Single(_)));
    }

    #[test]
    fn test_analyze_multiple_faces_keeps_order() {
        let mut enc = FixedEncoder { faces: 3, short_by: 0 };
        match analyze(&mut enc, &frame()).unwrap() {
            FaceAnalysis::Multiple(all) => {
                assert_eq!(all.len(), 3);
                assert_eq!(all[0].values[0], 0.0);
                assert_eq!(all[2].values[0], 20.0);
            }
            other => panic!("expected multiple faces, got {other:?}"),
        }
    }

    #[test]
    fn test_analyze_count_mismatch() {
        let mut enc = FixedEncoder { faces: 2, short_by: 1 };
        let err = analyze(&mut enc, &frame()).unwrap_err();
        assert!(matches!(err, EncoderError::CountMismatch { regions: 2, encodings: 1 }));
    }

    #[test]
    fn test_mutex_analyzer() {
        let analyzer = Mutex::new(FixedEncoder { faces: 1, short_by: 0 });
        let analysis = FaceAnalyzer::analyze(&analyzer, frame()).unwrap();
        assert_eq!(analysis.face_count(), 1);
    }
}
