//! 1:1 face comparison: Euclidean distance plus a fixed acceptance threshold.

use crate::types::{FaceEncoding, ENCODING_DIM};
use thiserror::Error;

/// Distance strictly below this value is a match.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("malformed encoding: expected {expected} components, got {actual}")]
    MalformedEncoding { expected: usize, actual: usize },
    #[error("malformed encoding: component {index} is not finite")]
    NonFinite { index: usize },
}

/// Outcome of comparing a live encoding against a reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    pub distance: f64,
    /// `round(1 - distance, 2)` clamped to [0, 1].
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceMatcher {
    threshold: f64,
}

impl Default for FaceMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }
}

impl FaceMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Check that an encoding can take part in a comparison.
    pub fn validate(encoding: &FaceEncoding) -> Result<(), MatchError> {
        if encoding.dim() != ENCODING_DIM {
            return Err(MatchError::MalformedEncoding {
                expected: ENCODING_DIM,
                actual: encoding.dim(),
            });
        }
        match encoding.values.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(MatchError::NonFinite { index }),
            None => Ok(()),
        }
    }

    /// Euclidean distance between a stored and a freshly captured encoding.
    ///
    /// Never truncates or pads: both sides must be exactly 128-dimensional.
    pub fn compare(&self, known: &FaceEncoding, unknown: &FaceEncoding) -> Result<f64, MatchError> {
        Self::validate(known)?;
        Self::validate(unknown)?;
        Ok(known.euclidean_distance(unknown))
    }

    /// Apply the acceptance threshold to a distance.
    pub fn decide(&self, distance: f64) -> MatchResult {
        MatchResult {
            matched: distance < self.threshold,
            distance,
            confidence: confidence_from_distance(distance),
        }
    }

    /// [`compare`](Self::compare) followed by [`decide`](Self::decide).
    pub fn verify(&self, known: &FaceEncoding, unknown: &FaceEncoding) -> Result<MatchResult, MatchError> {
        let distance = self.compare(known, unknown)?;
        Ok(self.decide(distance))
    }
}

/// `round(1 - distance, 2)` with ties to even, clamped to [0, 1].
/// Non-finite distances score 0.
pub fn confidence_from_distance(distance: f64) -> f64 {
    if !distance.is_finite() {
        return 0.0;
    }
    let raw = round_half_even((1.0 - distance) * 100.0) / 100.0;
    raw.clamp(0.0, 1.0)
}

fn round_half_even(x: f64) -> f64 {
    if (x - x.trunc()).abs() == 0.5 {
        2.0 * (x / 2.0).round()
    } else {
        x.round()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoding_with_first(value: f64) -> FaceEncoding {
        let mut values = vec![0.0; ENCODING_DIM];
        values[0] = value;
        FaceEncoding::new(values)
    }

    #[test]
    fn test_match_below_threshold() {
        let result = FaceMatcher::default()
            .verify(&encoding_with_first(0.0), &encoding_with_first(0.3))
            .unwrap();
        assert!(result.matched);
        assert!((result.distance - 0.3).abs() < 1e-12);
        assert_eq!(result.confidence, 0.7);
    }

    #[test]
    fn test_mismatch_above_threshold() {
        let result = FaceMatcher::default()
            .verify(&encoding_with_first(0.0), &encoding_with_first(0.6))
            .unwrap();
        assert!(!result.matched);
        assert_eq!(result.confidence, 0.4);
    }

    #[test]
    fn test_threshold_is_strict() {
        let result = FaceMatcher::default().decide(0.5);
        assert!(!result.matched, "distance equal to threshold must not match");
        assert_eq!(result.confidence, 0.5);
    }

    #[test]
    fn test_threshold_override() {
        let matcher = FaceMatcher::new(0.65);
        assert_eq!(matcher.threshold(), 0.65);
        assert!(matcher.decide(0.6).matched);
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(confidence_from_distance(0.0), 1.0);
        assert_eq!(confidence_from_distance(1.0), 0.0);
        assert_eq!(confidence_from_distance(1.7), 0.0);
        assert_eq!(confidence_from_distance(f64::INFINITY), 0.0);
        assert_eq!(confidence_from_distance(f64::NAN), 0.0);
    }

    #[test]
    fn test_confidence_rounds_to_two_places() {
        assert_eq!(confidence_from_distance(0.123), 0.88);
        assert_eq!(confidence_from_distance(0.456), 0.54);
        for step in 0..=300 {
            let c = confidence_from_distance(step as f64 / 100.0);
            assert!((0.0..=1.0).contains(&c));
        }
    }

    #[test]
    fn test_confidence_ties_round_to_even() {
        assert_eq!(confidence_from_distance(0.375), 0.62);
        assert_eq!(confidence_from_distance(0.875), 0.12);
        assert_eq!(confidence_from_distance(0.625), 0.38);
        assert_eq!(round_half_even(-2.5), -2.0);
        assert_eq!(round_half_even(3.5), 4.0);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let short = FaceEncoding::new(vec![0.0; 127]);
        let err = FaceMatcher::default()
            .compare(&short, &encoding_with_first(0.0))
            .unwrap_err();
        assert_eq!(
            err,
            MatchError::MalformedEncoding {
                expected: ENCODING_DIM,
                actual: 127
            }
        );

        let long = FaceEncoding::new(vec![0.0; 129]);
        assert!(FaceMatcher::default()
            .compare(&encoding_with_first(0.0), &long)
            .is_err());
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut values = vec![0.0; ENCODING_DIM];
        values[3] = f64::NAN;
        let err = FaceMatcher::validate(&FaceEncoding::new(values)).unwrap_err();
        assert_eq!(err, MatchError::NonFinite { index: 3 });
    }
}
