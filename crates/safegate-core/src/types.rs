use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of components in a face encoding.
pub const ENCODING_DIM: usize = 128;

/// Bounding box for a detected face, in source image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face encoding vector (128-dimensional for every model this crate accepts).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEncoding {
    pub values: Vec<f64>,
}

impl FaceEncoding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance between two encodings of equal length.
    ///
    /// Only reachable through `FaceMatcher::compare`, which rejects
    /// mismatched dimensions before calling this.
    pub(crate) fn euclidean_distance(&self, other: &FaceEncoding) -> f64 {
        debug_assert_eq!(self.dim(), other.dim(), "encoding dimensions differ");
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt()
    }
}

/// A person's access credential: QR token plus biometric reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: i64,
    pub full_name: String,
    pub qr_token: String,
    pub qr_valid_until: DateTime<Utc>,
    /// Absent when the credential was enrolled without a reference photo.
    pub reference_encoding: Option<FaceEncoding>,
}

impl Credential {
    /// A token is expired once its validity ends strictly before `at`.
    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.qr_valid_until < at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn credential(valid_until: DateTime<Utc>) -> Credential {
        Credential {
            id: 1,
            full_name: "Jan Kowalski".into(),
            qr_token: "valid_token_123".into(),
            qr_valid_until: valid_until,
            reference_encoding: None,
        }
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = FaceEncoding::new(vec![-0.1; ENCODING_DIM]);
        assert_eq!(a.euclidean_distance(&a), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known() {
        let a = FaceEncoding::new(vec![0.0, 0.0]);
        let b = FaceEncoding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-12);
    }

    #[test]
    #[should_panic(expected = "encoding dimensions differ")]
    #[cfg(debug_assertions)]
    fn test_euclidean_distance_refuses_mismatched_lengths() {
        let a = FaceEncoding::new(vec![0.0; ENCODING_DIM]);
        let b = FaceEncoding::new(vec![0.0; 64]);
        a.euclidean_distance(&b);
    }

    #[test]
    fn test_expiry_boundary() {
        let until = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let cred = credential(until);
        assert!(!cred.is_expired_at(until - Duration::seconds(1)));
        assert!(!cred.is_expired_at(until), "validity end is inclusive");
        assert!(cred.is_expired_at(until + Duration::milliseconds(1)));
    }
}
