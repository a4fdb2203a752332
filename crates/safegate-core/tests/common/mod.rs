#![allow(dead_code)]

use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use safegate_core::encoder::{EncoderError, FaceAnalysis, FaceAnalyzer};
use safegate_core::{Credential, FaceEncoding, ImagePayload, ENCODING_DIM};

pub const TOKEN: &str = "valid_token_123";

pub fn valid_until() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
}

pub fn captured_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap()
}

/// Reference encoding: all zeros.
pub fn reference() -> FaceEncoding {
    FaceEncoding::new(vec![0.0; ENCODING_DIM])
}

/// An encoding at exactly `distance` from [`reference`].
pub fn at_distance(distance: f64) -> FaceEncoding {
    let mut values = vec![0.0; ENCODING_DIM];
    values[0] = distance;
    FaceEncoding::new(values)
}

pub fn credential() -> Credential {
    Credential {
        id: 1,
        full_name: "Jan Kowalski".into(),
        qr_token: TOKEN.into(),
        qr_valid_until: valid_until(),
        reference_encoding: Some(reference()),
    }
}

pub fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_pixel(32, 24, Rgb([180, 150, 120]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn png_payload() -> ImagePayload {
    ImagePayload::Bytes(png_bytes())
}

pub fn png_base64() -> String {
    format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(png_bytes()))
}

/// What a [`ScriptedAnalyzer`] answers.
#[derive(Clone)]
pub enum Script {
    Faces(FaceAnalysis),
    Timeout,
    Fail,
}

/// Analyzer returning a fixed answer and counting invocations.
pub struct ScriptedAnalyzer {
    script: Mutex<Script>,
    calls: AtomicUsize,
}

impl ScriptedAnalyzer {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn single(encoding: FaceEncoding) -> Self {
        Self::new(Script::Faces(FaceAnalysis::Single(encoding)))
    }

    pub fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceAnalyzer for ScriptedAnalyzer {
    fn analyze(&self, _image: RgbImage) -> Result<FaceAnalysis, EncoderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().clone() {
            Script::Faces(analysis) => Ok(analysis),
            Script::Timeout => Err(EncoderError::Timeout(Duration::from_millis(250))),
            Script::Fail => Err(EncoderError::Unavailable("scripted failure".into())),
        }
    }
}
