//! Captured frame decoding: transport payload to an RGB pixel buffer.

use base64::{engine::general_purpose, Engine as _};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("empty image payload")]
    Empty,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("decoded image has no pixels ({width}x{height})")]
    ZeroSized { width: u32, height: u32 },
}

/// Image data as it arrives from the caller.
#[derive(Debug, Clone)]
pub enum ImagePayload {
    /// Encoded image file bytes (JPEG, PNG, ...).
    Bytes(Vec<u8>),
    /// Base64 text, optionally prefixed with a `data:image/...;base64,` header.
    Base64(String),
}

impl From<Vec<u8>> for ImagePayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<String> for ImagePayload {
    fn from(text: String) -> Self {
        Self::Base64(text)
    }
}

/// A decoded camera frame. Lives for one verification call.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    image: RgbImage,
}

impl CapturedFrame {
    /// Decode a payload into an RGB frame.
    pub fn decode(payload: &ImagePayload) -> Result<Self, FrameError> {
        match payload {
            ImagePayload::Bytes(bytes) => Self::from_bytes(bytes),
            ImagePayload::Base64(text) => Self::from_base64(text),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let image = image::load_from_memory(bytes)?.to_rgb8();
        if image.width() == 0 || image.height() == 0 {
            return Err(FrameError::ZeroSized {
                width: image.width(),
                height: image.height(),
            });
        }
        Ok(Self { image })
    }

    pub fn from_base64(text: &str) -> Result<Self, FrameError> {
        let bytes = general_purpose::STANDARD.decode(strip_data_url(text).trim())?;
        Self::from_bytes(&bytes)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

/// Drop a `data:<mime>;base64,` header if present.
pub fn strip_data_url(text: &str) -> &str {
    match text.split_once(',') {
        Some((header, body)) if header.starts_with("data:") => body,
        _ => text,
    }
}
