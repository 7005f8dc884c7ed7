//! Image decoding for uploaded photos.
//!
//! Everything downstream works on [`PixelGrid`]: 8-bit, 3-channel, RGB order,
//! which is the channel order the SCRFD and ArcFace ONNX exports consume.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use thiserror::Error;

const JPEG_QUALITY: u8 = 95;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("image encoding failed: {0}")]
    Encode(String),
}

/// A decoded RGB image with non-zero dimensions.
#[derive(Debug, Clone)]
pub struct PixelGrid {
    image: RgbImage,
}

impl PixelGrid {
    /// Wrap an already-decoded image. Zero-sized images are rejected.
    pub fn from_rgb(image: RgbImage) -> Result<Self, CodecError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(CodecError::InvalidImage(format!(
                "zero-dimension image ({}x{})",
                image.width(),
                image.height()
            )));
        }
        Ok(Self { image })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.image
    }
}

/// Decode an encoded image (JPEG, PNG, ...) into a [`PixelGrid`].
pub fn decode(bytes: &[u8]) -> Result<PixelGrid, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::InvalidImage("empty buffer".into()));
    }
    let decoded =
        image::load_from_memory(bytes).map_err(|e| CodecError::InvalidImage(e.to_string()))?;
    PixelGrid::from_rgb(decoded.to_rgb8())
}

/// Extract the raw bytes from a `data:<mime>;base64,<payload>` URL.
///
/// A bare base64 payload without the `data:` header is accepted as well.
pub fn decode_data_url(input: &str) -> Result<Vec<u8>, CodecError> {
    let input = input.trim();
    let payload = match input.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| CodecError::InvalidImage("data URL has no payload".into()))?;
            if !header.ends_with(";base64") {
                return Err(CodecError::InvalidImage(
                    "data URL is not base64-encoded".into(),
                ));
            }
            payload
        }
        None => input,
    };

    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| CodecError::InvalidImage(format!("bad base64 payload: {e}")))?;
    if bytes.is_empty() {
        return Err(CodecError::InvalidImage("empty data URL payload".into()));
    }
    Ok(bytes)
}

/// Re-encode a grid as JPEG.
pub fn encode_jpeg(grid: &PixelGrid) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(&grid.image)
        .map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}
