//! Fixtures shared by the unit tests.

use crate::codec::PixelGrid;
use crate::extractor::{ExtractorError, FaceExtractor};
use crate::types::{DetectedFace, Embedding};
use faceprint_store::{MemoryObjectStore, ObjectEntry, ObjectStore, StoreError};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn solid_png(width: u32, height: u32, rgb: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(rgb));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

pub fn solid_grid(rgb: [u8; 3]) -> PixelGrid {
    PixelGrid::from_rgb(RgbImage::from_pixel(8, 8, Rgb(rgb))).unwrap()
}

/// Fake extractor: a black image has no face, any other image yields one
/// face whose embedding is the colour of its top-left pixel.
///
/// Colours survive a JPEG round trip closely enough for the tests that
/// re-extract uploaded baseline images.
#[derive(Default)]
pub struct ColorExtractor {
    pub calls: usize,
}

impl FaceExtractor for ColorExtractor {
    fn extract(&mut self, grid: &PixelGrid) -> Result<Vec<DetectedFace>, ExtractorError> {
        self.calls += 1;
        let [r, g, b] = grid.as_rgb().get_pixel(0, 0).0;
        if r < 8 && g < 8 && b < 8 {
            return Ok(Vec::new());
        }
        Ok(vec![
            DetectedFace {
                embedding: Embedding::new(vec![-(r as f32), -(g as f32), -(b as f32)]),
                confidence: 0.3,
                bbox: None,
            },
            DetectedFace {
                embedding: Embedding::new(vec![r as f32, g as f32, b as f32]),
                confidence: 0.9,
                bbox: None,
            },
        ])
    }
}

/// Extractor whose engine never came up.
pub struct UnavailableExtractor;

impl FaceExtractor for UnavailableExtractor {
    fn extract(&mut self, _grid: &PixelGrid) -> Result<Vec<DetectedFace>, ExtractorError> {
        Err(ExtractorError::EngineUnavailable("model weights missing".into()))
    }
}

/// Memory store that counts calls and can refuse writes to matching keys.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryObjectStore,
    pub gets: AtomicUsize,
    pub lists: AtomicUsize,
    pub fail_puts_containing: Option<String>,
    pub fail_lists: bool,
}

impl RecordingStore {
    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }
}

impl ObjectStore for RecordingStore {
    fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<(), StoreError> {
        if let Some(pattern) = &self.fail_puts_containing {
            if key.contains(pattern.as_str()) {
                return Err(StoreError::Io {
                    key: key.to_string(),
                    source: std::io::Error::other("disk full"),
                });
            }
        }
        self.inner.put(key, bytes, content_type)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StoreError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists {
            return Err(StoreError::Io {
                key: prefix.to_string(),
                source: std::io::Error::other("listing refused"),
            });
        }
        self.inner.list(prefix)
    }

    fn sign(&self, key: &str) -> Result<String, StoreError> {
        self.inner.sign(key)
    }
}
