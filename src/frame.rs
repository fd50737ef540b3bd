//! Frames handed from a camera source to the pipeline worker.
//!
//! - `Frame`: RGB24 pixels plus dimensions, sequence index and capture instant.
//! - Pixel bytes are private; detectors read them through `pixels()` and the
//!   renderer copies them through `to_image()`.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::path::Path;
use std::time::Instant;

/// One decoded camera frame in packed RGB24 layout.
///
/// Not `Clone`: a frame is owned by exactly one pipeline stage at a time.
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Monotonic sequence number assigned by the source (starts at 0).
    pub index: u64,

    /// Optional origin tag (file name for image sources, reference images).
    label: Option<String>,

    captured_at: Instant,
}

impl Frame {
    /// Create a frame from packed RGB24 bytes. Length must equal `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            index,
            label: None,
            captured_at: Instant::now(),
        })
    }

    pub fn from_image(image: RgbImage, index: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            index,
            label: None,
            captured_at: Instant::now(),
        }
    }

    /// Decode an image file (png/jpeg) into a frame labelled with its file name.
    pub fn open(path: &Path, index: u64) -> Result<Self> {
        let image = image::open(path)
            .with_context(|| format!("failed to decode image {}", path.display()))?
            .to_rgb8();
        let label = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        let mut frame = Self::from_image(image, index);
        frame.label = label;
        Ok(frame)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Copy of the pixels as an `image` buffer for overlay rendering.
    pub fn to_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", self.width, self.height))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("label", &self.label)
            .finish()
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
