//! Camera frame sources.
//!
//! - `stub://<name>[?frames=N]`: synthetic gradient frames, endless unless
//!   `frames` caps the stream.
//! - `dir://<path>` or a plain directory path: every png/jpeg in the
//!   directory, sorted by file name, then end of stream.
//! - `/dev/video*` or `v4l2://<device>`: a local V4L2 device (feature:
//!   ingest-v4l2).
//!
//! A source is moved into the pipeline worker and dropped when the loop ends;
//! dropping it releases the device.

mod dir;
mod normalize;
mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::path::Path;

pub use dir::ImageDirSource;
#[cfg(feature = "ingest-v4l2")]
pub(crate) use normalize::{to_rgb_frame, PixelFormat};
pub use synthetic::SyntheticSource;
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::V4l2Source;

use crate::config::CameraSettings;
use crate::frame::Frame;

pub trait FrameSource: Send {
    /// Short description for logs.
    fn describe(&self) -> String;

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// `Ok(None)` is end of stream. `Err` means the camera can no longer be read.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }
}

/// Build the source named by `camera.source`.
pub fn open_source(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    let source = settings.source.trim();
    if source.is_empty() {
        return Err(anyhow!("camera source must not be empty"));
    }
    if let Some(rest) = source.strip_prefix("stub://") {
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
        let frame_limit = parse_frame_limit(query)?;
        return Ok(Box::new(SyntheticSource::new(
            name,
            settings.width,
            settings.height,
            frame_limit,
        )?));
    }
    if let Some(path) = source.strip_prefix("dir://") {
        return Ok(Box::new(ImageDirSource::new(Path::new(path))?));
    }
    if source.starts_with("/dev/video") || source.starts_with("v4l2://") {
        return open_v4l2(settings);
    }
    if source.contains("://") {
        return Err(anyhow!("unsupported camera source scheme: {}", source));
    }
    if Path::new(source).is_dir() {
        return Ok(Box::new(ImageDirSource::new(Path::new(source))?));
    }
    Err(anyhow!(
        "camera source {} is neither a directory nor a known device",
        source
    ))
}

#[cfg(feature = "ingest-v4l2")]
fn open_v4l2(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    let device = settings
        .source
        .trim()
        .strip_prefix("v4l2://")
        .unwrap_or(settings.source.trim());
    Ok(Box::new(V4l2Source::new(v4l2::V4l2Config {
        device: device.to_string(),
        target_fps: settings.target_fps,
        width: settings.width,
        height: settings.height,
    })))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_v4l2(settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "camera source {} requires the ingest-v4l2 feature",
        settings.source
    ))
}

fn parse_frame_limit(query: &str) -> Result<Option<u64>> {
    let mut limit = None;
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some(("frames", value)) => {
                let n: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("stub source frames must be an integer, got {}", value))?;
                limit = Some(n);
            }
            _ => return Err(anyhow!("unknown stub source option: {}", pair)),
        }
    }
    Ok(limit)
}
