use anyhow::Result;

use super::FrameSource;
use crate::frame::{rgb_len, Frame};

/// Synthetic gradient frames for tests and demos (`stub://`).
pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_limit: Option<u64>,
    frame_count: u64,
    /// Shifts the gradient every 50 frames so snapshots visibly change.
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(name: &str, width: u32, height: u32, frame_limit: Option<u64>) -> Result<Self> {
        rgb_len(width, height)?;
        Ok(Self {
            name: name.to_string(),
            width,
            height,
            frame_limit,
            frame_count: 0,
            scene_state: 0,
        })
    }

    fn generate_pixels(&mut self) -> Result<Vec<u8>> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; rgb_len(self.width, self.height)?];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / 3 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        Ok(pixels)
    }
}

impl FrameSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("stub://{} ({}x{}, synthetic)", self.name, self.width, self.height)
    }

    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {}", self.describe());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.frame_limit.is_some_and(|limit| self.frame_count >= limit) {
            return Ok(None);
        }
        let pixels = self.generate_pixels()?;
        let frame = Frame::new(pixels, self.width, self.height, self.frame_count)?;
        self.frame_count += 1;
        Ok(Some(frame))
    }
}
