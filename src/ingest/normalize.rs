use anyhow::{anyhow, Result};

use crate::frame::{rgb_len, Frame};

/// Pixel layouts a capture device may hand back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
pub(crate) enum PixelFormat {
    Rgb24,
    Nv12,
}

/// Convert a captured buffer into an RGB24 `Frame`.
#[cfg_attr(not(feature = "ingest-v4l2"), allow(dead_code))]
pub(crate) fn to_rgb_frame(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
    index: u64,
) -> Result<Frame> {
    let rgb = match format {
        PixelFormat::Rgb24 => pixels.to_vec(),
        PixelFormat::Nv12 => nv12_to_rgb(pixels, width, height)?,
    };
    Frame::new(rgb, width, height, index)
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let luma_len = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = luma_len + luma_len / 2;
    if pixels.len() != expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let (luma, chroma) = pixels.split_at(luma_len);
    let mut rgb = Vec::with_capacity(rgb_len(width, height)?);
    for row in 0..h {
        let chroma_row = &chroma[(row / 2) * w..];
        for col in 0..w {
            let y = luma[row * w + col] as f32;
            let pair = (col / 2) * 2;
            let u = chroma_row[pair] as f32 - 128.0;
            let v = chroma_row[pair + 1] as f32 - 128.0;
            rgb.push(to_u8(y + 1.402 * v));
            rgb.push(to_u8(y - 0.344_136 * u - 0.714_136 * v));
            rgb.push(to_u8(y + 1.772 * u));
        }
    }
    Ok(rgb)
}

fn to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
