//! Overlay rendering for published snapshots.
//!
//! Boxes are drawn in a six-colour palette keyed by class label; measured
//! detections get a black badge at their anchor where the distance text sits.
//! Text itself travels in the snapshot JSON, so no font is rasterised here.

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::frame::Frame;
use crate::processor::AnnotatedDetection;

pub const PALETTE: [Rgb<u8>; 6] = [
    Rgb([0, 0, 255]),
    Rgb([255, 0, 255]),
    Rgb([255, 255, 0]),
    Rgb([0, 255, 255]),
    Rgb([0, 255, 0]),
    Rgb([0, 0, 255]),
];

const BADGE_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const BADGE_WIDTH: u32 = 150;
const BADGE_HEIGHT: u32 = 26;
const BADGE_LIFT: i32 = 3;
const BOX_THICKNESS: i32 = 2;
const JPEG_QUALITY: u8 = 80;

/// Stable colour for a class label.
pub fn class_color(class_label: &str) -> Rgb<u8> {
    let hash = class_label
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    PALETTE[hash as usize % PALETTE.len()]
}

pub fn render_overlay(frame: &Frame, detections: &[AnnotatedDetection]) -> Result<RgbImage> {
    let mut image = frame.to_image()?;
    for det in detections {
        let bbox = &det.detection.bbox;
        let width = bbox.width.round() as i64;
        let height = bbox.height.round() as i64;
        if width <= 0 || height <= 0 {
            continue;
        }
        let color = class_color(det.class_label());
        for inset in 0..BOX_THICKNESS {
            let w = width - 2 * inset as i64;
            let h = height - 2 * inset as i64;
            if w <= 0 || h <= 0 {
                break;
            }
            let rect = Rect::at(bbox.x.round() as i32 + inset, bbox.y.round() as i32 + inset)
                .of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut image, rect, color);
        }

        if det.distance.is_some() {
            let badge = Rect::at(
                det.anchor.x.round() as i32,
                det.anchor.y.round() as i32 - BADGE_LIFT,
            )
            .of_size(BADGE_WIDTH, BADGE_HEIGHT);
            draw_filled_rect_mut(&mut image, badge, BADGE_COLOR);
        }
    }
    Ok(image)
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(image)
        .context("failed to encode overlay as JPEG")?;
    Ok(out)
}
