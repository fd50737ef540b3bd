#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::postprocess::filter_and_suppress;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

const CXYWH_OFFSET: usize = 4;

/// Tract-based backend for YOLO-family ONNX detectors.
///
/// Expects a single output of shape `[1, 4 + classes, anchors]` with
/// centre-x, centre-y, width, height in model input pixels followed by
/// per-class scores. Frames are resized (not letterboxed) to the square input.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    class_names: Vec<String>,
    input_size: u32,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model and its class-name list (one label per line).
    pub fn new<P: AsRef<Path>, L: AsRef<Path>>(
        model_path: P,
        labels_path: L,
        input_size: u32,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let labels_path = labels_path.as_ref();
        let class_names = std::fs::read_to_string(labels_path)
            .with_context(|| format!("failed to read class names {}", labels_path.display()))?
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>();
        if class_names.is_empty() {
            return Err(anyhow!("class name list {} is empty", labels_path.display()));
        }

        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            class_names,
            input_size,
            confidence_threshold: 0.4,
            nms_threshold: 0.3,
        })
    }

    pub fn with_thresholds(mut self, confidence: f32, nms: f32) -> Self {
        self.confidence_threshold = confidence;
        self.nms_threshold = nms;
        self
    }

    fn build_input(&self, frame: &Frame) -> Result<Tensor> {
        let image = frame.to_image()?;
        let resized =
            image::imageops::resize(&image, self.input_size, self.input_size, FilterType::Triangle);
        let side = self.input_size as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok(input.into_tensor())
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<Detection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let preds = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = preds.shape();
        if shape.len() != 3 || shape[1] < CXYWH_OFFSET + 1 {
            return Err(anyhow!("unexpected detector output shape {:?}", shape));
        }
        let classes = (shape[1] - CXYWH_OFFSET).min(self.class_names.len());
        let anchors = shape[2];
        let sx = frame.width as f32 / self.input_size as f32;
        let sy = frame.height as f32 / self.input_size as f32;

        let mut out = Vec::new();
        for a in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for c in 0..classes {
                let score = preds[[0, CXYWH_OFFSET + c, a]];
                if score > best.1 {
                    best = (c, score);
                }
            }
            if best.1 < self.confidence_threshold {
                continue;
            }
            let w = preds[[0, 2, a]] * sx;
            let h = preds[[0, 3, a]] * sy;
            let x = (preds[[0, 0, a]] * sx - w / 2.0).clamp(0.0, frame.width as f32);
            let y = (preds[[0, 1, a]] * sy - h / 2.0).clamp(0.0, frame.height as f32);
            out.push(Detection::new(
                self.class_names[best.0].clone(),
                best.1,
                BoundingBox::new(x, y, w, h),
            ));
        }
        Ok(filter_and_suppress(
            out,
            self.confidence_threshold,
            self.nms_threshold,
        ))
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}
