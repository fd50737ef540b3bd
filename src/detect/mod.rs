mod backend;
mod backends;
mod postprocess;
mod result;

use anyhow::{anyhow, Result};

pub use backend::DetectorBackend;
pub use backends::{DetectionScript, ScriptedBackend};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use postprocess::filter_and_suppress;
pub use result::{BoundingBox, Detection};

use crate::config::{DetectorKind, DetectorSettings};

/// Build the configured detector backend.
pub fn open_backend(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.backend {
        DetectorKind::Scripted => {
            let script = match &settings.script_path {
                Some(path) => DetectionScript::load(path)?,
                None => {
                    log::warn!("scripted detector has no script; every frame will be empty");
                    DetectionScript::default()
                }
            };
            Ok(Box::new(ScriptedBackend::new(script).with_thresholds(
                settings.confidence_threshold,
                settings.nms_threshold,
            )))
        }
        DetectorKind::Tract => open_tract(settings),
    }
}

#[cfg(feature = "backend-tract")]
fn open_tract(settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    let model_path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract detector requires detector.model_path"))?;
    let labels_path = settings
        .labels_path
        .as_ref()
        .ok_or_else(|| anyhow!("tract detector requires detector.labels_path"))?;
    let backend = TractBackend::new(model_path, labels_path, settings.input_size)?
        .with_thresholds(settings.confidence_threshold, settings.nms_threshold);
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn open_tract(_settings: &DetectorSettings) -> Result<Box<dyn DetectorBackend>> {
    Err(anyhow!("tract detector requires the backend-tract feature"))
}
