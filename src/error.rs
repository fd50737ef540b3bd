use thiserror::Error;

/// Error kinds the pipeline branches on.
///
/// Plumbing code (file IO, sqlite, decoding) stays on `anyhow`; these variants
/// exist where a caller has to decide between aborting, skipping a detection,
/// skipping a frame or ending the loop.
#[derive(Error, Debug)]
pub enum ProximityError {
    /// Fatal at startup: no usable focal length for a reference group.
    #[error("calibration failed: {0}")]
    Calibration(String),

    /// Per-detection: the distance is omitted, the detection is kept.
    #[error("invalid measurement: pixel width {pixel_width} must be positive and finite")]
    InvalidMeasurement { pixel_width: f64 },

    /// Ends the pipeline loop cleanly.
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),

    /// Logged and counted, never blocks the alert decision.
    #[error("alert sink write failed: {0}")]
    SinkWriteFailure(String),

    /// Skips the current frame; escalates after repeated failures.
    #[error("detector failure: {0}")]
    DetectorFailure(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type ProximityResult<T> = Result<T, ProximityError>;
