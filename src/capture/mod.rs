//! Camera collaborator seam.
//!
//! The camera head is driven through the [`Camera`] trait: lifecycle and
//! acquisition calls are owned by the grab loop, while [`Camera::convert`]
//! may be invoked concurrently by the fan-out workers for distinct sensors
//! of the same frame. A vendor-backed driver and the bundled simulator plug
//! in at the same seam.

pub mod frame;
pub mod sim;

pub use frame::{DataFormat, FrameMetadata, PixelFormat, RawFrame, SensorImage};
pub use sim::SimCamera;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of sensors in a camera head.
pub const NUM_SENSORS: usize = 6;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera transmission is not started")]
    NotStarted,

    #[error("grab timed out after {0:?}")]
    Timeout(Duration),

    #[error("camera disconnected")]
    Disconnected,

    #[error("sensor index {0} out of range")]
    BadSensor(usize),

    #[error("conversion failed on sensor {sensor}: {reason}")]
    Conversion { sensor: usize, reason: String },

    #[error("data format {0:?} is not supported by this camera")]
    UnsupportedFormat(DataFormat),

    #[error("worker task failed: {0}")]
    Task(String),
}

impl CaptureError {
    /// Transient failures are retried by the grab loop; everything else
    /// tears the loop down.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Timeout(_))
    }
}

/// Device identity reported by the head.
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub serial: u32,
    pub model: String,
}

/// Demosaicing method requested from the camera's color pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorMethod {
    NearestNeighborFast,
    EdgeSensing,
    Rigorous,
    Downsample4,
}

pub trait Camera: Send + Sync {
    fn info(&self) -> CameraInfo;

    /// Begin streaming in the given raw transfer format.
    fn start(&self, format: DataFormat) -> Result<(), CaptureError>;

    fn stop(&self) -> Result<(), CaptureError>;

    fn set_grab_timeout(&self, timeout: Duration);

    fn set_color_processing(&self, method: ColorMethod);

    /// Block until the next frame is available or the grab timeout elapses.
    fn grab(&self) -> Result<RawFrame, CaptureError>;

    /// Convert one sensor's plane of `frame` into `out` (the target sensor
    /// and pixel format are carried by `out`). Safe to call concurrently
    /// for distinct sensors.
    fn convert(&self, frame: &RawFrame, out: &mut SensorImage) -> Result<(), CaptureError>;
}
