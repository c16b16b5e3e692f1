//! Selectors and result codes shared by the capture primitive.

use glam::UVec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of a device call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ErrorCode {
    #[error("Success")]
    Success,
    #[error("Unspecified failure")]
    Failure,
    #[error("No new frame available yet")]
    NotANewFrame,
    #[error("Camera not detected")]
    CameraNotDetected,
    #[error("Sensor not detected")]
    SensorNotDetected,
    #[error("Invalid resolution")]
    InvalidResolution,
    #[error("Insufficient USB bandwidth")]
    LowUsbBandwidth,
    #[error("Corrupted frame")]
    CorruptedFrame,
    #[error("Invalid recording file")]
    InvalidSvoFile,
    #[error("Recording failed")]
    SvoRecordingError,
    #[error("End of recording reached")]
    EndOfSvoFile,
    #[error("Camera not initialized")]
    CameraNotInitialized,
    #[error("Invalid function parameters")]
    InvalidFunctionParameters,
    #[error("Invalid function call")]
    InvalidFunctionCall,
}

impl ErrorCode {
    /// True for `Success`.
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// True for errors that mean the device is gone.
    pub fn is_disconnect(self) -> bool {
        matches!(self, ErrorCode::CameraNotDetected | ErrorCode::SensorNotDetected)
    }

    /// Convert into a `Result`, `Success` being `Ok`.
    pub fn into_result(self) -> Result<(), ErrorCode> {
        if self.is_success() { Ok(()) } else { Err(self) }
    }
}

/// Image views that can be retrieved after a grab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum View {
    Left,
    Right,
    LeftGray,
    RightGray,
    SideBySide,
    Depth,
    Confidence,
    Normals,
}

/// Per-pixel measures that can be retrieved after a grab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measure {
    Depth,
    DepthRight,
    Disparity,
    Confidence,
    Normals,
    NormalsRight,
    Xyz,
}

impl Measure {
    /// Number of `f32` channels per pixel.
    pub fn channels(self) -> u32 {
        match self {
            Measure::Depth | Measure::DepthRight | Measure::Disparity | Measure::Confidence => 1,
            Measure::Normals | Measure::NormalsRight | Measure::Xyz => 4,
        }
    }
}

/// Where a retrieved buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryKind {
    #[default]
    Host,
    Device,
}

/// Source of one tracked texture: an image view or a measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureSource {
    View(View),
    Measure(Measure),
}

/// Retrieval resolution. Zero in either axis means the native resolution.
pub type Resolution = UVec2;

/// Resolve a requested resolution against the native one.
pub fn resolve_resolution(requested: Resolution, native: Resolution) -> Resolution {
    if requested.x == 0 || requested.y == 0 {
        native
    } else {
        requested
    }
}
