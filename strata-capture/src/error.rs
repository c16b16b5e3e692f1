//! Error types for capture and measure queries.

use crate::types::{ErrorCode, Measure};
use strata_core::WorkerError;
use thiserror::Error;

/// Errors that can occur while driving the capture device.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Subscriptions cannot change from inside a grab callback")]
    ReentrantSubscription,

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(ErrorCode),

    #[error("Device error: {0}")]
    Device(#[from] ErrorCode),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Errors returned by depth and normal point queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MeasureError {
    #[error("{0:?} retrieval is disabled")]
    Disabled(Measure),

    #[error("Pixel ({x}, {y}) is outside the {width}x{height} measure")]
    OutOfBounds {
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    },
}
