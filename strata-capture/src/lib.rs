//! Strata Capture - depth camera capture and frame buffering
//!
//! This crate drives a depth camera on a dedicated capture thread and hands
//! the latest frame data to consumers running at their own rate:
//!
//! - [`CaptureContext`]: the device session shared by every component
//! - [`CaptureLoop`]: grabs continuously and notifies subscribers
//! - [`MeasureBufferPool`]: depth/normal snapshots for point queries
//! - [`TextureBatch`]: double-buffered image and measure textures
//! - [`SimulatedCamera`]: a synthetic device for tests and demos
//!
//! ## Example
//!
//! ```ignore
//! use strata_capture::{CaptureContext, CaptureLoop, MeasureBufferPool, MeasureConfig};
//! use strata_capture::{SimulatedCamera, SimulatedCameraConfig};
//!
//! let context = CaptureContext::new(SimulatedCamera::new(SimulatedCameraConfig::default()));
//! let mut measures = MeasureBufferPool::new(context.clone(), MeasureConfig::default());
//! measures.enable()?;
//! let mut capture = CaptureLoop::new(context.clone());
//! capture.enable()?;
//!
//! let depth = measures.depth_at(glam::UVec2::new(10, 10))?;
//! ```

mod batch;
mod camera;
mod context;
mod error;
mod grab;
mod mat;
mod measure;
mod sim;
mod types;

pub use batch::{BATCH_SLOTS, BatchStats, TextureBatch, TextureDesc, TextureId, TrackedTexture};
pub use camera::{Camera, retrieve_texture};
pub use context::{
    CaptureContext, CaptureEvent, CaptureStats, GrabCallback, GrabOutcome, GrabSubscription,
    PlaybackState,
};
pub use error::{CaptureError, MeasureError};
pub use grab::{CaptureLoop, DEFAULT_CAPTURE_HZ};
pub use mat::{Mat, Pixel, TextureData};
pub use measure::{
    MEASURE_SLOTS, MeasureBufferPool, MeasureConfig, MeasureFrame, MeasureStats, Sample,
    viewport_to_pixel,
};
pub use sim::{SimulatedCamera, SimulatedCameraConfig};
pub use types::{ErrorCode, Measure, MemoryKind, Resolution, TextureSource, View, resolve_resolution};
