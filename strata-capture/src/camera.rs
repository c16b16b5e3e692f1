//! The capture primitive implemented by depth camera backends.

use crate::mat::{Mat, TextureData};
use crate::types::{ErrorCode, Measure, MemoryKind, Resolution, TextureSource, View};

/// A depth camera backend.
///
/// Every call may block on hardware I/O. Implementations are driven from
/// the capture thread and from grab callbacks, always through the device
/// lock of a [`crate::CaptureContext`].
pub trait Camera: Send {
    /// Capture one frame.
    fn grab(&mut self) -> ErrorCode;

    /// Timestamp of the last grabbed frame, in nanoseconds.
    fn timestamp(&self) -> u64;

    /// Resolution the sensor produces.
    fn native_resolution(&self) -> Resolution;

    /// Copy an image view of the last frame into `target`.
    fn retrieve_image(
        &mut self,
        target: &mut Mat<[u8; 4]>,
        view: View,
        memory: MemoryKind,
        resolution: Resolution,
    ) -> Result<(), ErrorCode>;

    /// Copy a measure of the last frame into `target`.
    ///
    /// `target` must hold the pixel type the measure produces.
    fn retrieve_measure(
        &mut self,
        target: &mut TextureData,
        measure: Measure,
        memory: MemoryKind,
        resolution: Resolution,
    ) -> Result<(), ErrorCode>;

    /// Number of frames in a recording, `None` for live devices.
    fn playback_len(&self) -> Option<usize> {
        None
    }

    /// Index of the last frame read from a recording.
    fn playback_position(&self) -> Option<usize> {
        None
    }

    /// Make the next grab read recording frame `position`.
    fn set_playback_position(&mut self, _position: usize) {}

    /// Append the last grabbed frame to the active recording.
    fn record_frame(&mut self) -> Result<(), ErrorCode> {
        Err(ErrorCode::InvalidFunctionCall)
    }
}

/// Retrieve `source` into `target`, allocating the right mat type first.
pub fn retrieve_texture(
    camera: &mut dyn Camera,
    target: &mut TextureData,
    source: TextureSource,
    memory: MemoryKind,
    resolution: Resolution,
) -> Result<(), ErrorCode> {
    if !target.matches(source) {
        *target = TextureData::for_source(source);
    }

    match source {
        TextureSource::View(view) => match target {
            TextureData::Rgba8(mat) => camera.retrieve_image(mat, view, memory, resolution),
            _ => Err(ErrorCode::InvalidFunctionParameters),
        },
        TextureSource::Measure(measure) => {
            camera.retrieve_measure(target, measure, memory, resolution)
        }
    }
}
