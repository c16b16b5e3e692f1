//! Image and measure buffers with host and device copies.

use crate::types::{ErrorCode, MemoryKind, Resolution, TextureSource, View};
use glam::{UVec2, Vec4};
use image::RgbaImage;

/// Pixel element stored in a [`Mat`].
pub trait Pixel: Copy + Default + Send + Sync + 'static {}

impl<T: Copy + Default + Send + Sync + 'static> Pixel for T {}

/// A 2D buffer with separate host and device storage.
///
/// Device storage is what the camera fills when asked for
/// [`MemoryKind::Device`]; [`Mat::sync_host_from_device`] is the
/// device-to-host copy. Buffers are allocated on the first retrieval at a
/// given resolution and reused afterwards.
#[derive(Debug, Clone, Default)]
pub struct Mat<P> {
    width: u32,
    height: u32,
    host: Vec<P>,
    device: Vec<P>,
    timestamp: u64,
}

impl<P: Pixel> Mat<P> {
    /// An unallocated mat.
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            host: Vec::new(),
            device: Vec::new(),
            timestamp: 0,
        }
    }

    /// A mat with both copies filled with `value`. A resolution whose pixel
    /// count does not fit in memory yields an unallocated mat.
    pub fn filled(resolution: Resolution, value: P) -> Self {
        let Some(len) = pixel_count(resolution) else {
            return Self::new();
        };
        Self {
            width: resolution.x,
            height: resolution.y,
            host: vec![value; len],
            device: vec![value; len],
            timestamp: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn resolution(&self) -> UVec2 {
        UVec2::new(self.width, self.height)
    }

    /// True when no pixels are allocated.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Timestamp of the frame the host copy holds.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    /// Make sure `memory` holds a buffer of `resolution`.
    ///
    /// Changing the resolution drops the other copy. Returns true when an
    /// allocation happened.
    pub fn ensure(
        &mut self,
        memory: MemoryKind,
        resolution: Resolution,
    ) -> Result<bool, ErrorCode> {
        let len = pixel_count(resolution).ok_or(ErrorCode::InvalidResolution)?;
        if resolution != self.resolution() {
            self.width = resolution.x;
            self.height = resolution.y;
            self.host.clear();
            self.device.clear();
        }

        let buffer = self.storage_mut(memory);
        if buffer.len() == len {
            return Ok(false);
        }
        buffer.resize(len, P::default());
        Ok(true)
    }

    /// Pixels in `memory`, row-major.
    pub fn buffer(&self, memory: MemoryKind) -> &[P] {
        match memory {
            MemoryKind::Host => &self.host,
            MemoryKind::Device => &self.device,
        }
    }

    /// Mutable pixels in `memory`, row-major.
    pub fn buffer_mut(&mut self, memory: MemoryKind) -> &mut [P] {
        self.storage_mut(memory)
    }

    /// Copy the device buffer into the host buffer.
    pub fn sync_host_from_device(&mut self) -> Result<(), ErrorCode> {
        if self.is_empty() || pixel_count(self.resolution()) != Some(self.device.len()) {
            return Err(ErrorCode::InvalidFunctionCall);
        }
        self.host.resize(self.device.len(), P::default());
        self.host.copy_from_slice(&self.device);
        Ok(())
    }

    /// Host pixel at `(x, y)`.
    pub fn value(&self, x: u32, y: u32) -> Option<P> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let index = y as usize * self.width as usize + x as usize;
        self.host.get(index).copied()
    }

    fn storage_mut(&mut self, memory: MemoryKind) -> &mut Vec<P> {
        match memory {
            MemoryKind::Host => &mut self.host,
            MemoryKind::Device => &mut self.device,
        }
    }
}

/// Number of pixels at `resolution`, or `None` if it overflows `usize`.
fn pixel_count(resolution: Resolution) -> Option<usize> {
    (resolution.x as usize).checked_mul(resolution.y as usize)
}

/// A mat of whichever pixel type a texture source produces.
#[derive(Debug, Clone, Default)]
pub enum TextureData {
    #[default]
    Empty,
    Rgba8(Mat<[u8; 4]>),
    F32(Mat<f32>),
    F32x4(Mat<Vec4>),
}

impl TextureData {
    /// An unallocated mat of the type `source` produces.
    pub fn for_source(source: TextureSource) -> Self {
        match source {
            TextureSource::View(_) => TextureData::Rgba8(Mat::new()),
            TextureSource::Measure(measure) if measure.channels() == 1 => {
                TextureData::F32(Mat::new())
            }
            TextureSource::Measure(_) => TextureData::F32x4(Mat::new()),
        }
    }

    /// Whether this mat can hold data from `source`.
    pub fn matches(&self, source: TextureSource) -> bool {
        matches!(
            (self, Self::for_source(source)),
            (TextureData::Rgba8(_), TextureData::Rgba8(_))
                | (TextureData::F32(_), TextureData::F32(_))
                | (TextureData::F32x4(_), TextureData::F32x4(_))
        )
    }

    pub fn resolution(&self) -> UVec2 {
        match self {
            TextureData::Empty => UVec2::ZERO,
            TextureData::Rgba8(mat) => mat.resolution(),
            TextureData::F32(mat) => mat.resolution(),
            TextureData::F32x4(mat) => mat.resolution(),
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            TextureData::Empty => 0,
            TextureData::Rgba8(mat) => mat.timestamp(),
            TextureData::F32(mat) => mat.timestamp(),
            TextureData::F32x4(mat) => mat.timestamp(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let resolution = self.resolution();
        resolution.x == 0 || resolution.y == 0
    }

    pub fn as_rgba8(&self) -> Option<&Mat<[u8; 4]>> {
        match self {
            TextureData::Rgba8(mat) => Some(mat),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&Mat<f32>> {
        match self {
            TextureData::F32(mat) => Some(mat),
            _ => None,
        }
    }

    pub fn as_f32x4(&self) -> Option<&Mat<Vec4>> {
        match self {
            TextureData::F32x4(mat) => Some(mat),
            _ => None,
        }
    }

    /// Host copy of an RGBA view as an image.
    pub fn to_rgba_image(&self) -> Option<RgbaImage> {
        let mat = self.as_rgba8()?;
        let bytes: &[u8] = bytemuck::cast_slice(mat.buffer(MemoryKind::Host));
        RgbaImage::from_raw(mat.width(), mat.height(), bytes.to_vec())
    }
}

/// Whether a view is a grayscale variant.
pub fn is_gray_view(view: View) -> bool {
    matches!(view, View::LeftGray | View::RightGray)
}
