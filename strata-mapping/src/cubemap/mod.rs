//! Cubemap baking from a cube render target.
//!
//! [`CubemapBuilder`] reads the six faces of a [`CubeTarget`] on a readback
//! thread, then wakes a sleeping worker that converts them into a single
//! [`Cubemap`]. The application polls [`CubemapBuilder::tick`] for the
//! result.

mod builder;
mod target;

pub use builder::{CUBEMAP_HZ, CubemapBuilder, CubemapEvent};
pub use target::{CubeTarget, SimulatedCubeTarget};

use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// One face of a cube, in upload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CubeFace {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl CubeFace {
    pub const ALL: [CubeFace; 6] = [
        CubeFace::PosX,
        CubeFace::NegX,
        CubeFace::PosY,
        CubeFace::NegY,
        CubeFace::PosZ,
        CubeFace::NegZ,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Pixel format of a cube render target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CubeFormat {
    /// 8-bit LDR, stored BGRA by the target.
    #[default]
    Bgra8,
    /// Half-float HDR.
    Rgba16F,
}

impl CubeFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            CubeFormat::Bgra8 => 4,
            CubeFormat::Rgba16F => 8,
        }
    }

    pub fn is_hdr(self) -> bool {
        self == CubeFormat::Rgba16F
    }
}

/// A baked cubemap: six square faces stored back to back.
///
/// LDR faces are converted to RGBA8. HDR faces keep their half-float bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Cubemap {
    pub name: String,
    pub face_size: u32,
    pub format: CubeFormat,
    pub srgb: bool,
    pub data: Vec<u8>,
}

impl Cubemap {
    pub fn face_bytes(&self) -> usize {
        (self.face_size as usize).pow(2) * self.format.bytes_per_pixel()
    }

    /// Bytes of one face, or `None` if `data` is too short to hold it.
    pub fn face(&self, face: CubeFace) -> Option<&[u8]> {
        let len = self.face_bytes();
        let start = face.index().checked_mul(len)?;
        self.data.get(start..start.checked_add(len)?)
    }

    /// Decode an LDR face. Returns `None` for HDR cubemaps.
    pub fn face_image(&self, face: CubeFace) -> Option<RgbaImage> {
        if self.format.is_hdr() {
            return None;
        }
        RgbaImage::from_raw(self.face_size, self.face_size, self.face(face)?.to_vec())
    }
}
