use super::{CubeFace, CubeFormat};
use crate::error::CubemapError;

/// A cube render target the scene is captured into.
///
/// `read_face` is called from a readback thread, never from the
/// application thread.
pub trait CubeTarget: Send {
    /// Side of one face, in pixels.
    fn face_size(&self) -> u32;

    fn format(&self) -> CubeFormat;

    /// Display gamma the target was rendered with.
    fn gamma(&self) -> f32;

    /// Render the scene into all six faces.
    fn capture_scene(&mut self);

    /// Raw pixels of one face, row-major, in the target's format.
    fn read_face(&mut self, face: CubeFace) -> Result<Vec<u8>, CubemapError>;
}

/// Target filled with one flat color per face.
///
/// LDR faces are stored BGRA like a swapchain surface. The blue channel
/// encodes the face index and the green channel the capture count.
#[derive(Debug, Clone)]
pub struct SimulatedCubeTarget {
    pub face_size: u32,
    pub format: CubeFormat,
    pub gamma: f32,
    /// Makes `read_face` fail for this face.
    pub failing_face: Option<CubeFace>,
    captures: u32,
}

impl SimulatedCubeTarget {
    pub fn new(face_size: u32, format: CubeFormat) -> Self {
        Self {
            face_size,
            format,
            gamma: 2.2,
            failing_face: None,
            captures: 0,
        }
    }

    pub fn with_gamma(mut self, gamma: f32) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn captures(&self) -> u32 {
        self.captures
    }

    /// Color written to `face`, as RGBA.
    pub fn face_color(&self, face: CubeFace) -> [u8; 4] {
        [255, self.captures as u8, face.index() as u8 * 40, 255]
    }
}

impl CubeTarget for SimulatedCubeTarget {
    fn face_size(&self) -> u32 {
        self.face_size
    }

    fn format(&self) -> CubeFormat {
        self.format
    }

    fn gamma(&self) -> f32 {
        self.gamma
    }

    fn capture_scene(&mut self) {
        self.captures += 1;
    }

    fn read_face(&mut self, face: CubeFace) -> Result<Vec<u8>, CubemapError> {
        if self.failing_face == Some(face) {
            return Err(CubemapError::Readback(face));
        }
        let pixels = (self.face_size as usize).pow(2);
        let bytes = match self.format {
            CubeFormat::Bgra8 => {
                let [r, g, b, a] = self.face_color(face);
                [b, g, r, a].repeat(pixels)
            }
            // Half-float zeros are all-zero bytes.
            CubeFormat::Rgba16F => vec![0; pixels * CubeFormat::Rgba16F.bytes_per_pixel()],
        };
        Ok(bytes)
    }
}
