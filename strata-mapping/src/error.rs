//! Error types for reconstruction and cubemap baking.

use crate::cubemap::CubeFace;
use crate::mapper::MapperOp;
use strata_core::WorkerError;
use thiserror::Error;

/// Errors reported by a [`Mapper`](crate::Mapper) or the reconstruction
/// manager.
#[derive(Debug, Error)]
pub enum MappingError {
    #[error("No mesh is ready to retrieve")]
    NotReady,

    #[error("The mesh is empty")]
    EmptyMesh,

    #[error("Mapping engine failed to {0}")]
    Engine(MapperOp),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mesh file error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Errors raised while baking a cubemap.
#[derive(Debug, Error)]
pub enum CubemapError {
    #[error("Face size {0} is not a non-zero power of two")]
    InvalidFaceSize(u32),

    #[error("Face {face:?} holds {actual} bytes, expected {expected}")]
    FaceLength {
        face: CubeFace,
        expected: usize,
        actual: usize,
    },

    #[error("Readback of face {0:?} failed")]
    Readback(CubeFace),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}
