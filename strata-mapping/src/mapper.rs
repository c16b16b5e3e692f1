//! The mesh primitive driven by the reconstruction worker.

use crate::error::MappingError;
use crate::mesh::{FilterParams, Mesh, MeshFileFormat, TextureFormat, TexturingMode};
use std::fmt;
use std::path::Path;

/// Operations of a [`Mapper`], used to report which one failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MapperOp {
    Retrieve,
    Filter,
    Texture,
    Save,
    Load,
}

impl fmt::Display for MapperOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self {
            MapperOp::Retrieve => "retrieve the mesh",
            MapperOp::Filter => "filter the mesh",
            MapperOp::Texture => "texture the mesh",
            MapperOp::Save => "save the mesh",
            MapperOp::Load => "load the mesh",
        };
        f.write_str(action)
    }
}

/// Result of one scan poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshPoll {
    /// The engine has not produced a new mesh yet.
    NotReady,
    /// A new mesh was retrieved into the local copy.
    Retrieved,
    /// The engine had a mesh but retrieving it failed.
    Failed,
}

/// A spatial mapping engine.
///
/// Every call may block on the engine. The reconstruction worker is the
/// only caller, always from its own thread.
pub trait Mapper: Send {
    /// Ask the engine to start building a mesh update if none is pending.
    fn request_mesh_async(&mut self);

    /// True once the requested update can be retrieved.
    fn is_mesh_ready(&self) -> bool;

    /// Copy the pending update into `mesh`.
    fn retrieve_mesh_async(&mut self, mesh: &mut Mesh) -> Result<(), MappingError>;

    fn filter(&mut self, mesh: &mut Mesh, params: &FilterParams) -> Result<(), MappingError>;

    fn apply_texture(
        &mut self,
        mesh: &mut Mesh,
        format: TextureFormat,
        mode: TexturingMode,
    ) -> Result<(), MappingError>;

    fn save(&mut self, mesh: &Mesh, path: &Path, format: MeshFileFormat)
    -> Result<(), MappingError>;

    fn load(&mut self, mesh: &mut Mesh, path: &Path) -> Result<(), MappingError>;

    /// Discard everything the engine accumulated.
    fn reset(&mut self);
}

/// One scan increment: request, check, retrieve.
pub fn poll_mesh(mapper: &mut dyn Mapper, mesh: &mut Mesh) -> MeshPoll {
    mapper.request_mesh_async();
    if !mapper.is_mesh_ready() {
        return MeshPoll::NotReady;
    }
    match mapper.retrieve_mesh_async(mesh) {
        Ok(()) => MeshPoll::Retrieved,
        Err(err) => {
            tracing::error!("Can't retrieve mesh: {}", err);
            MeshPoll::Failed
        }
    }
}
