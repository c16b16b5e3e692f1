//! Mesh model shared between the mapping engine and the application.
//!
//! The engine writes into [`Mesh`], a chunked representation where each
//! chunk can be replaced independently. The application only ever sees
//! [`MeshData`], a flattened snapshot rebuilt from the chunks.

use glam::{UVec3, Vec2, Vec3};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// A spatial subdivision of the reconstructed surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshChunk {
    pub vertices: Vec<Vec3>,
    pub triangles: Vec<UVec3>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    /// Set by the engine when the chunk changed since the last flatten.
    #[serde(skip)]
    pub updated: bool,
}

impl MeshChunk {
    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }
}

/// Channel layout requested when texturing a mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextureFormat {
    Rgb,
    #[default]
    Rgba,
}

/// What a texture is generated for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TexturingMode {
    /// Texture meant to be rendered on the mesh.
    #[default]
    Render,
    /// Texture meant to be baked into a cubemap.
    Cubemap,
}

/// Texture atlas attached to a mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshTexture {
    pub format: TextureFormat,
    pub mode: TexturingMode,
    pub image: RgbaImage,
}

/// File format used when saving a mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshFileFormat {
    #[default]
    Obj,
    Ply,
    Bin,
}

impl MeshFileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            MeshFileFormat::Obj => "obj",
            MeshFileFormat::Ply => "ply",
            MeshFileFormat::Bin => "bin",
        }
    }
}

/// How aggressively filtering simplifies the mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterIntensity {
    #[default]
    Low,
    Medium,
    High,
}

impl FilterIntensity {
    /// Fraction of triangles kept by a filter pass.
    pub fn retain_ratio(self) -> f32 {
        match self {
            FilterIntensity::Low => 1.0,
            FilterIntensity::Medium => 0.75,
            FilterIntensity::High => 0.5,
        }
    }
}

/// Parameters of a filter step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    pub intensity: FilterIntensity,
}

impl FilterParams {
    pub fn with_intensity(mut self, intensity: FilterIntensity) -> Self {
        self.intensity = intensity;
        self
    }
}

/// Chunked mesh written by the mapping engine.
#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub chunks: Vec<MeshChunk>,
    pub texture: Option<MeshTexture>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.texture = None;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(MeshChunk::is_empty)
    }

    pub fn vertex_count(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.vertices.len()).sum()
    }

    pub fn triangle_count(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.triangles.len()).sum()
    }

    /// Number of chunks changed since the last [`Mesh::flatten`].
    pub fn updated_chunks(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.updated).count()
    }

    /// Rebuild a flat snapshot from all chunks and clear their updated flags.
    ///
    /// Triangle indices are offset so they address the concatenated vertex
    /// array. UVs are only carried when every chunk has one per vertex.
    pub fn flatten(&mut self) -> MeshData {
        let vertex_count = self.vertex_count();
        let with_uvs = self
            .chunks
            .iter()
            .all(|chunk| chunk.uvs.len() == chunk.vertices.len());

        let mut data = MeshData {
            vertices: Vec::with_capacity(vertex_count),
            indices: Vec::with_capacity(self.triangle_count() * 3),
            normals: Vec::with_capacity(vertex_count),
            uvs: Vec::new(),
            texture: self.texture.clone(),
        };

        for chunk in &mut self.chunks {
            let base = data.vertices.len() as u32;
            data.vertices.extend_from_slice(&chunk.vertices);
            data.normals.extend_from_slice(&chunk.normals);
            if with_uvs {
                data.uvs.extend_from_slice(&chunk.uvs);
            }
            data.indices.extend(
                chunk
                    .triangles
                    .iter()
                    .flat_map(|triangle| (*triangle + UVec3::splat(base)).to_array()),
            );
            chunk.updated = false;
        }

        data
    }
}

/// Flattened mesh snapshot handed to the application.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vec3>,
    pub indices: Vec<u32>,
    pub normals: Vec<Vec3>,
    pub uvs: Vec<Vec2>,
    pub texture: Option<MeshTexture>,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}
