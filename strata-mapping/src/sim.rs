//! A synthetic mapping engine for tests and demos.
//!
//! [`SimulatedMapper`] grows a flat, slightly rippled grid surface one
//! chunk per retrieved update. Meshes are persisted as JSON whatever the
//! requested file format, and any operation can be made to fail through a
//! [`FaultSwitch`] shared with the test or application.

use crate::error::MappingError;
use crate::mapper::{Mapper, MapperOp};
use crate::mesh::{
    FilterParams, Mesh, MeshChunk, MeshFileFormat, MeshTexture, TextureFormat, TexturingMode,
};
use glam::{UVec3, Vec2, Vec3};
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Shape of the simulated surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedMapperConfig {
    /// Quads per chunk side.
    pub chunk_cells: u32,
    /// Chunks per grid row.
    pub grid_width: u32,
    /// Growth stops after this many chunks.
    pub max_chunks: usize,
    /// Requests needed before an update is ready.
    pub ready_after: u32,
    /// Distance between grid vertices, in meters.
    pub spacing: f32,
    /// Side of the generated texture atlas, in pixels.
    pub texture_size: u32,
}

impl Default for SimulatedMapperConfig {
    fn default() -> Self {
        Self {
            chunk_cells: 4,
            grid_width: 4,
            max_chunks: 16,
            ready_after: 2,
            spacing: 0.05,
            texture_size: 64,
        }
    }
}

/// Shared set of operations that should fail.
#[derive(Debug, Clone, Default)]
pub struct FaultSwitch {
    faults: Arc<Mutex<HashSet<MapperOp>>>,
}

impl FaultSwitch {
    pub fn set(&self, op: MapperOp, failing: bool) {
        let mut faults = self.faults.lock();
        if failing {
            faults.insert(op);
        } else {
            faults.remove(&op);
        }
    }

    pub fn is_failing(&self, op: MapperOp) -> bool {
        self.faults.lock().contains(&op)
    }

    fn check(&self, op: MapperOp) -> Result<(), MappingError> {
        if self.is_failing(op) {
            Err(MappingError::Engine(op))
        } else {
            Ok(())
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MeshFile {
    format: MeshFileFormat,
    chunks: Vec<MeshChunk>,
}

/// Deterministic in-memory mapping engine.
pub struct SimulatedMapper {
    config: SimulatedMapperConfig,
    faults: FaultSwitch,
    chunks: Vec<MeshChunk>,
    pending: bool,
    requests: u32,
}

impl SimulatedMapper {
    pub fn new(config: SimulatedMapperConfig) -> Self {
        Self {
            config,
            faults: FaultSwitch::default(),
            chunks: Vec::new(),
            pending: false,
            requests: 0,
        }
    }

    /// Handle toggling failures of this engine.
    pub fn faults(&self) -> FaultSwitch {
        self.faults.clone()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    fn build_chunk(&self, index: usize) -> MeshChunk {
        let cells = self.config.chunk_cells.max(1);
        let grid_width = self.config.grid_width.max(1) as usize;
        let side = cells + 1;
        let spacing = self.config.spacing;
        let origin = Vec2::new(
            (index % grid_width) as f32,
            (index / grid_width) as f32,
        ) * cells as f32
            * spacing;

        let mut chunk = MeshChunk {
            updated: true,
            ..Default::default()
        };
        for row in 0..side {
            for col in 0..side {
                let xy = origin + Vec2::new(col as f32, row as f32) * spacing;
                let ripple = 0.01 * (xy.x * 10.0).sin() * (xy.y * 10.0).cos();
                chunk.vertices.push(xy.extend(1.5 + ripple));
                chunk.normals.push(Vec3::NEG_Z);
            }
        }
        for row in 0..cells {
            for col in 0..cells {
                let top_left = row * side + col;
                let bottom_left = top_left + side;
                chunk
                    .triangles
                    .push(UVec3::new(top_left, top_left + 1, bottom_left));
                chunk
                    .triangles
                    .push(UVec3::new(bottom_left, top_left + 1, bottom_left + 1));
            }
        }
        chunk
    }

    fn texture_image(&self) -> RgbaImage {
        let size = self.config.texture_size.max(1);
        RgbaImage::from_fn(size, size, |x, y| {
            let u = (x * 255 / size) as u8;
            let v = (y * 255 / size) as u8;
            Rgba([u, v, 128, 255])
        })
    }
}

impl Default for SimulatedMapper {
    fn default() -> Self {
        Self::new(SimulatedMapperConfig::default())
    }
}

impl Mapper for SimulatedMapper {
    fn request_mesh_async(&mut self) {
        if !self.pending {
            self.pending = true;
            self.requests = 0;
        }
        self.requests += 1;
    }

    fn is_mesh_ready(&self) -> bool {
        self.pending && self.requests >= self.config.ready_after
    }

    fn retrieve_mesh_async(&mut self, mesh: &mut Mesh) -> Result<(), MappingError> {
        if !self.is_mesh_ready() {
            return Err(MappingError::NotReady);
        }
        self.pending = false;
        self.faults.check(MapperOp::Retrieve)?;

        if self.chunks.len() < self.config.max_chunks {
            let chunk = self.build_chunk(self.chunks.len());
            self.chunks.push(chunk);
        }

        // Only chunks the engine changed are copied over.
        mesh.chunks.resize_with(self.chunks.len(), MeshChunk::default);
        for (local, source) in mesh.chunks.iter_mut().zip(self.chunks.iter_mut()) {
            if source.updated {
                *local = source.clone();
                source.updated = false;
            }
        }
        debug!("Retrieved mesh with {} chunks", mesh.chunks.len());
        Ok(())
    }

    fn filter(&mut self, mesh: &mut Mesh, params: &FilterParams) -> Result<(), MappingError> {
        self.faults.check(MapperOp::Filter)?;
        if mesh.is_empty() {
            return Err(MappingError::EmptyMesh);
        }
        let ratio = params.intensity.retain_ratio();
        for chunk in &mut mesh.chunks {
            let keep = (chunk.triangles.len() as f32 * ratio).ceil() as usize;
            chunk.triangles.truncate(keep);
            chunk.updated = true;
        }
        debug!(
            "Filtered mesh ({:?}): {} triangles left",
            params.intensity,
            mesh.triangle_count()
        );
        Ok(())
    }

    fn apply_texture(
        &mut self,
        mesh: &mut Mesh,
        format: TextureFormat,
        mode: TexturingMode,
    ) -> Result<(), MappingError> {
        self.faults.check(MapperOp::Texture)?;
        if mesh.is_empty() {
            return Err(MappingError::EmptyMesh);
        }

        let (min, max) = mesh
            .chunks
            .iter()
            .flat_map(|chunk| chunk.vertices.iter())
            .fold((Vec2::MAX, Vec2::MIN), |(min, max), vertex| {
                (min.min(vertex.truncate()), max.max(vertex.truncate()))
            });
        let extent = (max - min).max(Vec2::splat(f32::EPSILON));
        for chunk in &mut mesh.chunks {
            chunk.uvs = chunk
                .vertices
                .iter()
                .map(|vertex| (vertex.truncate() - min) / extent)
                .collect();
            chunk.updated = true;
        }

        mesh.texture = Some(MeshTexture {
            format,
            mode,
            image: self.texture_image(),
        });
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    fn save(
        &mut self,
        mesh: &Mesh,
        path: &Path,
        format: MeshFileFormat,
    ) -> Result<(), MappingError> {
        self.faults.check(MapperOp::Save)?;
        if mesh.is_empty() {
            return Err(MappingError::EmptyMesh);
        }
        let writer = BufWriter::new(File::create(path)?);
        let file = MeshFile {
            format,
            chunks: mesh.chunks.clone(),
        };
        serde_json::to_writer(writer, &file)?;
        info!(
            "Saved mesh ({} triangles) as {:?}",
            mesh.triangle_count(),
            format
        );
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    fn load(&mut self, mesh: &mut Mesh, path: &Path) -> Result<(), MappingError> {
        self.faults.check(MapperOp::Load)?;
        let reader = BufReader::new(File::open(path)?);
        let file: MeshFile = serde_json::from_reader(reader)?;

        mesh.clear();
        mesh.chunks = file.chunks;
        for chunk in &mut mesh.chunks {
            chunk.updated = true;
        }
        self.chunks = mesh.chunks.clone();
        self.pending = false;
        info!("Loaded mesh with {} chunks", mesh.chunks.len());
        Ok(())
    }

    fn reset(&mut self) {
        self.chunks.clear();
        self.pending = false;
        self.requests = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{MeshPoll, poll_mesh};

    fn scanned(chunks: usize) -> (SimulatedMapper, Mesh) {
        let mut mapper = SimulatedMapper::new(SimulatedMapperConfig {
            ready_after: 1,
            ..Default::default()
        });
        let mut mesh = Mesh::new();
        for _ in 0..chunks {
            assert_eq!(poll_mesh(&mut mapper, &mut mesh), MeshPoll::Retrieved);
        }
        (mapper, mesh)
    }

    #[test]
    fn test_mesh_ready_after_requests() {
        let mut mapper = SimulatedMapper::default();
        let mut mesh = Mesh::new();
        assert_eq!(poll_mesh(&mut mapper, &mut mesh), MeshPoll::NotReady);
        assert_eq!(poll_mesh(&mut mapper, &mut mesh), MeshPoll::Retrieved);
        assert_eq!(mesh.chunks.len(), 1);
        assert_eq!(mesh.vertex_count(), 25);
        assert_eq!(mesh.triangle_count(), 32);
    }

    #[test]
    fn test_growth_stops_at_max_chunks() {
        let (mapper, mesh) = scanned(20);
        assert_eq!(mapper.chunk_count(), 16);
        assert_eq!(mesh.chunks.len(), 16);
    }

    #[test]
    fn test_retrieve_fault() {
        let (mut mapper, mut mesh) = scanned(1);
        mapper.faults().set(MapperOp::Retrieve, true);
        assert_eq!(poll_mesh(&mut mapper, &mut mesh), MeshPoll::Failed);
        mapper.faults().set(MapperOp::Retrieve, false);
        assert_eq!(poll_mesh(&mut mapper, &mut mesh), MeshPoll::Retrieved);
    }

    #[test]
    fn test_filter_drops_triangles() {
        let (mut mapper, mut mesh) = scanned(2);
        let before = mesh.triangle_count();
        let params = FilterParams::default().with_intensity(crate::mesh::FilterIntensity::High);
        mapper.filter(&mut mesh, &params).unwrap();
        assert_eq!(mesh.triangle_count(), before / 2);
    }

    #[test]
    fn test_filter_empty_mesh_fails() {
        let mut mapper = SimulatedMapper::default();
        let mut mesh = Mesh::new();
        assert!(matches!(
            mapper.filter(&mut mesh, &FilterParams::default()),
            Err(MappingError::EmptyMesh)
        ));
    }

    #[test]
    fn test_texture_assigns_uvs() {
        let (mut mapper, mut mesh) = scanned(3);
        mapper
            .apply_texture(&mut mesh, TextureFormat::Rgba, TexturingMode::Render)
            .unwrap();
        let data = mesh.flatten();
        assert_eq!(data.uvs.len(), data.vertices.len());
        assert!(data.uvs.iter().all(|uv| uv.cmpge(Vec2::ZERO).all() && uv.cmple(Vec2::ONE).all()));
        assert_eq!(data.texture.map(|texture| texture.image.width()), Some(64));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.obj");
        let (mut mapper, mesh) = scanned(3);
        mapper.save(&mesh, &path, MeshFileFormat::Obj).unwrap();

        let mut other = SimulatedMapper::default();
        let mut loaded = Mesh::new();
        other.load(&mut loaded, &path).unwrap();
        assert_eq!(loaded.triangle_count(), mesh.triangle_count());
        assert_eq!(other.chunk_count(), 3);
        assert_eq!(loaded.updated_chunks(), 3);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut mapper = SimulatedMapper::default();
        let mut mesh = Mesh::new();
        assert!(matches!(
            mapper.load(&mut mesh, &dir.path().join("missing.obj")),
            Err(MappingError::Io(_))
        ));
    }

    #[test]
    fn test_reset_restarts_growth() {
        let (mut mapper, mut mesh) = scanned(4);
        mapper.reset();
        assert_eq!(mapper.chunk_count(), 0);
        mesh.clear();
        assert_eq!(poll_mesh(&mut mapper, &mut mesh), MeshPoll::Retrieved);
        assert_eq!(mesh.chunks.len(), 1);
    }
}
