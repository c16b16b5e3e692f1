use super::ReconstructionStep;
use crate::error::MappingError;
use crate::mapper::{Mapper, MeshPoll, poll_mesh};
use crate::mesh::{FilterParams, Mesh, MeshData, MeshFileFormat, TextureFormat, TexturingMode};
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strata_core::Runnable;
use tracing::{debug, error, warn};

/// Requested and executing step. Guarded by the step lock.
#[derive(Debug, Default)]
pub(crate) struct StepState {
    /// Written by the application only.
    pub requested: ReconstructionStep,
    /// Bumped on every request so a single-shot step runs once per request.
    pub generation: u64,
    /// Written by the worker only.
    pub current: ReconstructionStep,
    /// Set by the worker, taken by the application.
    pub failed: Option<ReconstructionStep>,
    /// Stop request: reset the engine and drop the mesh.
    pub reset_requested: bool,
}

/// Parameters of the single-shot steps. Guarded by their own lock so the
/// worker never sees a half-written path.
#[derive(Debug, Clone, Default)]
pub(crate) struct Operation {
    pub load_path: PathBuf,
    pub save_path: PathBuf,
    pub save_format: MeshFileFormat,
    pub filter: FilterParams,
    pub texturing: TexturingMode,
}

/// Latest mesh snapshot and the step that produced it.
#[derive(Debug, Default)]
pub(crate) struct Published {
    pub data: MeshData,
    pub completed: Option<ReconstructionStep>,
    pub texturing: TexturingMode,
}

#[derive(Default)]
pub(crate) struct ReconstructionShared {
    pub step: Mutex<StepState>,
    pub operation: Mutex<Operation>,
    /// Held by the worker while it rebuilds a snapshot. Always taken
    /// before `access`.
    pub update: Mutex<()>,
    pub access: Mutex<Published>,
}

impl ReconstructionShared {
    pub fn request(&self, step: ReconstructionStep) {
        let mut state = self.step.lock();
        state.requested = step;
        state.generation += 1;
    }

    pub fn clear(&self) {
        *self.step.lock() = StepState::default();
        let _updating = self.update.lock();
        *self.access.lock() = Published::default();
    }
}

/// The reconstruction runnable: owns the mapping engine and the chunked mesh.
pub struct ReconstructionWorker {
    mapper: Box<dyn Mapper>,
    mesh: Mesh,
    shared: Arc<ReconstructionShared>,
    handled_generation: u64,
    filter_settle: Duration,
}

impl ReconstructionWorker {
    pub(crate) fn new(
        mapper: Box<dyn Mapper>,
        shared: Arc<ReconstructionShared>,
        filter_settle: Duration,
    ) -> Self {
        Self {
            mapper,
            mesh: Mesh::new(),
            shared,
            handled_generation: 0,
            filter_settle,
        }
    }

    /// Hand the engine back once the thread is joined.
    pub fn into_mapper(self) -> Box<dyn Mapper> {
        self.mapper
    }

    /// Copy the requested step into the current step.
    fn begin_cycle(&mut self) -> (bool, ReconstructionStep) {
        let mut state = self.shared.step.lock();
        let reset = std::mem::take(&mut state.reset_requested);

        let step = if state.requested.is_single_shot()
            && state.generation == self.handled_generation
        {
            ReconstructionStep::None
        } else {
            state.requested
        };
        if step.is_single_shot() {
            self.handled_generation = state.generation;
        }
        state.current = step;
        (reset, step)
    }

    fn run_step(&mut self, step: ReconstructionStep) {
        match step {
            ReconstructionStep::None => {}
            ReconstructionStep::Scan => match poll_mesh(self.mapper.as_mut(), &mut self.mesh) {
                MeshPoll::NotReady => {}
                MeshPoll::Retrieved => self.publish_mesh(step),
                MeshPoll::Failed => self.fail(step),
            },
            ReconstructionStep::Filter => {
                if !self.filter_settle.is_zero() {
                    std::thread::sleep(self.filter_settle);
                }
                let params = self.shared.operation.lock().filter;
                match self.mapper.filter(&mut self.mesh, &params) {
                    Ok(()) => self.publish_mesh(step),
                    Err(err) => {
                        error!("Can't filter mesh: {}", err);
                        self.fail(step);
                    }
                }
            }
            ReconstructionStep::Texture => {
                let mode = self.shared.operation.lock().texturing;
                match self
                    .mapper
                    .apply_texture(&mut self.mesh, TextureFormat::Rgba, mode)
                {
                    Ok(()) => self.publish_mesh(step),
                    Err(err) => {
                        error!("Can't texture mesh: {}", err);
                        self.fail(step);
                    }
                }
            }
            ReconstructionStep::Load => {
                let path = self.shared.operation.lock().load_path.clone();
                match self.mapper.load(&mut self.mesh, &path) {
                    Ok(()) => self.publish_mesh(step),
                    Err(err) => {
                        error!("Can't load mesh from {}: {}", path.display(), err);
                        self.fail(step);
                    }
                }
            }
            ReconstructionStep::Save => {
                let (path, format) = {
                    let operation = self.shared.operation.lock();
                    (operation.save_path.clone(), operation.save_format)
                };
                match self.save(&path, format) {
                    Ok(()) => self.publish_step(step),
                    Err(err) => {
                        error!("Can't save mesh to {}: {}", path.display(), err);
                        self.fail(step);
                    }
                }
            }
        }

        if step.is_single_shot() {
            self.shared.step.lock().current = ReconstructionStep::None;
        }
    }

    /// Saves with a texture, generating a temporary one if the mesh has none.
    fn save(&mut self, path: &Path, format: MeshFileFormat) -> Result<(), MappingError> {
        let temporary = self.mesh.texture.is_none();
        if temporary {
            let textured =
                self.mapper
                    .apply_texture(&mut self.mesh, TextureFormat::Rgba, TexturingMode::Render);
            if let Err(err) = textured {
                warn!("Saving without texture: {}", err);
            }
        }
        let saved = self.mapper.save(&self.mesh, path, format);
        if temporary {
            self.mesh.texture = None;
        }
        saved
    }

    fn reset(&mut self) {
        debug!("Resetting reconstruction");
        self.mapper.reset();
        self.mesh.clear();
        let _updating = self.shared.update.lock();
        let mut published = self.shared.access.lock();
        published.data = MeshData::default();
        published.completed = None;
    }

    fn publish_mesh(&mut self, step: ReconstructionStep) {
        let texturing = self.shared.operation.lock().texturing;
        let _updating = self.shared.update.lock();
        let data = self.mesh.flatten();
        let mut published = self.shared.access.lock();
        published.data = data;
        published.completed = Some(step);
        published.texturing = texturing;
    }

    fn publish_step(&self, step: ReconstructionStep) {
        let _updating = self.shared.update.lock();
        self.shared.access.lock().completed = Some(step);
    }

    fn fail(&self, step: ReconstructionStep) {
        self.shared.step.lock().failed = Some(step);
    }
}

impl Runnable for ReconstructionWorker {
    fn run_once(&mut self) -> ControlFlow<()> {
        let (reset, step) = self.begin_cycle();
        if reset {
            self.reset();
        }
        self.run_step(step);
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::MapperOp;
    use crate::sim::{FaultSwitch, SimulatedMapper, SimulatedMapperConfig};

    fn worker() -> (ReconstructionWorker, Arc<ReconstructionShared>, FaultSwitch) {
        let mapper = SimulatedMapper::new(SimulatedMapperConfig {
            ready_after: 1,
            ..Default::default()
        });
        let faults = mapper.faults();
        let shared = Arc::new(ReconstructionShared::default());
        let worker = ReconstructionWorker::new(Box::new(mapper), Arc::clone(&shared), Duration::ZERO);
        (worker, shared, faults)
    }

    fn current(shared: &ReconstructionShared) -> ReconstructionStep {
        shared.step.lock().current
    }

    fn take_completed(shared: &ReconstructionShared) -> Option<ReconstructionStep> {
        shared.access.lock().completed.take()
    }

    #[test]
    fn test_scan_stays_in_scan() {
        let (mut worker, shared, _) = worker();
        shared.request(ReconstructionStep::Scan);

        for _ in 0..3 {
            let _ = worker.run_once();
            assert_eq!(current(&shared), ReconstructionStep::Scan);
        }
        assert_eq!(take_completed(&shared), Some(ReconstructionStep::Scan));
        assert_eq!(shared.access.lock().data.vertex_count(), 75);
    }

    #[test]
    fn test_scan_failure_is_resumable() {
        let (mut worker, shared, faults) = worker();
        shared.request(ReconstructionStep::Scan);
        faults.set(MapperOp::Retrieve, true);
        let _ = worker.run_once();
        assert_eq!(shared.step.lock().failed.take(), Some(ReconstructionStep::Scan));
        assert_eq!(current(&shared), ReconstructionStep::Scan);

        faults.set(MapperOp::Retrieve, false);
        let _ = worker.run_once();
        assert_eq!(take_completed(&shared), Some(ReconstructionStep::Scan));
    }

    #[test]
    fn test_single_shot_runs_once_per_request() {
        let (mut worker, shared, _) = worker();
        shared.request(ReconstructionStep::Scan);
        let _ = worker.run_once();
        let triangles = shared.access.lock().data.triangle_count();

        shared.operation.lock().filter =
            FilterParams::default().with_intensity(crate::mesh::FilterIntensity::High);
        shared.request(ReconstructionStep::Filter);
        let _ = worker.run_once();
        assert_eq!(current(&shared), ReconstructionStep::None);
        assert_eq!(take_completed(&shared), Some(ReconstructionStep::Filter));
        assert_eq!(shared.access.lock().data.triangle_count(), triangles / 2);

        // The request is still Filter, but it was already handled.
        let _ = worker.run_once();
        assert_eq!(current(&shared), ReconstructionStep::None);
        assert_eq!(take_completed(&shared), None);
        assert_eq!(shared.step.lock().requested, ReconstructionStep::Filter);

        shared.request(ReconstructionStep::Filter);
        let _ = worker.run_once();
        assert_eq!(take_completed(&shared), Some(ReconstructionStep::Filter));
    }

    #[test]
    fn test_failed_save_returns_to_none() {
        let (mut worker, shared, faults) = worker();
        shared.request(ReconstructionStep::Scan);
        let _ = worker.run_once();
        let _ = take_completed(&shared);

        faults.set(MapperOp::Save, true);
        shared.operation.lock().save_path = PathBuf::from("/tmp/m.obj");
        shared.request(ReconstructionStep::Save);
        let _ = worker.run_once();

        assert_eq!(current(&shared), ReconstructionStep::None);
        assert_eq!(shared.step.lock().failed, Some(ReconstructionStep::Save));
        assert_eq!(take_completed(&shared), None);
    }

    #[test]
    fn test_save_leaves_mesh_untextured() {
        let dir = tempfile::tempdir().unwrap();
        let (mut worker, shared, _) = worker();
        shared.request(ReconstructionStep::Scan);
        let _ = worker.run_once();

        shared.operation.lock().save_path = dir.path().join("mesh.obj");
        shared.request(ReconstructionStep::Save);
        let _ = worker.run_once();

        assert_eq!(take_completed(&shared), Some(ReconstructionStep::Save));
        assert!(dir.path().join("mesh.obj").exists());
        assert!(worker.mesh.texture.is_none());
    }

    #[test]
    fn test_texture_publishes_mode() {
        let (mut worker, shared, _) = worker();
        shared.request(ReconstructionStep::Scan);
        let _ = worker.run_once();

        shared.operation.lock().texturing = TexturingMode::Cubemap;
        shared.request(ReconstructionStep::Texture);
        let _ = worker.run_once();

        let published = shared.access.lock();
        assert_eq!(published.completed, Some(ReconstructionStep::Texture));
        assert_eq!(published.texturing, TexturingMode::Cubemap);
        assert!(published.data.texture.is_some());
    }

    #[test]
    fn test_reset_clears_mesh() {
        let (mut worker, shared, _) = worker();
        shared.request(ReconstructionStep::Scan);
        let _ = worker.run_once();
        assert!(shared.access.lock().data.vertex_count() > 0);

        {
            let mut state = shared.step.lock();
            state.requested = ReconstructionStep::None;
            state.generation += 1;
            state.reset_requested = true;
        }
        let _ = worker.run_once();
        assert_eq!(shared.access.lock().data.vertex_count(), 0);
        assert!(worker.mesh.is_empty());
        assert!(!shared.step.lock().reset_requested);
    }

    #[test]
    fn test_every_step_settles() {
        let dir = tempfile::tempdir().unwrap();
        let (mut worker, shared, _) = worker();
        shared.operation.lock().save_path = dir.path().join("mesh.obj");
        shared.operation.lock().load_path = dir.path().join("mesh.obj");

        let steps = [
            ReconstructionStep::Scan,
            ReconstructionStep::Filter,
            ReconstructionStep::Texture,
            ReconstructionStep::Save,
            ReconstructionStep::Load,
            ReconstructionStep::None,
        ];
        for from in steps {
            for to in steps {
                shared.request(from);
                let _ = worker.run_once();
                shared.request(to);
                let _ = worker.run_once();
                let _ = worker.run_once();
                let expected = if to == ReconstructionStep::Scan {
                    ReconstructionStep::Scan
                } else {
                    ReconstructionStep::None
                };
                assert_eq!(current(&shared), expected, "{from:?} -> {to:?}");
            }
        }
    }
}
