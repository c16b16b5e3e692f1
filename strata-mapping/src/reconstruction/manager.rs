use super::worker::{ReconstructionShared, ReconstructionWorker};
use super::{MappingEvent, ReconstructionConfig, ReconstructionStep};
use crate::error::MappingError;
use crate::mapper::Mapper;
use crate::mesh::{FilterParams, MeshData, MeshFileFormat, TexturingMode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use strata_core::{Worker, WorkerBuilder};
use tracing::{info, warn};

/// Owns the reconstruction worker and relays its results.
///
/// Every method is meant for the application thread. Step requests return
/// `false` when reconstruction is not enabled.
pub struct ReconstructionManager {
    config: ReconstructionConfig,
    shared: Arc<ReconstructionShared>,
    worker: Option<Worker<ReconstructionWorker>>,
    paused: bool,
    last_poll: Option<Instant>,
}

impl ReconstructionManager {
    pub fn new(config: ReconstructionConfig) -> Self {
        Self {
            config,
            shared: Arc::new(ReconstructionShared::default()),
            worker: None,
            paused: false,
            last_poll: None,
        }
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.worker.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.is_enabled() && self.paused
    }

    /// Start the worker thread around `mapper`. The worker idles until a
    /// step is requested.
    pub fn enable(&mut self, mapper: Box<dyn Mapper>) -> Result<(), MappingError> {
        if self.is_enabled() {
            warn!("Reconstruction already enabled, ignoring new mapper");
            return Ok(());
        }
        let runnable =
            ReconstructionWorker::new(mapper, Arc::clone(&self.shared), self.config.filter_settle);
        self.worker = Some(
            WorkerBuilder::new("reconstruction")
                .frequency(self.config.frequency)
                .spawn(runnable)?,
        );
        info!("Reconstruction enabled at {} Hz", self.config.frequency);
        Ok(())
    }

    /// Join the worker and drop the mesh. Returns the engine to the caller.
    pub fn disable(&mut self) -> Option<Box<dyn Mapper>> {
        let mut worker = self.worker.take()?;
        let mapper = worker.ensure_completion().map(ReconstructionWorker::into_mapper);
        self.shared.clear();
        self.paused = false;
        self.last_poll = None;
        info!("Reconstruction disabled");
        mapper
    }

    /// Disable then enable again with a fresh engine state.
    pub fn reset(&mut self) -> Result<(), MappingError> {
        if let Some(mut mapper) = self.disable() {
            mapper.reset();
            self.enable(mapper)?;
        }
        Ok(())
    }

    /// Begin scanning.
    pub fn start(&mut self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.shared.request(ReconstructionStep::Scan);
        self.paused = false;
        true
    }

    /// Stop or resume scanning without losing the accumulated mesh.
    pub fn pause(&mut self, paused: bool) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let step = if paused {
            ReconstructionStep::None
        } else {
            ReconstructionStep::Scan
        };
        self.shared.request(step);
        self.paused = paused;
        true
    }

    /// Stop scanning and discard the mesh.
    pub fn stop(&mut self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        {
            let mut state = self.shared.step.lock();
            state.requested = ReconstructionStep::None;
            state.generation += 1;
            state.reset_requested = true;
        }
        self.paused = false;
        true
    }

    /// Replace the mesh with the one stored at `path`.
    pub fn load(&mut self, path: impl Into<PathBuf>) -> bool {
        if !self.stop() {
            return false;
        }
        self.shared.operation.lock().load_path = path.into();
        self.shared.request(ReconstructionStep::Load);
        true
    }

    pub fn save(&mut self, path: impl Into<PathBuf>, format: MeshFileFormat) -> bool {
        if !self.pause(true) {
            return false;
        }
        {
            let mut operation = self.shared.operation.lock();
            operation.save_path = path.into();
            operation.save_format = format;
        }
        self.shared.request(ReconstructionStep::Save);
        true
    }

    pub fn filter(&mut self, params: FilterParams) -> bool {
        if !self.pause(true) {
            return false;
        }
        self.shared.operation.lock().filter = params;
        self.shared.request(ReconstructionStep::Filter);
        true
    }

    /// Request a texture. Returns `true` without a new request when the
    /// worker is already texturing.
    pub fn texture(&mut self, mode: TexturingMode) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self.step() == ReconstructionStep::Texture {
            return true;
        }
        self.pause(true);
        self.shared.operation.lock().texturing = mode;
        self.shared.request(ReconstructionStep::Texture);
        true
    }

    /// Step the worker is executing.
    pub fn step(&self) -> ReconstructionStep {
        self.shared.step.lock().current
    }

    /// Step last requested by the application.
    pub fn requested_step(&self) -> ReconstructionStep {
        self.shared.step.lock().requested
    }

    pub fn vertex_count(&self) -> usize {
        self.shared.access.lock().data.vertex_count()
    }

    /// Copy of the latest published mesh.
    pub fn mesh_data(&self) -> MeshData {
        self.shared.access.lock().data.clone()
    }

    /// Collect failures and completed steps.
    ///
    /// Failures are reported on every call. Completions are polled at most
    /// once per poll interval and skipped while the worker is rebuilding
    /// the mesh.
    pub fn tick(&mut self, now: Instant) -> Vec<MappingEvent> {
        let mut events = Vec::new();

        if let Some(step) = self.shared.step.lock().failed.take() {
            events.push(MappingEvent::StepFailed(step));
        }

        let due = self
            .last_poll
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.poll_interval);
        if !due {
            return events;
        }
        self.last_poll = Some(now);

        if let Some(_updating) = self.shared.update.try_lock() {
            let mut published = self.shared.access.lock();
            let texturing = published.texturing;
            if let Some(event) = published
                .completed
                .take()
                .and_then(|step| MappingEvent::completed(step, texturing))
            {
                events.push(event);
            }
        }
        events
    }
}

impl Default for ReconstructionManager {
    fn default() -> Self {
        Self::new(ReconstructionConfig::default())
    }
}

impl Drop for ReconstructionManager {
    fn drop(&mut self) {
        let _ = self.disable();
    }
}
