//! Scripted capture and reconstruction session.
//!
//! Opens a simulated camera, runs the capture loop with a measure pool and
//! a texture batch attached, and walks the reconstruction pipeline through
//! scan, filter, texture and save before baking a cubemap. The application
//! tick is rate limited like every worker.

use crate::config::AppConfig;
use crate::error::AppError;
use glam::UVec2;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use strata_capture::{
    CaptureContext, CaptureEvent, CaptureLoop, Measure, MeasureBufferPool, SimulatedCamera,
    TextureBatch, TextureDesc, View,
};
use strata_core::RateLimiter;
use strata_mapping::{
    CubeFormat, CubemapBuilder, CubemapEvent, FilterParams, MappingEvent, ReconstructionManager,
    ReconstructionStep, SimulatedCubeTarget, SimulatedMapper, TexturingMode,
};
use tracing::{debug, info, warn};

/// Logging configuration.
pub struct LoggingConfig {
    pub level: String,
    pub enable_tracy: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_tracy: false,
        }
    }
}

/// Where the session script currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scanning,
    Filtering,
    Texturing,
    Saving,
    Baking,
    Done,
}

/// Summary of a finished session.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub frames: u64,
    pub textures_swapped: u64,
    pub textures_dropped: u64,
    pub depth_probes: u64,
    pub mesh_vertices: usize,
    pub failed_steps: Vec<ReconstructionStep>,
    pub saved: bool,
    pub cubemap_built: bool,
    /// The script reached its end before the time limit.
    pub completed: bool,
    pub disconnected: bool,
}

/// Builder for configuring and running a session.
pub struct SessionBuilder {
    config: AppConfig,
    logging: LoggingConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.logging.level = config.log_level.clone();
        self.config = config;
        self
    }

    pub fn with_logging(mut self, config: LoggingConfig) -> Self {
        self.logging = config;
        self
    }

    /// Initialize logging, then run the session to completion.
    pub fn run(self) -> Result<SessionReport, AppError> {
        self.init_logging();
        self.build()?.run()
    }

    /// Open the device and start every component.
    pub fn build(self) -> Result<Session, AppError> {
        Session::open(self.config)
    }

    fn init_logging(&self) {
        #[cfg(feature = "tracy")]
        {
            if self.logging.enable_tracy {
                use tracing_subscriber::Layer;
                use tracing_subscriber::layer::SubscriberExt;
                use tracing_subscriber::util::SubscriberInitExt;
                tracing_subscriber::registry()
                    .with(tracing_tracy::TracyLayer::default())
                    .with(
                        tracing_subscriber::fmt::layer().with_filter(
                            tracing_subscriber::EnvFilter::try_from_default_env()
                                .unwrap_or_else(|_| self.logging.level.clone().into()),
                        ),
                    )
                    .init();
                return;
            }
        }

        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&self.logging.level)),
            )
            .with_target(false)
            .init();
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Every component of a running session.
pub struct Session {
    config: AppConfig,
    context: Arc<CaptureContext>,
    events: Receiver<CaptureEvent>,
    capture: CaptureLoop,
    measures: MeasureBufferPool,
    batch: TextureBatch,
    reconstruction: ReconstructionManager,
    cubemap: CubemapBuilder,
}

impl Session {
    fn open(config: AppConfig) -> Result<Self, AppError> {
        let camera = SimulatedCamera::new(config.camera.clone());
        let context = CaptureContext::new(camera);
        let [width, height] = config.retrieve_resolution;
        context.set_retrieve_resolution(UVec2::new(width, height));
        if config.camera.playback_frames.is_some() {
            context.set_playback_looping(true);
        }
        let events = context.events();

        let mut measures = MeasureBufferPool::new(Arc::clone(&context), config.measure);
        measures.enable()?;

        let mut batch = TextureBatch::new(Arc::clone(&context), "main");
        batch.add_texture(TextureDesc::view("left", View::Left));
        batch.add_texture(TextureDesc::measure("depth", Measure::Depth));
        batch.set_async_retrieve_enabled(config.async_textures);
        batch.attach()?;

        let mut reconstruction = ReconstructionManager::new(config.reconstruction);
        reconstruction.enable(Box::new(SimulatedMapper::new(config.mapper.clone())))?;

        let cubemap = CubemapBuilder::new(SimulatedCubeTarget::new(
            config.cubemap_face_size,
            CubeFormat::Bgra8,
        ))?;

        let mut capture = CaptureLoop::new(Arc::clone(&context)).with_frequency(config.capture_hz);
        capture.enable()?;

        Ok(Self {
            config,
            context,
            events,
            capture,
            measures,
            batch,
            reconstruction,
            cubemap,
        })
    }

    /// Run the script until it completes, the device disconnects or the
    /// time limit is reached.
    pub fn run(mut self) -> Result<SessionReport, AppError> {
        let script = self.config.script.clone();
        let started = Instant::now();
        let limit = Duration::from_secs_f32(script.max_secs.max(0.0));
        let probe_interval = Duration::from_secs_f32(script.probe_interval_secs.max(0.0));
        let mut limiter = RateLimiter::new(self.config.app_hz);
        let mut report = SessionReport::default();
        let mut phase = Phase::Scanning;
        let mut last_probe: Option<Instant> = None;

        self.reconstruction.start();
        info!("Session started, scanning for {}s", script.scan_secs);

        while phase != Phase::Done {
            limiter.start();
            let now = Instant::now();
            if now.duration_since(started) >= limit {
                warn!("Session time limit reached in {:?}", phase);
                break;
            }

            if self.drain_capture_events() {
                report.disconnected = true;
                break;
            }

            if self.batch.tick() {
                report.textures_swapped += 1;
            }

            if last_probe.is_none_or(|last| now.duration_since(last) >= probe_interval) {
                last_probe = Some(now);
                self.probe_depth(&mut report);
            }

            let events = self.reconstruction.tick(now);
            phase = self.advance(phase, now.duration_since(started), &events, &mut report);

            limiter.stop();
            if limiter.can_sleep() {
                std::thread::sleep(limiter.sleep_duration());
            }
        }

        report.completed = phase == Phase::Done;
        self.shutdown(&mut report);
        info!("Session finished: {:?}", report);
        Ok(report)
    }

    /// Returns true once the camera disconnected.
    fn drain_capture_events(&self) -> bool {
        let mut disconnected = false;
        for event in self.events.try_iter() {
            match event {
                CaptureEvent::GrabThreadEnabled(enabled) => {
                    debug!("Capture thread enabled: {}", enabled)
                }
                CaptureEvent::CameraDisconnected(code) => {
                    warn!("Camera disconnected: {}", code);
                    disconnected = true;
                }
            }
        }
        disconnected
    }

    fn probe_depth(&self, report: &mut SessionReport) {
        let center = self.measures.resolution() / 2;
        match self.measures.depth_at(center) {
            Ok(sample) => {
                report.depth_probes += 1;
                info!(
                    "Depth at {}: {:.3} m (frame {})",
                    center, sample.value, sample.timestamp
                );
            }
            Err(err) => warn!("Depth probe failed: {}", err),
        }
    }

    fn advance(
        &mut self,
        phase: Phase,
        elapsed: Duration,
        events: &[MappingEvent],
        report: &mut SessionReport,
    ) -> Phase {
        let mut failed = None;
        for event in events {
            match event {
                MappingEvent::MeshUpdated => {
                    debug!("Mesh updated: {} vertices", self.reconstruction.vertex_count())
                }
                MappingEvent::StepFailed(step) => {
                    warn!("Reconstruction step {:?} failed", step);
                    report.failed_steps.push(*step);
                    failed = Some(*step);
                }
                other => info!("Reconstruction event: {:?}", other),
            }
        }
        let happened = |wanted: MappingEvent| events.contains(&wanted);

        match phase {
            Phase::Scanning if elapsed.as_secs_f32() >= self.config.script.scan_secs => {
                let params =
                    FilterParams::default().with_intensity(self.config.script.filter_intensity);
                self.reconstruction.filter(params);
                Phase::Filtering
            }
            Phase::Filtering
                if happened(MappingEvent::MeshFiltered)
                    || failed == Some(ReconstructionStep::Filter) =>
            {
                self.reconstruction.texture(TexturingMode::Render);
                Phase::Texturing
            }
            Phase::Texturing
                if happened(MappingEvent::MeshTextured(TexturingMode::Render))
                    || failed == Some(ReconstructionStep::Texture) =>
            {
                report.mesh_vertices = self.reconstruction.vertex_count();
                self.reconstruction
                    .save(self.config.save_path.clone(), self.config.save_format);
                Phase::Saving
            }
            Phase::Saving
                if happened(MappingEvent::Saved) || failed == Some(ReconstructionStep::Save) =>
            {
                report.saved = happened(MappingEvent::Saved);
                self.cubemap.capture_scene();
                if self.cubemap.build("strata_sky") {
                    Phase::Baking
                } else {
                    warn!("Cubemap build rejected");
                    Phase::Done
                }
            }
            Phase::Baking => match self.cubemap.tick() {
                Some(CubemapEvent::Built(cubemap)) => {
                    info!(
                        "Cubemap '{}' ready: {} bytes, srgb {}",
                        cubemap.name,
                        cubemap.data.len(),
                        cubemap.srgb
                    );
                    report.cubemap_built = true;
                    Phase::Done
                }
                Some(CubemapEvent::Failed(err)) => {
                    warn!("Cubemap failed: {}", err);
                    Phase::Done
                }
                None => Phase::Baking,
            },
            other => other,
        }
    }

    fn shutdown(mut self, report: &mut SessionReport) {
        self.capture.disable();
        self.batch.detach();
        self.measures.disable();
        let _ = self.reconstruction.disable();

        let capture = self.context.stats();
        let batch = self.batch.stats();
        report.frames = capture.frames;
        report.textures_dropped = batch.dropped;
        info!(
            "Captured {} frames ({} not new, {} failures); textures {} retrieved, {} dropped",
            capture.frames, capture.not_new, capture.failures, batch.retrieved, batch.dropped
        );
    }
}
