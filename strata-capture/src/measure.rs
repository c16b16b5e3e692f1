//! Depth and normal snapshots for on-demand point queries.
//!
//! Every grab fills a free slot of a three-slot pool with device-side depth
//! and normal maps. A "measure" worker thread picks up the newest complete
//! slot, copies it to host memory and swaps it in as the current snapshot,
//! handing the previous snapshot back to the pool. Point queries only ever
//! read the current snapshot, so a frame whose host copy has not finished
//! is never visible.
//!
//! Queries clone the current snapshot handle under the lock and read pixels
//! after releasing it. A replaced snapshot still held by a reader keeps its
//! slot until the reader drops it.

use crate::context::{CaptureContext, GrabSubscription};
use crate::error::{CaptureError, MeasureError};
use crate::mat::{Mat, TextureData};
use crate::types::{ErrorCode, Measure, MemoryKind, TextureSource, resolve_resolution};
use glam::{IVec2, UVec2, Vec2, Vec3, Vec4};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::ops::{ControlFlow, Deref};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strata_core::{BufferPool, PoolStats, Runnable, SlotClaim, Worker, WorkerBuilder};
use tracing::{debug, info, trace, warn};

/// Slots in the measure pool.
pub const MEASURE_SLOTS: usize = 3;

/// Depth and normal maps of one frame.
#[derive(Debug, Clone)]
pub struct MeasureFrame {
    pub depth: TextureData,
    pub normals: TextureData,
    pub depth_enabled: bool,
    pub normals_enabled: bool,
}

impl MeasureFrame {
    fn empty() -> Self {
        Self {
            depth: TextureData::for_source(TextureSource::Measure(Measure::Depth)),
            normals: TextureData::for_source(TextureSource::Measure(Measure::Normals)),
            depth_enabled: false,
            normals_enabled: false,
        }
    }

    /// Placeholder served until the first frame arrives: NaN depth and
    /// zero normals.
    fn placeholder(resolution: UVec2) -> Self {
        Self {
            depth: TextureData::F32(Mat::filled(resolution, f32::NAN)),
            normals: TextureData::F32x4(Mat::filled(resolution, Vec4::ZERO)),
            depth_enabled: true,
            normals_enabled: true,
        }
    }
}

/// A value read from a snapshot, stamped with the snapshot's frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample<T> {
    pub value: T,
    pub timestamp: u64,
}

/// Measure pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureConfig {
    pub depth: bool,
    pub normals: bool,
    /// Rate of the host-copy worker. Keep it above the capture rate.
    pub refresh_hz: f32,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            depth: true,
            normals: false,
            refresh_hz: 120.0,
        }
    }
}

impl MeasureConfig {
    pub fn with_depth(mut self, enabled: bool) -> Self {
        self.depth = enabled;
        self
    }

    pub fn with_normals(mut self, enabled: bool) -> Self {
        self.normals = enabled;
        self
    }

    pub fn with_refresh_hz(mut self, refresh_hz: f32) -> Self {
        self.refresh_hz = refresh_hz;
        self
    }
}

/// Counters for one measure pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeasureStats {
    /// Grabs skipped because no slot was free.
    pub skipped: u64,
    /// Grabs whose device retrieval failed.
    pub failed: u64,
    /// Snapshots swapped in.
    pub refreshed: u64,
    pub pool: PoolStats,
}

enum Snapshot {
    Placeholder(MeasureFrame),
    Pooled(SlotClaim<MeasureFrame>),
}

impl Snapshot {
    fn timestamp(&self) -> u64 {
        match self {
            Snapshot::Placeholder(_) => 0,
            Snapshot::Pooled(claim) => claim.timestamp(),
        }
    }
}

impl Deref for Snapshot {
    type Target = MeasureFrame;

    fn deref(&self) -> &MeasureFrame {
        match self {
            Snapshot::Placeholder(frame) => frame,
            Snapshot::Pooled(claim) => claim,
        }
    }
}

struct MeasureShared {
    pool: BufferPool<MeasureFrame, MEASURE_SLOTS>,
    current: RwLock<Arc<Snapshot>>,
    /// Replaced snapshots still referenced by a query.
    retired: Mutex<Vec<Arc<Snapshot>>>,
    current_timestamp: AtomicU64,
    depth: AtomicBool,
    normals: AtomicBool,
    skipped: AtomicU64,
    failed: AtomicU64,
    refreshed: AtomicU64,
}

impl MeasureShared {
    /// Fill a free slot from the device. Runs on the capture thread.
    fn on_grab(&self, context: &CaptureContext, timestamp: u64) {
        let depth = self.depth.load(Ordering::Acquire);
        let normals = self.normals.load(Ordering::Acquire);
        if !depth && !normals {
            return;
        }

        let Some(mut claim) = self.pool.acquire_free_slot(timestamp) else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            trace!("No free measure slot for frame {}", timestamp);
            return;
        };

        claim.depth_enabled = depth;
        claim.normals_enabled = normals;
        let mut result = Ok(());
        if depth {
            result = result.and(context.retrieve(
                &mut claim.depth,
                TextureSource::Measure(Measure::Depth),
                MemoryKind::Device,
            ));
        }
        if normals {
            result = result.and(context.retrieve(
                &mut claim.normals,
                TextureSource::Measure(Measure::Normals),
                MemoryKind::Device,
            ));
        }

        let returned = match result {
            Ok(()) => self.pool.mark_write_complete(claim),
            Err(code) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Measure retrieval failed: {}", code);
                self.pool.release_slot(claim)
            }
        };
        if let Err(error) = returned {
            warn!("Measure slot not returned: {}", error);
        }
    }

    /// Copy the newest complete slot to host memory and make it current.
    fn refresh(&self) -> bool {
        let latest = self.pool.latest_complete_timestamp();
        if latest <= self.current_timestamp.load(Ordering::Acquire) {
            return false;
        }
        let Some(mut claim) = self.pool.acquire_latest_complete_slot(latest) else {
            return false;
        };

        if let Err(code) = copy_to_host(&mut claim) {
            warn!("Measure host copy failed: {}", code);
            if let Err(error) = self.pool.release_slot(claim) {
                warn!("Measure slot not returned: {}", error);
            }
            return false;
        }

        let previous = std::mem::replace(
            &mut *self.current.write(),
            Arc::new(Snapshot::Pooled(claim)),
        );
        self.current_timestamp.store(latest, Ordering::Release);
        self.refreshed.fetch_add(1, Ordering::Relaxed);
        self.retire(previous);
        true
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Hand `previous` back to the pool along with every retired snapshot
    /// no query holds anymore.
    fn retire(&self, previous: Arc<Snapshot>) {
        let mut retired = self.retired.lock();
        retired.push(previous);
        for snapshot in std::mem::take(&mut *retired) {
            match Arc::try_unwrap(snapshot) {
                Ok(Snapshot::Pooled(claim)) => {
                    if let Err(error) = self.pool.release_slot(claim) {
                        warn!("Measure slot not returned: {}", error);
                    }
                }
                Ok(Snapshot::Placeholder(_)) => {}
                Err(held) => retired.push(held),
            }
        }
    }

    /// Drop back to the placeholder and logically reset every slot.
    fn reset(&self, resolution: UVec2) {
        let previous = std::mem::replace(
            &mut *self.current.write(),
            Arc::new(Snapshot::Placeholder(MeasureFrame::placeholder(resolution))),
        );
        self.current_timestamp.store(0, Ordering::Release);
        self.retire(previous);
        self.pool.reset();
    }

    fn require(&self, measure: Measure) -> Result<(), MeasureError> {
        let enabled = match measure {
            Measure::Normals => self.normals.load(Ordering::Acquire),
            _ => self.depth.load(Ordering::Acquire),
        };
        if enabled {
            Ok(())
        } else {
            Err(MeasureError::Disabled(measure))
        }
    }
}

fn copy_to_host(frame: &mut MeasureFrame) -> Result<(), ErrorCode> {
    if frame.depth_enabled {
        if let TextureData::F32(mat) = &mut frame.depth {
            mat.sync_host_from_device()?;
        }
    }
    if frame.normals_enabled {
        if let TextureData::F32x4(mat) = &mut frame.normals {
            mat.sync_host_from_device()?;
        }
    }
    Ok(())
}

fn frame_resolution(frame: &MeasureFrame) -> UVec2 {
    if frame.depth_enabled {
        frame.depth.resolution()
    } else {
        frame.normals.resolution()
    }
}

fn read<P: Copy>(
    mat: Option<&Mat<P>>,
    enabled: bool,
    pixel: IVec2,
    missing: P,
) -> Result<P, MeasureError>
where
    P: Default + Send + Sync + 'static,
{
    let Some(mat) = mat.filter(|_| enabled) else {
        return Ok(missing);
    };
    let out_of_bounds = MeasureError::OutOfBounds {
        x: i64::from(pixel.x),
        y: i64::from(pixel.y),
        width: mat.width(),
        height: mat.height(),
    };
    if pixel.x < 0 || pixel.y < 0 {
        return Err(out_of_bounds);
    }
    mat.value(pixel.x as u32, pixel.y as u32)
        .ok_or(out_of_bounds)
}

/// Map a viewport position to measure pixel coordinates.
///
/// Linear from `[0, viewport]` to `[0, size]` and not clamped, so positions
/// outside the viewport map outside the measure.
pub fn viewport_to_pixel(position: Vec2, viewport: Vec2, size: UVec2) -> IVec2 {
    let viewport = viewport.max(Vec2::ONE);
    (position / viewport * size.as_vec2()).floor().as_ivec2()
}

struct MeasureRunnable {
    shared: Arc<MeasureShared>,
}

impl Runnable for MeasureRunnable {
    fn run_once(&mut self) -> ControlFlow<()> {
        self.shared.refresh();
        ControlFlow::Continue(())
    }
}

fn measure_resolution(context: &CaptureContext) -> UVec2 {
    resolve_resolution(context.retrieve_resolution(), context.native_resolution())
}

/// Three-slot depth/normal pool fed by the capture loop.
pub struct MeasureBufferPool {
    context: Arc<CaptureContext>,
    config: MeasureConfig,
    shared: Arc<MeasureShared>,
    subscription: Option<GrabSubscription>,
    worker: Option<Worker<MeasureRunnable>>,
}

impl MeasureBufferPool {
    pub fn new(context: Arc<CaptureContext>, config: MeasureConfig) -> Self {
        let resolution = measure_resolution(&context);
        let shared = Arc::new(MeasureShared {
            pool: BufferPool::new(|_| MeasureFrame::empty()),
            current: RwLock::new(Arc::new(Snapshot::Placeholder(MeasureFrame::placeholder(
                resolution,
            )))),
            retired: Mutex::new(Vec::new()),
            current_timestamp: AtomicU64::new(0),
            depth: AtomicBool::new(config.depth),
            normals: AtomicBool::new(config.normals),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            refreshed: AtomicU64::new(0),
        });

        Self {
            context,
            config,
            shared,
            subscription: None,
            worker: None,
        }
    }

    /// Subscribe to grabs and start the host-copy worker.
    pub fn enable(&mut self) -> Result<(), CaptureError> {
        if self.is_enabled() {
            return Ok(());
        }
        self.attach()?;
        let runnable = MeasureRunnable {
            shared: Arc::clone(&self.shared),
        };
        self.worker = Some(
            WorkerBuilder::new("measure")
                .frequency(self.config.refresh_hz)
                .spawn(runnable)?,
        );
        info!("Measure pool enabled at {} Hz", self.config.refresh_hz);
        Ok(())
    }

    /// Subscribe to grabs without starting the worker. The owner then calls
    /// [`MeasureBufferPool::refresh_now`] on its own schedule.
    pub fn attach(&mut self) -> Result<(), CaptureError> {
        if self.subscription.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let context: Weak<CaptureContext> = Arc::downgrade(&self.context);
        self.subscription = Some(self.context.subscribe(move |_, timestamp| {
            if let Some(context) = context.upgrade() {
                shared.on_grab(&context, timestamp);
            }
        })?);
        Ok(())
    }

    /// Unsubscribe, join the worker and reset the pool. Queries see the
    /// placeholder snapshot again until the pool is re-enabled.
    pub fn disable(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            if let Err(error) = self.context.unsubscribe(subscription) {
                warn!("Measure pool could not unsubscribe: {}", error);
            }
        }
        if let Some(mut worker) = self.worker.take() {
            worker.ensure_completion();
            debug!("Measure pool disabled");
        }
        self.shared.reset(measure_resolution(&self.context));
    }

    pub fn is_enabled(&self) -> bool {
        self.subscription.is_some() && self.worker.is_some()
    }

    /// Run one host-copy cycle on the calling thread.
    pub fn refresh_now(&self) -> bool {
        self.shared.refresh()
    }

    /// Toggle depth and normal retrieval.
    pub fn set_measures(&self, depth: bool, normals: bool) {
        self.shared.depth.store(depth, Ordering::Release);
        self.shared.normals.store(normals, Ordering::Release);
    }

    pub fn depth_enabled(&self) -> bool {
        self.shared.depth.load(Ordering::Acquire)
    }

    pub fn normals_enabled(&self) -> bool {
        self.shared.normals.load(Ordering::Acquire)
    }

    /// Timestamp of the current snapshot, 0 before the first frame.
    pub fn current_timestamp(&self) -> u64 {
        self.shared.current_timestamp.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> MeasureStats {
        MeasureStats {
            skipped: self.shared.skipped.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            refreshed: self.shared.refreshed.load(Ordering::Relaxed),
            pool: self.shared.pool.stats(),
        }
    }

    /// Size of the current snapshot.
    pub fn resolution(&self) -> UVec2 {
        frame_resolution(&self.shared.snapshot())
    }

    /// Depth in meters at a measure pixel.
    pub fn depth_at(&self, pixel: UVec2) -> Result<Sample<f32>, MeasureError> {
        let mut samples = self.depths_at(&[pixel])?;
        Ok(Sample {
            value: samples.value.pop().unwrap_or(f32::NAN),
            timestamp: samples.timestamp,
        })
    }

    /// Depths at several pixels, all read from the same snapshot.
    pub fn depths_at(&self, pixels: &[UVec2]) -> Result<Sample<Vec<f32>>, MeasureError> {
        self.shared.require(Measure::Depth)?;
        let current = self.shared.snapshot();
        let value = pixels
            .iter()
            .map(|pixel| {
                read(
                    current.depth.as_f32(),
                    current.depth_enabled,
                    pixel.as_ivec2(),
                    f32::NAN,
                )
            })
            .collect::<Result<_, _>>()?;
        Ok(Sample {
            value,
            timestamp: current.timestamp(),
        })
    }

    /// Unit normal at a measure pixel.
    pub fn normal_at(&self, pixel: UVec2) -> Result<Sample<Vec3>, MeasureError> {
        let mut samples = self.normals_at(&[pixel])?;
        Ok(Sample {
            value: samples.value.pop().unwrap_or(Vec3::ZERO),
            timestamp: samples.timestamp,
        })
    }

    /// Normals at several pixels, all read from the same snapshot.
    pub fn normals_at(&self, pixels: &[UVec2]) -> Result<Sample<Vec<Vec3>>, MeasureError> {
        self.shared.require(Measure::Normals)?;
        let current = self.shared.snapshot();
        let value = pixels
            .iter()
            .map(|pixel| {
                read(
                    current.normals.as_f32x4(),
                    current.normals_enabled,
                    pixel.as_ivec2(),
                    Vec4::ZERO,
                )
                .map(Vec4::truncate)
            })
            .collect::<Result<_, _>>()?;
        Ok(Sample {
            value,
            timestamp: current.timestamp(),
        })
    }

    /// Normal and depth at a pixel packed as `(nx, ny, nz, depth)`.
    pub fn depth_and_normal_at(&self, pixel: UVec2) -> Result<Sample<Vec4>, MeasureError> {
        let mut samples = self.depths_and_normals_at(&[pixel])?;
        Ok(Sample {
            value: samples.value.pop().unwrap_or(Vec4::NAN),
            timestamp: samples.timestamp,
        })
    }

    /// Normals and depths at several pixels, packed as `(nx, ny, nz, depth)`.
    pub fn depths_and_normals_at(
        &self,
        pixels: &[UVec2],
    ) -> Result<Sample<Vec<Vec4>>, MeasureError> {
        self.shared.require(Measure::Depth)?;
        self.shared.require(Measure::Normals)?;
        let current = self.shared.snapshot();
        let value = pixels
            .iter()
            .map(|pixel| -> Result<Vec4, MeasureError> {
                let pixel = pixel.as_ivec2();
                let depth = read(current.depth.as_f32(), current.depth_enabled, pixel, f32::NAN)?;
                let normal = read(
                    current.normals.as_f32x4(),
                    current.normals_enabled,
                    pixel,
                    Vec4::ZERO,
                )?;
                Ok(normal.truncate().extend(depth))
            })
            .collect::<Result<_, _>>()?;
        Ok(Sample {
            value,
            timestamp: current.timestamp(),
        })
    }

    /// Depth under a viewport position.
    pub fn depth_at_viewport(
        &self,
        position: Vec2,
        viewport: Vec2,
    ) -> Result<Sample<f32>, MeasureError> {
        self.shared.require(Measure::Depth)?;
        let current = self.shared.snapshot();
        let pixel = viewport_to_pixel(position, viewport, frame_resolution(&current));
        let value = read(current.depth.as_f32(), current.depth_enabled, pixel, f32::NAN)?;
        Ok(Sample {
            value,
            timestamp: current.timestamp(),
        })
    }

    /// Normal under a viewport position.
    pub fn normal_at_viewport(
        &self,
        position: Vec2,
        viewport: Vec2,
    ) -> Result<Sample<Vec3>, MeasureError> {
        self.shared.require(Measure::Normals)?;
        let current = self.shared.snapshot();
        let pixel = viewport_to_pixel(position, viewport, frame_resolution(&current));
        let value = read(
            current.normals.as_f32x4(),
            current.normals_enabled,
            pixel,
            Vec4::ZERO,
        )?;
        Ok(Sample {
            value: value.truncate(),
            timestamp: current.timestamp(),
        })
    }
}

impl Drop for MeasureBufferPool {
    fn drop(&mut self) {
        self.disable();
    }
}
