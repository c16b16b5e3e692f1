use super::{CubeFace, CubeFormat, CubeTarget, Cubemap};
use crate::error::CubemapError;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use strata_core::{Runnable, Worker, WorkerBuilder, WorkerWaker};
use tracing::{debug, error, info, warn};

/// Cycle rate of the conversion worker while awake.
pub const CUBEMAP_HZ: f32 = 1.0;

/// Gamma closer to 1.0 than this marks a linear target.
const LINEAR_GAMMA_EPSILON: f32 = 1e-3;

/// Outcome of a build, handed out by [`CubemapBuilder::tick`].
#[derive(Debug)]
pub enum CubemapEvent {
    Built(Cubemap),
    Failed(CubemapError),
}

/// Faces read back from the target, waiting for conversion.
struct Staged {
    name: String,
    face_size: u32,
    format: CubeFormat,
    gamma: f32,
    faces: Result<Vec<Vec<u8>>, CubemapError>,
}

#[derive(Default)]
struct CubemapShared {
    staged: Mutex<Option<Staged>>,
    pixels_ready: AtomicBool,
    complete: AtomicBool,
    output: Mutex<Option<Result<Cubemap, CubemapError>>>,
}

struct CubemapWorker {
    shared: Arc<CubemapShared>,
}

impl Runnable for CubemapWorker {
    fn run_once(&mut self) -> ControlFlow<()> {
        let shared = &self.shared;
        if shared.complete.load(Ordering::Acquire)
            || !shared.pixels_ready.swap(false, Ordering::AcqRel)
        {
            return ControlFlow::Continue(());
        }
        if let Some(staged) = shared.staged.lock().take() {
            let result = convert(staged);
            *shared.output.lock() = Some(result);
            shared.complete.store(true, Ordering::Release);
        }
        ControlFlow::Continue(())
    }
}

/// Check the face size, swizzle LDR faces to RGBA and pack all six faces.
#[tracing::instrument(skip_all, fields(name = %staged.name, face_size = staged.face_size))]
fn convert(staged: Staged) -> Result<Cubemap, CubemapError> {
    let Staged {
        name,
        face_size,
        format,
        gamma,
        faces,
    } = staged;
    let faces = faces?;

    if !face_size.is_power_of_two() {
        return Err(CubemapError::InvalidFaceSize(face_size));
    }

    let expected = (face_size as usize).pow(2) * format.bytes_per_pixel();
    let mut data = Vec::with_capacity(expected * CubeFace::ALL.len());
    for (face, bytes) in CubeFace::ALL.into_iter().zip(&faces) {
        if bytes.len() != expected {
            return Err(CubemapError::FaceLength {
                face,
                expected,
                actual: bytes.len(),
            });
        }
        match format {
            CubeFormat::Bgra8 => {
                let pixels: &[[u8; 4]] = bytemuck::cast_slice(bytes);
                data.extend(pixels.iter().flat_map(|&[b, g, r, a]| [r, g, b, a]));
            }
            CubeFormat::Rgba16F => data.extend_from_slice(bytes),
        }
    }

    let srgb = (gamma - 1.0).abs() >= LINEAR_GAMMA_EPSILON;
    debug!("Converted cubemap ({:?}, srgb: {})", format, srgb);
    Ok(Cubemap {
        name,
        face_size,
        format,
        srgb,
        data,
    })
}

fn read_faces(
    target: &Mutex<Box<dyn CubeTarget>>,
    shared: &CubemapShared,
    waker: &WorkerWaker,
    name: String,
) {
    let staged = {
        let mut target = target.lock();
        let faces = CubeFace::ALL
            .into_iter()
            .map(|face| target.read_face(face))
            .collect::<Result<Vec<_>, _>>();
        Staged {
            name,
            face_size: target.face_size(),
            format: target.format(),
            gamma: target.gamma(),
            faces,
        }
    };
    *shared.staged.lock() = Some(staged);
    shared.pixels_ready.store(true, Ordering::Release);
    waker.wake();
}

/// Bakes cubemaps one request at a time.
///
/// The conversion worker sleeps between builds. A build wakes it only
/// once all six faces are staged, and [`CubemapBuilder::tick`] puts it
/// back to sleep when handing out the result.
pub struct CubemapBuilder {
    target: Arc<Mutex<Box<dyn CubeTarget>>>,
    shared: Arc<CubemapShared>,
    worker: Worker<CubemapWorker>,
    readback: Option<JoinHandle<()>>,
    building: bool,
}

impl CubemapBuilder {
    pub fn new(target: impl CubeTarget + 'static) -> Result<Self, CubemapError> {
        let shared = Arc::new(CubemapShared::default());
        let worker = WorkerBuilder::new("cubemap")
            .frequency(CUBEMAP_HZ)
            .start_asleep(true)
            .spawn(CubemapWorker {
                shared: Arc::clone(&shared),
            })?;
        Ok(Self {
            target: Arc::new(Mutex::new(Box::new(target))),
            shared,
            worker,
            readback: None,
            building: false,
        })
    }

    /// True from an accepted [`build`](Self::build) until its result is
    /// handed out by [`tick`](Self::tick).
    pub fn is_building(&self) -> bool {
        self.building
    }

    /// Start baking the target into a cubemap named `name`.
    ///
    /// Returns `false` without queuing when a build is already in flight.
    pub fn build(&mut self, name: impl Into<String>) -> bool {
        if self.building || !self.worker.is_sleeping() {
            return false;
        }
        self.join_readback();
        self.shared.complete.store(false, Ordering::Release);
        self.shared.pixels_ready.store(false, Ordering::Release);

        let target = Arc::clone(&self.target);
        let shared = Arc::clone(&self.shared);
        let waker = self.worker.waker();
        let name = name.into();
        debug!("Building cubemap '{}'", name);

        let spawned = thread::Builder::new()
            .name("cubemap-readback".to_string())
            .spawn(move || read_faces(&target, &shared, &waker, name));
        match spawned {
            Ok(handle) => {
                self.readback = Some(handle);
                self.building = true;
                true
            }
            Err(err) => {
                error!("Failed to spawn cubemap readback: {}", err);
                false
            }
        }
    }

    /// Hand out a finished build and put the worker back to sleep.
    pub fn tick(&mut self) -> Option<CubemapEvent> {
        if !self.shared.complete.load(Ordering::Acquire) {
            return None;
        }
        self.worker.sleep();
        self.shared.complete.store(false, Ordering::Release);
        self.building = false;
        self.join_readback();

        let output = self.shared.output.lock().take()?;
        match output {
            Ok(cubemap) => {
                info!("Cubemap '{}' built ({}px faces)", cubemap.name, cubemap.face_size);
                Some(CubemapEvent::Built(cubemap))
            }
            Err(err) => {
                warn!("Cubemap build failed: {}", err);
                Some(CubemapEvent::Failed(err))
            }
        }
    }

    /// Swap the render target. Refused during a build.
    pub fn set_target(&mut self, target: impl CubeTarget + 'static) -> bool {
        if self.building {
            return false;
        }
        *self.target.lock() = Box::new(target);
        true
    }

    /// Render the scene into the target. Refused during a build.
    pub fn capture_scene(&mut self) -> bool {
        if self.building {
            return false;
        }
        self.target.lock().capture_scene();
        true
    }

    /// Read access to the render target.
    pub fn with_target<R>(&self, f: impl FnOnce(&dyn CubeTarget) -> R) -> R {
        f(self.target.lock().as_ref())
    }

    fn join_readback(&mut self) {
        let Some(handle) = self.readback.take() else {
            return;
        };
        if handle.join().is_err() {
            error!("Cubemap readback thread panicked");
        }
    }
}

impl Drop for CubemapBuilder {
    fn drop(&mut self) {
        self.join_readback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cubemap::SimulatedCubeTarget;
    use std::time::{Duration, Instant};

    fn wait_for_event(builder: &mut CubemapBuilder) -> Option<CubemapEvent> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if let Some(event) = builder.tick() {
                return Some(event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    fn built(builder: &mut CubemapBuilder) -> Cubemap {
        match wait_for_event(builder) {
            Some(CubemapEvent::Built(cubemap)) => cubemap,
            other => panic!("expected a cubemap, got {other:?}"),
        }
    }

    #[test]
    fn test_build_swizzles_ldr_faces() {
        let mut target = SimulatedCubeTarget::new(8, CubeFormat::Bgra8);
        target.capture_scene();
        let expected = target.face_color(CubeFace::NegY);
        let mut builder = CubemapBuilder::new(target).unwrap();

        assert!(builder.build("sky"));
        let cubemap = built(&mut builder);
        assert_eq!(cubemap.name, "sky");
        assert!(cubemap.srgb);
        assert_eq!(cubemap.data.len(), 8 * 8 * 4 * 6);
        let image = cubemap.face_image(CubeFace::NegY).unwrap();
        assert_eq!(image.get_pixel(3, 5).0, expected);
        assert!(!builder.is_building());
    }

    #[test]
    fn test_build_rejected_while_in_flight() {
        let mut builder = CubemapBuilder::new(SimulatedCubeTarget::new(4, CubeFormat::Bgra8)).unwrap();
        assert!(builder.build("first"));
        assert!(!builder.build("second"));
        assert!(!builder.set_target(SimulatedCubeTarget::new(8, CubeFormat::Bgra8)));
        assert!(!builder.capture_scene());

        built(&mut builder);
        assert!(builder.capture_scene());
        assert!(builder.build("third"));
        assert_eq!(built(&mut builder).name, "third");
    }

    #[test]
    fn test_linear_hdr_target() {
        let target = SimulatedCubeTarget::new(4, CubeFormat::Rgba16F).with_gamma(1.0);
        let mut builder = CubemapBuilder::new(target).unwrap();
        assert!(builder.build("hdr"));
        let cubemap = built(&mut builder);
        assert!(!cubemap.srgb);
        assert_eq!(cubemap.face(CubeFace::PosZ).map(<[u8]>::len), Some(4 * 4 * 8));
        assert!(cubemap.face_image(CubeFace::PosZ).is_none());
    }

    #[test]
    fn test_invalid_face_size_fails() {
        let mut builder = CubemapBuilder::new(SimulatedCubeTarget::new(6, CubeFormat::Bgra8)).unwrap();
        assert!(builder.build("odd"));
        assert!(matches!(
            wait_for_event(&mut builder),
            Some(CubemapEvent::Failed(CubemapError::InvalidFaceSize(6)))
        ));
        assert!(builder.build("again"));
    }

    #[test]
    fn test_readback_failure_is_reported() {
        let mut target = SimulatedCubeTarget::new(4, CubeFormat::Bgra8);
        target.failing_face = Some(CubeFace::PosY);
        let mut builder = CubemapBuilder::new(target).unwrap();
        assert!(builder.build("broken"));
        assert!(matches!(
            wait_for_event(&mut builder),
            Some(CubemapEvent::Failed(CubemapError::Readback(CubeFace::PosY)))
        ));
    }

    #[test]
    fn test_set_target_between_builds() {
        let mut builder = CubemapBuilder::new(SimulatedCubeTarget::new(4, CubeFormat::Bgra8)).unwrap();
        assert!(builder.set_target(SimulatedCubeTarget::new(16, CubeFormat::Bgra8)));
        assert_eq!(builder.with_target(|target| target.face_size()), 16);
        assert!(builder.build("large"));
        assert_eq!(built(&mut builder).face_size, 16);
    }

    #[test]
    fn test_convert_checks_face_length() {
        let staged = Staged {
            name: "short".to_string(),
            face_size: 2,
            format: CubeFormat::Bgra8,
            gamma: 2.2,
            faces: Ok(vec![vec![0; 16], vec![0; 12], vec![0; 16], vec![0; 16], vec![0; 16], vec![0; 16]]),
        };
        assert!(matches!(
            convert(staged),
            Err(CubemapError::FaceLength {
                face: CubeFace::NegX,
                expected: 16,
                actual: 12
            })
        ));
    }
}
