//! The capture loop: grabs frames on a dedicated thread.

use crate::context::{CaptureContext, CaptureEvent, GrabOutcome};
use crate::error::CaptureError;
use crate::types::ErrorCode;
use std::ops::ControlFlow;
use std::sync::Arc;
use strata_core::{Runnable, Worker, WorkerBuilder, WorkerState};
use tracing::info;

/// Default capture rate. Devices slower than this simply block in `grab`.
pub const DEFAULT_CAPTURE_HZ: f32 = 1000.0;

struct GrabRunnable {
    context: Arc<CaptureContext>,
}

impl Runnable for GrabRunnable {
    fn on_start(&mut self) {
        self.context.broadcast(CaptureEvent::GrabThreadEnabled(true));
    }

    fn run_once(&mut self) -> ControlFlow<()> {
        match self.context.grab_once() {
            GrabOutcome::Disconnected(_) => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }

    fn on_exit(&mut self) {
        self.context.broadcast(CaptureEvent::GrabThreadEnabled(false));
    }
}

/// Runs [`CaptureContext::grab_once`] continuously on a "grab" thread.
///
/// A disconnect ends the thread. Re-enable the loop after replacing the
/// camera on the context.
pub struct CaptureLoop {
    context: Arc<CaptureContext>,
    frequency: f32,
    worker: Option<Worker<GrabRunnable>>,
}

impl CaptureLoop {
    pub fn new(context: Arc<CaptureContext>) -> Self {
        Self {
            context,
            frequency: DEFAULT_CAPTURE_HZ,
            worker: None,
        }
    }

    /// Target grab rate in Hz.
    pub fn with_frequency(mut self, frequency_hz: f32) -> Self {
        self.frequency = frequency_hz;
        self
    }

    pub fn context(&self) -> &Arc<CaptureContext> {
        &self.context
    }

    /// Start the capture thread. Does nothing if it is already running.
    pub fn enable(&mut self) -> Result<(), CaptureError> {
        if self.is_enabled() {
            return Ok(());
        }
        // A thread that ended on a disconnect is joined before restarting.
        if let Some(mut finished) = self.worker.take() {
            finished.ensure_completion();
        }
        if !self.context.is_grab_enabled() {
            return Err(CaptureError::DeviceUnavailable(ErrorCode::CameraNotDetected));
        }

        let runnable = GrabRunnable {
            context: Arc::clone(&self.context),
        };
        self.worker = Some(
            WorkerBuilder::new("grab")
                .frequency(self.frequency)
                .spawn(runnable)?,
        );
        info!("Capture loop enabled at {} Hz", self.frequency);
        Ok(())
    }

    /// Stop the capture thread and wait for it to exit.
    pub fn disable(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.ensure_completion();
            info!("Capture loop disabled");
        }
    }

    /// True while the capture thread is running.
    pub fn is_enabled(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    pub fn state(&self) -> WorkerState {
        self.worker
            .as_ref()
            .map_or(WorkerState::Idle, |worker| worker.state())
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedCamera, SimulatedCameraConfig};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Duration, Instant};

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_loop_delivers_frames() {
        let context = CaptureContext::new(SimulatedCamera::new(SimulatedCameraConfig::default()));
        let last = Arc::new(AtomicU64::new(0));
        let regressions = Arc::new(AtomicU64::new(0));
        let (seen, regressed) = (Arc::clone(&last), Arc::clone(&regressions));
        context
            .subscribe(move |_, timestamp| {
                if seen.fetch_max(timestamp, Ordering::SeqCst) >= timestamp {
                    regressed.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        let events = context.events();
        let mut capture = CaptureLoop::new(Arc::clone(&context)).with_frequency(1000.0);
        capture.enable().unwrap();
        assert!(wait_until(Duration::from_secs(2), || context.stats().frames >= 5));
        capture.disable();

        assert!(!capture.is_enabled());
        assert!(last.load(Ordering::SeqCst) > 0);
        assert_eq!(regressions.load(Ordering::SeqCst), 0);
        assert_eq!(events.recv().unwrap(), CaptureEvent::GrabThreadEnabled(true));
        assert_eq!(events.recv().unwrap(), CaptureEvent::GrabThreadEnabled(false));
    }

    #[test]
    fn test_disconnect_stops_loop_until_reenabled() {
        let config = SimulatedCameraConfig {
            disconnect_after: Some(3),
            ..Default::default()
        };
        let context = CaptureContext::new(SimulatedCamera::new(config));
        let events = context.events();
        let mut capture = CaptureLoop::new(Arc::clone(&context));
        capture.enable().unwrap();

        assert!(wait_until(Duration::from_secs(2), || !capture.is_enabled()));
        assert_eq!(context.stats().frames, 3);
        let received: Vec<_> = events.try_iter().collect();
        assert!(received.contains(&CaptureEvent::CameraDisconnected(
            ErrorCode::CameraNotDetected
        )));
        assert!(matches!(
            capture.enable(),
            Err(CaptureError::DeviceUnavailable(_))
        ));

        context.replace_camera(SimulatedCamera::new(SimulatedCameraConfig::default()));
        capture.enable().unwrap();
        assert!(wait_until(Duration::from_secs(2), || context.stats().frames > 3));
        capture.disable();
    }
}
