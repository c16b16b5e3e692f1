//! Capture session shared by every component that talks to the device.
//!
//! A [`CaptureContext`] is created once per opened device and handed to the
//! capture loop, the buffer pools and the application as an `Arc`. It holds
//! the device lock, the grab subscriber list and the lifecycle event
//! channels.
//!
//! Lock order: subscriber list, then device. Grab callbacks run under the
//! subscriber list lock and may retrieve from the device; the grab itself
//! releases the device lock before notifying.

use crate::camera::{Camera, retrieve_texture};
use crate::error::CaptureError;
use crate::mat::TextureData;
use crate::types::{ErrorCode, MemoryKind, Resolution, TextureSource, resolve_resolution};
use glam::UVec2;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info, trace, warn};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DELIVERING: Cell<u64> = const { Cell::new(0) };
}

/// Marks the current thread as delivering grab callbacks for one context.
struct DeliveryMarker {
    previous: u64,
}

impl DeliveryMarker {
    fn enter(context: u64) -> Self {
        Self {
            previous: DELIVERING.with(|current| current.replace(context)),
        }
    }

    fn active(context: u64) -> bool {
        DELIVERING.with(|current| current.get() == context)
    }
}

impl Drop for DeliveryMarker {
    fn drop(&mut self) {
        DELIVERING.with(|current| current.set(self.previous));
    }
}

/// Callback invoked after every successful grab with the result code and
/// the frame timestamp.
pub type GrabCallback = Box<dyn FnMut(ErrorCode, u64) + Send>;

/// Handle identifying one grab subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrabSubscription(u64);

/// Lifecycle notifications, delivered outside the per-frame callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    /// The capture thread started (`true`) or exited (`false`).
    GrabThreadEnabled(bool),
    /// The device went away; grabbing is disabled until the camera is
    /// replaced and the loop re-enabled.
    CameraDisconnected(ErrorCode),
}

/// What one capture cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabOutcome {
    /// Grabbing is disabled.
    Disabled,
    /// A new frame with this timestamp was delivered to subscribers.
    Grabbed(u64),
    /// The cycle produced nothing; try again next cycle.
    Skipped(ErrorCode),
    /// The device is gone.
    Disconnected(ErrorCode),
}

/// Recording playback controls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackState {
    /// Hold the current recording frame.
    pub paused: bool,
    /// Rewind to the first frame after the last one.
    pub looping: bool,
    /// Append every grabbed frame to the active recording.
    pub recording: bool,
}

/// Grab counters since the context was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub grabs: u64,
    pub frames: u64,
    pub not_new: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    entries: Vec<(u64, GrabCallback)>,
}

#[derive(Default)]
struct Counters {
    grabs: AtomicU64,
    frames: AtomicU64,
    not_new: AtomicU64,
    failures: AtomicU64,
}

/// Device session shared across the capture subsystem.
pub struct CaptureContext {
    id: u64,
    camera: Mutex<Box<dyn Camera>>,
    subscribers: Mutex<Subscribers>,
    events: Mutex<Vec<Sender<CaptureEvent>>>,
    playback: Mutex<PlaybackState>,
    grab_enabled: AtomicBool,
    last_timestamp: AtomicU64,
    resolution: [AtomicU32; 2],
    counters: Counters,
}

impl CaptureContext {
    /// Wrap an opened camera.
    pub fn new(camera: impl Camera + 'static) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            camera: Mutex::new(Box::new(camera)),
            subscribers: Mutex::new(Subscribers::default()),
            events: Mutex::new(Vec::new()),
            playback: Mutex::new(PlaybackState::default()),
            grab_enabled: AtomicBool::new(true),
            last_timestamp: AtomicU64::new(0),
            resolution: [AtomicU32::new(0), AtomicU32::new(0)],
            counters: Counters::default(),
        })
    }

    /// Swap in a re-opened camera and allow grabbing again.
    pub fn replace_camera(&self, camera: impl Camera + 'static) {
        *self.camera.lock() = Box::new(camera);
        self.last_timestamp.store(0, Ordering::Release);
        self.grab_enabled.store(true, Ordering::Release);
        info!("Capture device replaced");
    }

    /// Run `f` with exclusive access to the camera.
    pub fn with_camera<R>(&self, f: impl FnOnce(&mut dyn Camera) -> R) -> R {
        let mut camera = self.camera.lock();
        f(camera.as_mut())
    }

    pub fn is_grab_enabled(&self) -> bool {
        self.grab_enabled.load(Ordering::Acquire)
    }

    pub fn set_grab_enabled(&self, enabled: bool) {
        self.grab_enabled.store(enabled, Ordering::Release);
    }

    /// Timestamp of the last successful grab.
    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp.load(Ordering::Acquire)
    }

    pub fn native_resolution(&self) -> Resolution {
        self.with_camera(|camera| camera.native_resolution())
    }

    /// Resolution used by pools and batches. Zero means native.
    pub fn retrieve_resolution(&self) -> Resolution {
        UVec2::new(
            self.resolution[0].load(Ordering::Relaxed),
            self.resolution[1].load(Ordering::Relaxed),
        )
    }

    pub fn set_retrieve_resolution(&self, resolution: Resolution) {
        self.resolution[0].store(resolution.x, Ordering::Relaxed);
        self.resolution[1].store(resolution.y, Ordering::Relaxed);
    }

    /// Retrieve `source` from the last frame at the retrieve resolution.
    pub fn retrieve(
        &self,
        target: &mut TextureData,
        source: TextureSource,
        memory: MemoryKind,
    ) -> Result<(), ErrorCode> {
        let requested = self.retrieve_resolution();
        self.with_camera(|camera| {
            let resolution = resolve_resolution(requested, camera.native_resolution());
            retrieve_texture(camera, target, source, memory, resolution)
        })
    }

    /// Register a callback run after every successful grab.
    ///
    /// Callbacks run on the capture thread in registration order.
    pub fn subscribe(
        &self,
        callback: impl FnMut(ErrorCode, u64) + Send + 'static,
    ) -> Result<GrabSubscription, CaptureError> {
        if DeliveryMarker::active(self.id) {
            return Err(CaptureError::ReentrantSubscription);
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.next_id += 1;
        let id = subscribers.next_id;
        subscribers.entries.push((id, Box::new(callback)));
        debug!("Grab subscription {} added", id);
        Ok(GrabSubscription(id))
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: GrabSubscription) -> Result<bool, CaptureError> {
        if DeliveryMarker::active(self.id) {
            return Err(CaptureError::ReentrantSubscription);
        }
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.entries.len();
        subscribers.entries.retain(|(id, _)| *id != subscription.0);
        Ok(subscribers.entries.len() != before)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().entries.len()
    }

    /// A receiver for lifecycle events from now on.
    pub fn events(&self) -> Receiver<CaptureEvent> {
        let (sender, receiver) = mpsc::channel();
        self.events.lock().push(sender);
        receiver
    }

    pub(crate) fn broadcast(&self, event: CaptureEvent) {
        self.events
            .lock()
            .retain(|sender| sender.send(event).is_ok());
    }

    pub fn playback(&self) -> PlaybackState {
        *self.playback.lock()
    }

    pub fn set_playback_paused(&self, paused: bool) {
        self.playback.lock().paused = paused;
    }

    pub fn set_playback_looping(&self, looping: bool) {
        self.playback.lock().looping = looping;
    }

    pub fn set_recording(&self, recording: bool) {
        self.playback.lock().recording = recording;
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            grabs: self.counters.grabs.load(Ordering::Relaxed),
            frames: self.counters.frames.load(Ordering::Relaxed),
            not_new: self.counters.not_new.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Run one capture cycle and notify subscribers on success.
    pub fn grab_once(&self) -> GrabOutcome {
        if !self.is_grab_enabled() {
            return GrabOutcome::Disabled;
        }
        self.counters.grabs.fetch_add(1, Ordering::Relaxed);

        let playback = self.playback();
        let (code, timestamp) = {
            let mut camera = self.camera.lock();
            if let (Some(len), Some(position)) =
                (camera.playback_len(), camera.playback_position())
            {
                if playback.paused {
                    camera.set_playback_position(position);
                } else if playback.looping && position + 1 >= len {
                    camera.set_playback_position(0);
                }
            }

            let code = camera.grab();
            if code.is_success() && playback.recording {
                if let Err(error) = camera.record_frame() {
                    warn!("Failed to record frame: {}", error);
                }
            }
            (code, camera.timestamp())
        };

        match code {
            ErrorCode::Success => {
                self.counters.frames.fetch_add(1, Ordering::Relaxed);
                self.last_timestamp.store(timestamp, Ordering::Release);
                self.deliver(code, timestamp);
                GrabOutcome::Grabbed(timestamp)
            }
            ErrorCode::NotANewFrame => {
                self.counters.not_new.fetch_add(1, Ordering::Relaxed);
                trace!("No new frame yet");
                GrabOutcome::Skipped(code)
            }
            code if code.is_disconnect() => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.grab_enabled.store(false, Ordering::Release);
                warn!("Capture device disconnected: {}", code);
                self.broadcast(CaptureEvent::CameraDisconnected(code));
                GrabOutcome::Disconnected(code)
            }
            code => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Grab failed: {}", code);
                GrabOutcome::Skipped(code)
            }
        }
    }

    fn deliver(&self, code: ErrorCode, timestamp: u64) {
        let mut subscribers = self.subscribers.lock();
        let _marker = DeliveryMarker::enter(self.id);
        for (_, callback) in subscribers.entries.iter_mut() {
            callback(code, timestamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimulatedCamera, SimulatedCameraConfig};
    use std::sync::atomic::AtomicUsize;

    fn context_with(config: SimulatedCameraConfig) -> Arc<CaptureContext> {
        CaptureContext::new(SimulatedCamera::new(config))
    }

    #[test]
    fn test_subscribers_notified_in_order() {
        let context = context_with(SimulatedCameraConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = Arc::clone(&order);
            context
                .subscribe(move |code, _| {
                    assert!(code.is_success());
                    order.lock().push(tag);
                })
                .unwrap();
        }

        assert!(matches!(context.grab_once(), GrabOutcome::Grabbed(_)));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let context = context_with(SimulatedCameraConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let subscription = context
            .subscribe(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        context.grab_once();
        assert!(context.unsubscribe(subscription).unwrap());
        assert!(!context.unsubscribe(subscription).unwrap());
        context.grab_once();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reentrant_subscription_rejected() {
        let context = context_with(SimulatedCameraConfig::default());
        let inner = Arc::clone(&context);
        let rejected = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&rejected);

        context
            .subscribe(move |_, _| {
                let result = inner.subscribe(|_, _| {});
                flag.store(
                    matches!(result, Err(CaptureError::ReentrantSubscription)),
                    Ordering::SeqCst,
                );
            })
            .unwrap();

        context.grab_once();
        assert!(rejected.load(Ordering::SeqCst));
        assert_eq!(context.subscriber_count(), 1);
    }

    #[test]
    fn test_not_new_frame_is_silent() {
        let config = SimulatedCameraConfig {
            not_new_frame_every: Some(1),
            ..Default::default()
        };
        let context = context_with(config);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        context
            .subscribe(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(
            context.grab_once(),
            GrabOutcome::Skipped(ErrorCode::NotANewFrame)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(context.stats().not_new, 1);
    }

    #[test]
    fn test_disconnect_disables_grab_and_notifies() {
        let config = SimulatedCameraConfig {
            disconnect_after: Some(1),
            ..Default::default()
        };
        let context = context_with(config);
        let events = context.events();

        assert!(matches!(context.grab_once(), GrabOutcome::Grabbed(_)));
        assert_eq!(
            context.grab_once(),
            GrabOutcome::Disconnected(ErrorCode::CameraNotDetected)
        );
        assert!(!context.is_grab_enabled());
        assert_eq!(context.grab_once(), GrabOutcome::Disabled);
        assert_eq!(
            events.try_recv().unwrap(),
            CaptureEvent::CameraDisconnected(ErrorCode::CameraNotDetected)
        );

        context.replace_camera(SimulatedCamera::new(SimulatedCameraConfig::default()));
        assert!(matches!(context.grab_once(), GrabOutcome::Grabbed(_)));
    }

    #[test]
    fn test_paused_playback_repeats_frame() {
        let config = SimulatedCameraConfig {
            playback_frames: Some(4),
            ..Default::default()
        };
        let context = context_with(config);

        let GrabOutcome::Grabbed(first) = context.grab_once() else {
            panic!("expected a frame");
        };
        context.set_playback_paused(true);
        let GrabOutcome::Grabbed(held) = context.grab_once() else {
            panic!("expected a frame");
        };
        assert_eq!(first, held);

        context.set_playback_paused(false);
        let GrabOutcome::Grabbed(next) = context.grab_once() else {
            panic!("expected a frame");
        };
        assert!(next > held);
    }

    #[test]
    fn test_looping_playback_rewinds() {
        let config = SimulatedCameraConfig {
            playback_frames: Some(2),
            ..Default::default()
        };
        let context = context_with(config);
        context.set_playback_looping(true);

        let stamps: Vec<_> = (0..3).map(|_| context.grab_once()).collect();
        assert!(stamps.iter().all(|outcome| matches!(outcome, GrabOutcome::Grabbed(_))));
        assert_eq!(
            context.with_camera(|camera| camera.playback_position()),
            Some(0)
        );
        let (GrabOutcome::Grabbed(second), GrabOutcome::Grabbed(third)) = (stamps[1], stamps[2])
        else {
            panic!("expected frames");
        };
        assert!(third > second);
    }
}
