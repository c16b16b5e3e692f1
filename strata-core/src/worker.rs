//! Cancellable workers running on dedicated threads.
//!
//! A [`Worker`] owns one OS thread that calls [`Runnable::run_once`] at a
//! target frequency. Other threads steer it through requested flags: stop,
//! sleep/wake and pause/resume. The thread parks on a condition variable
//! whenever it is asleep, paused or ahead of its cycle budget, so requests
//! take effect without spinning.

use crate::error::WorkerError;
use crate::rate::RateLimiter;
use parking_lot::{Condvar, Mutex};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

/// Lifecycle state of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Not started yet, or the thread has exited.
    Idle,
    /// Executing cycles.
    Running,
    /// Parked until woken or resumed.
    Sleeping,
    /// A stop was observed; the thread is winding down.
    Stopping,
}

/// Work executed by a [`Worker`], one unit per cycle.
pub trait Runnable: Send + 'static {
    /// Called once on the worker thread before the first cycle.
    fn on_start(&mut self) {}

    /// Execute one unit of work. Returning `Break` ends the worker.
    fn run_once(&mut self) -> ControlFlow<()>;

    /// Called once on the worker thread after the last cycle.
    fn on_exit(&mut self) {}
}

#[derive(Debug)]
struct Flags {
    state: WorkerState,
    stop_requested: bool,
    sleep_requested: bool,
    paused: bool,
}

struct Control {
    flags: Mutex<Flags>,
    signal: Condvar,
    cycles: AtomicU64,
}

impl Control {
    fn new(start_asleep: bool) -> Self {
        Self {
            flags: Mutex::new(Flags {
                state: WorkerState::Idle,
                stop_requested: false,
                sleep_requested: start_asleep,
                paused: false,
            }),
            signal: Condvar::new(),
            cycles: AtomicU64::new(0),
        }
    }

    fn update(&self, apply: impl FnOnce(&mut Flags)) {
        let mut flags = self.flags.lock();
        apply(&mut flags);
        self.signal.notify_all();
    }

    /// Blocks while asleep or paused. Returns false once a stop is requested.
    fn wait_runnable(&self) -> bool {
        let mut flags = self.flags.lock();
        while !flags.stop_requested && (flags.sleep_requested || flags.paused) {
            flags.state = WorkerState::Sleeping;
            self.signal.wait(&mut flags);
        }
        if flags.stop_requested {
            flags.state = WorkerState::Stopping;
            return false;
        }
        flags.state = WorkerState::Running;
        true
    }

    /// Parks for the remainder of a cycle. Only a stop, sleep or pause
    /// request cuts it short; other notifications keep waiting.
    fn park_for(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut flags = self.flags.lock();
        while !(flags.stop_requested || flags.sleep_requested || flags.paused) {
            if self.signal.wait_until(&mut flags, deadline).timed_out() {
                break;
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.flags.lock().state = state;
    }
}

/// Cloneable handle that can only wake a worker.
///
/// Handed to other execution contexts (readback threads, callbacks) that
/// must resume a sleeping worker without owning it.
#[derive(Clone)]
pub struct WorkerWaker {
    control: Arc<Control>,
}

impl WorkerWaker {
    /// Wake the worker if it is sleeping.
    pub fn wake(&self) {
        self.control.update(|flags| flags.sleep_requested = false);
    }
}

/// Configures and spawns a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerBuilder {
    name: String,
    frequency: f32,
    start_asleep: bool,
}

impl WorkerBuilder {
    /// Create a builder for a thread named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            frequency: 0.0,
            start_asleep: false,
        }
    }

    /// Target cycle frequency in Hz. Zero runs unthrottled.
    pub fn frequency(mut self, frequency_hz: f32) -> Self {
        self.frequency = frequency_hz;
        self
    }

    /// Park the worker before its first cycle until it is woken.
    pub fn start_asleep(mut self, asleep: bool) -> Self {
        self.start_asleep = asleep;
        self
    }

    /// Spawn the worker thread.
    pub fn spawn<R: Runnable>(self, runnable: R) -> Result<Worker<R>, WorkerError> {
        let control = Arc::new(Control::new(self.start_asleep));
        let thread_control = Arc::clone(&control);
        let frequency = self.frequency;
        let thread_name = self.name.clone();

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_loop(&thread_name, thread_control, runnable, frequency))
            .map_err(|source| WorkerError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        debug!("Worker '{}' started at {} Hz", self.name, frequency);
        Ok(Worker {
            name: self.name,
            control,
            handle: Some(handle),
        })
    }
}

fn run_loop<R: Runnable>(name: &str, control: Arc<Control>, mut runnable: R, frequency: f32) -> R {
    let mut limiter = RateLimiter::new(frequency);
    runnable.on_start();

    while control.wait_runnable() {
        limiter.start();
        let flow = runnable.run_once();
        limiter.stop();
        control.cycles.fetch_add(1, Ordering::Relaxed);

        if flow.is_break() {
            debug!("Worker '{}' finished on its own", name);
            control.set_state(WorkerState::Stopping);
            break;
        }

        if limiter.can_sleep() {
            control.park_for(limiter.sleep_duration());
        } else if !limiter.cycle_time().is_zero() {
            trace!(
                "Worker '{}' overran its cycle: {:?} > {:?}",
                name,
                limiter.last_elapsed(),
                limiter.cycle_time()
            );
        }
    }

    runnable.on_exit();
    control.set_state(WorkerState::Idle);
    runnable
}

/// A runnable executing on its own thread.
///
/// Dropping the worker runs [`Worker::ensure_completion`].
pub struct Worker<R: Runnable> {
    name: String,
    control: Arc<Control>,
    handle: Option<JoinHandle<R>>,
}

impl<R: Runnable> Worker<R> {
    /// Thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.control.flags.lock().state
    }

    /// Number of cycles executed so far.
    pub fn cycles(&self) -> u64 {
        self.control.cycles.load(Ordering::Relaxed)
    }

    /// Ask the worker to exit at the top of its next cycle.
    pub fn request_stop(&self) {
        self.control.update(|flags| flags.stop_requested = true);
    }

    /// Park the worker after its current cycle.
    pub fn sleep(&self) {
        self.control.update(|flags| flags.sleep_requested = true);
    }

    /// Resume a sleeping worker.
    pub fn wake(&self) {
        self.control.update(|flags| flags.sleep_requested = false);
    }

    /// Pause or resume the worker.
    pub fn pause(&self, paused: bool) {
        self.control.update(|flags| flags.paused = paused);
    }

    /// True while a sleep is requested: no new cycle starts until woken.
    pub fn is_sleeping(&self) -> bool {
        self.control.flags.lock().sleep_requested
    }

    /// True while paused.
    pub fn is_paused(&self) -> bool {
        self.control.flags.lock().paused
    }

    /// True once the thread has exited (or was already joined).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// Wake-only handle for other execution contexts.
    pub fn waker(&self) -> WorkerWaker {
        WorkerWaker {
            control: Arc::clone(&self.control),
        }
    }

    /// Wake, resume, request stop, then block until the thread exits.
    ///
    /// Returns the runnable to its owner. Returns `None` if the worker was
    /// already joined, if it panicked, or if called from the worker's own
    /// thread (which would never return).
    pub fn ensure_completion(&mut self) -> Option<R> {
        let handle = self.handle.take()?;

        if handle.thread().id() == thread::current().id() {
            error!("Worker '{}' cannot wait for itself to complete", self.name);
            self.handle = Some(handle);
            return None;
        }

        self.control.update(|flags| {
            flags.sleep_requested = false;
            flags.paused = false;
            flags.stop_requested = true;
        });

        match handle.join() {
            Ok(runnable) => {
                info!(
                    "Worker '{}' stopped after {} cycles",
                    self.name,
                    self.cycles()
                );
                Some(runnable)
            }
            Err(_) => {
                error!("Worker '{}' panicked", self.name);
                None
            }
        }
    }
}

impl<R: Runnable> Drop for Worker<R> {
    fn drop(&mut self) {
        let _ = self.ensure_completion();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        count: Arc<AtomicUsize>,
        finish_after: Option<usize>,
        exited: bool,
    }

    impl Counter {
        fn new(count: Arc<AtomicUsize>) -> Self {
            Self {
                count,
                finish_after: None,
                exited: false,
            }
        }
    }

    impl Runnable for Counter {
        fn run_once(&mut self) -> ControlFlow<()> {
            let done = self.count.fetch_add(1, Ordering::SeqCst) + 1;
            match self.finish_after {
                Some(limit) if done >= limit => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        }

        fn on_exit(&mut self) {
            self.exited = true;
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_running_worker_completes() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut worker = WorkerBuilder::new("test-running")
            .frequency(500.0)
            .spawn(Counter::new(Arc::clone(&count)))
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) >= 3));
        let runnable = worker.ensure_completion().unwrap();
        assert!(runnable.exited);
        assert!(worker.is_finished());
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[test]
    fn test_sleeping_worker_completes_without_cycles() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut worker = WorkerBuilder::new("test-asleep")
            .frequency(100.0)
            .start_asleep(true)
            .spawn(Counter::new(Arc::clone(&count)))
            .unwrap();

        assert!(worker.is_sleeping());
        assert!(wait_until(Duration::from_secs(2), || worker.state()
            == WorkerState::Sleeping));
        let runnable = worker.ensure_completion().unwrap();
        assert!(runnable.exited);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_paused_worker_completes() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut worker = WorkerBuilder::new("test-paused")
            .frequency(200.0)
            .spawn(Counter::new(Arc::clone(&count)))
            .unwrap();

        worker.pause(true);
        assert!(worker.is_paused());
        assert!(wait_until(Duration::from_secs(2), || worker.state()
            == WorkerState::Sleeping));
        assert!(worker.ensure_completion().is_some());
    }

    #[test]
    fn test_unthrottled_worker_joins_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut worker = WorkerBuilder::new("test-unthrottled")
            .spawn(Counter::new(Arc::clone(&count)))
            .unwrap();
        assert!(worker.ensure_completion().is_some());
        assert!(worker.ensure_completion().is_none());
    }

    #[test]
    fn test_wake_does_not_shorten_cycle_park() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut worker = WorkerBuilder::new("test-park")
            .frequency(1.0)
            .spawn(Counter::new(Arc::clone(&count)))
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) >= 1));
        let waker = worker.waker();
        for _ in 0..10 {
            waker.wake();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let started = Instant::now();
        assert!(worker.ensure_completion().is_some());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sleep_stops_cycles_and_wake_resumes() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut worker = WorkerBuilder::new("test-sleep")
            .frequency(1000.0)
            .spawn(Counter::new(Arc::clone(&count)))
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst) > 0));
        worker.sleep();
        assert!(wait_until(Duration::from_secs(2), || worker.state()
            == WorkerState::Sleeping));
        let parked_at = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), parked_at);

        worker.waker().wake();
        assert!(wait_until(Duration::from_secs(2), || count.load(Ordering::SeqCst)
            > parked_at));
        worker.ensure_completion();
    }

    #[test]
    fn test_break_ends_worker() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut counter = Counter::new(Arc::clone(&count));
        counter.finish_after = Some(2);
        let mut worker = WorkerBuilder::new("test-break").spawn(counter).unwrap();

        assert!(wait_until(Duration::from_secs(2), || worker.is_finished()));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(worker.state(), WorkerState::Idle);
        assert!(worker.ensure_completion().unwrap().exited);
    }

    #[test]
    fn test_request_stop_is_cooperative() {
        let count = Arc::new(AtomicUsize::new(0));
        let worker = WorkerBuilder::new("test-stop")
            .frequency(1000.0)
            .spawn(Counter::new(Arc::clone(&count)))
            .unwrap();

        worker.request_stop();
        assert!(wait_until(Duration::from_secs(2), || worker.is_finished()));
        assert_eq!(worker.state(), WorkerState::Idle);
    }
}
