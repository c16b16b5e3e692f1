//! Double-buffered retrieval of a set of image and measure textures.
//!
//! With asynchronous retrieval enabled, the capture thread fills one of two
//! pool slots with every tracked texture after each grab. The consumer's
//! [`TextureBatch::tick`] swaps the newest complete slot's buffers with the
//! tracked textures' live buffers, so frames ping-pong between the pool and
//! the consumer without copying. Without asynchronous retrieval, `tick`
//! retrieves straight into the live buffers.

use crate::context::{CaptureContext, GrabSubscription};
use crate::error::CaptureError;
use crate::mat::TextureData;
use crate::types::{Measure, MemoryKind, TextureSource, View};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strata_core::BufferPool;
use tracing::{debug, info, trace, warn};

/// Slots in a texture batch pool.
pub const BATCH_SLOTS: usize = 2;

/// Identifies a tracked texture inside one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(u64);

/// What a tracked texture holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub name: String,
    pub source: TextureSource,
    pub memory: MemoryKind,
}

impl TextureDesc {
    /// An image view retrieved to host memory.
    pub fn view(name: impl Into<String>, view: View) -> Self {
        Self {
            name: name.into(),
            source: TextureSource::View(view),
            memory: MemoryKind::Host,
        }
    }

    /// A measure retrieved to host memory.
    pub fn measure(name: impl Into<String>, measure: Measure) -> Self {
        Self {
            name: name.into(),
            source: TextureSource::Measure(measure),
            memory: MemoryKind::Host,
        }
    }

    pub fn with_memory(mut self, memory: MemoryKind) -> Self {
        self.memory = memory;
        self
    }
}

/// A texture kept up to date by the batch.
#[derive(Debug)]
pub struct TrackedTexture {
    pub id: TextureId,
    pub desc: TextureDesc,
    pub data: TextureData,
}

/// Sources to retrieve, in tracked order, tagged with the edit generation.
#[derive(Debug, Default)]
struct Layout {
    generation: u64,
    sources: Vec<(TextureSource, MemoryKind)>,
}

#[derive(Debug, Default)]
struct BatchFrame {
    generation: u64,
    mats: Vec<TextureData>,
}

#[derive(Default)]
struct Tracked {
    next_id: u64,
    textures: Vec<TrackedTexture>,
    layout: Arc<Layout>,
}

impl Tracked {
    fn rebuild_layout(&mut self) {
        self.layout = Arc::new(Layout {
            generation: self.layout.generation + 1,
            sources: self
                .textures
                .iter()
                .map(|texture| (texture.desc.source, texture.desc.memory))
                .collect(),
        });
    }
}

/// Counters for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Frames filled into a slot.
    pub retrieved: u64,
    /// Frames dropped because both slots were busy.
    pub dropped: u64,
    /// Slots swapped into the tracked textures.
    pub swapped: u64,
}

struct BatchShared {
    name: String,
    tracked: Mutex<Tracked>,
    pool: BufferPool<BatchFrame, BATCH_SLOTS>,
    async_enabled: AtomicBool,
    retrieved: AtomicU64,
    dropped: AtomicU64,
    swapped: AtomicU64,
}

impl BatchShared {
    fn retrieve(&self, context: &CaptureContext, timestamp: u64) -> bool {
        if !self.async_enabled.load(Ordering::Acquire) {
            return false;
        }

        let Some(mut claim) = self.pool.acquire_free_slot(timestamp) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!("Texture batch '{}' dropped frame {}", self.name, timestamp);
            return false;
        };

        let layout = Arc::clone(&self.tracked.lock().layout);
        claim.generation = layout.generation;
        claim.mats.resize_with(layout.sources.len(), TextureData::default);
        for (mat, (source, memory)) in claim.mats.iter_mut().zip(layout.sources.iter()) {
            if let Err(code) = context.retrieve(mat, *source, *memory) {
                warn!(
                    "Texture batch '{}' failed to retrieve {:?}: {}",
                    self.name, source, code
                );
            }
        }

        if let Err(error) = self.pool.mark_write_complete(claim) {
            warn!("Texture batch slot not returned: {}", error);
            return false;
        }
        self.retrieved.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn swap_latest(&self) -> bool {
        let latest = self.pool.latest_complete_timestamp();
        let Some(mut claim) = self.pool.acquire_latest_complete_slot(latest) else {
            return false;
        };

        let swapped = {
            let mut tracked = self.tracked.lock();
            let current = claim.generation == tracked.layout.generation
                && !claim.mats.is_empty()
                && claim.mats.len() == tracked.textures.len();
            if current {
                for (texture, mat) in tracked.textures.iter_mut().zip(claim.mats.iter_mut()) {
                    std::mem::swap(&mut texture.data, mat);
                }
            }
            current
        };

        if let Err(error) = self.pool.release_slot(claim) {
            warn!("Texture batch slot not returned: {}", error);
        }
        if swapped {
            self.swapped.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!("Texture batch '{}' discarded an outdated slot", self.name);
        }
        swapped
    }

    fn retrieve_direct(&self, context: &CaptureContext) -> bool {
        let mut tracked = self.tracked.lock();
        for texture in tracked.textures.iter_mut() {
            let (source, memory) = (texture.desc.source, texture.desc.memory);
            if let Err(code) = context.retrieve(&mut texture.data, source, memory) {
                warn!(
                    "Texture batch '{}' failed to retrieve '{}': {}",
                    self.name, texture.desc.name, code
                );
            }
        }
        true
    }
}

/// A named set of textures refreshed once per grab.
pub struct TextureBatch {
    context: Arc<CaptureContext>,
    shared: Arc<BatchShared>,
    subscription: Option<GrabSubscription>,
}

impl TextureBatch {
    pub fn new(context: Arc<CaptureContext>, name: impl Into<String>) -> Self {
        Self {
            context,
            shared: Arc::new(BatchShared {
                name: name.into(),
                tracked: Mutex::new(Tracked::default()),
                pool: BufferPool::new(|_| BatchFrame::default()),
                async_enabled: AtomicBool::new(false),
                retrieved: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                swapped: AtomicU64::new(0),
            }),
            subscription: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Track a new texture.
    pub fn add_texture(&self, desc: TextureDesc) -> TextureId {
        let mut tracked = self.shared.tracked.lock();
        tracked.next_id += 1;
        let id = TextureId(tracked.next_id);
        debug!("Texture batch '{}' tracks '{}'", self.shared.name, desc.name);
        let data = TextureData::for_source(desc.source);
        tracked.textures.push(TrackedTexture { id, desc, data });
        tracked.rebuild_layout();
        id
    }

    /// Stop tracking a texture. Returns false if it was not tracked.
    pub fn remove_texture(&self, id: TextureId) -> bool {
        let mut tracked = self.shared.tracked.lock();
        let before = tracked.textures.len();
        tracked.textures.retain(|texture| texture.id != id);
        let removed = tracked.textures.len() != before;
        if removed {
            tracked.rebuild_layout();
        }
        removed
    }

    /// Stop tracking every texture.
    pub fn clear(&self) {
        let mut tracked = self.shared.tracked.lock();
        tracked.textures.clear();
        tracked.rebuild_layout();
    }

    pub fn len(&self) -> usize {
        self.shared.tracked.lock().textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read a tracked texture.
    pub fn texture<R>(&self, id: TextureId, read: impl FnOnce(&TrackedTexture) -> R) -> Option<R> {
        let tracked = self.shared.tracked.lock();
        tracked.textures.iter().find(|texture| texture.id == id).map(read)
    }

    /// Switch between double-buffered and direct retrieval.
    ///
    /// Disabling resets the pool; frames in flight are discarded.
    pub fn set_async_retrieve_enabled(&self, enabled: bool) {
        if self.shared.async_enabled.swap(enabled, Ordering::AcqRel) == enabled {
            return;
        }
        if !enabled {
            self.shared.pool.reset();
        }
        info!(
            "Texture batch '{}' asynchronous retrieval {}",
            self.shared.name,
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn is_async_retrieve_enabled(&self) -> bool {
        self.shared.async_enabled.load(Ordering::Acquire)
    }

    /// Retrieve the last grabbed frame into a free slot.
    ///
    /// Producer side, normally called from the capture thread through
    /// [`TextureBatch::attach`]. Returns false when asynchronous retrieval
    /// is off or both slots are busy.
    pub fn retrieve_current_frame(&self, timestamp: u64) -> bool {
        self.shared.retrieve(&self.context, timestamp)
    }

    /// Bring the tracked textures up to date.
    ///
    /// Consumer side, called once per consumer loop iteration. Returns true
    /// when the tracked textures changed.
    pub fn tick(&self) -> bool {
        if self.is_async_retrieve_enabled() {
            self.shared.swap_latest()
        } else {
            self.shared.retrieve_direct(&self.context)
        }
    }

    /// Retrieve after every grab of the capture loop.
    pub fn attach(&mut self) -> Result<(), CaptureError> {
        if self.subscription.is_some() {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        let context: Weak<CaptureContext> = Arc::downgrade(&self.context);
        self.subscription = Some(self.context.subscribe(move |_, timestamp| {
            if let Some(context) = context.upgrade() {
                shared.retrieve(&context, timestamp);
            }
        })?);
        Ok(())
    }

    pub fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            if let Err(error) = self.context.unsubscribe(subscription) {
                warn!("Texture batch could not unsubscribe: {}", error);
            }
        }
    }

    /// Frames dropped because no slot was free.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            retrieved: self.shared.retrieved.load(Ordering::Relaxed),
            dropped: self.dropped_frames(),
            swapped: self.shared.swapped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for TextureBatch {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GrabOutcome;
    use crate::sim::{SimulatedCamera, SimulatedCameraConfig};

    fn setup() -> (Arc<CaptureContext>, TextureBatch, TextureId, TextureId) {
        let context = CaptureContext::new(SimulatedCamera::new(SimulatedCameraConfig::default()));
        let batch = TextureBatch::new(Arc::clone(&context), "test");
        let left = batch.add_texture(TextureDesc::view("left", View::Left));
        let depth = batch.add_texture(TextureDesc::measure("depth", Measure::Depth));
        batch.set_async_retrieve_enabled(true);
        (context, batch, left, depth)
    }

    fn grab(context: &CaptureContext) -> u64 {
        match context.grab_once() {
            GrabOutcome::Grabbed(timestamp) => timestamp,
            other => panic!("unexpected grab outcome {:?}", other),
        }
    }

    fn stamps(batch: &TextureBatch, ids: [TextureId; 2]) -> [u64; 2] {
        ids.map(|id| batch.texture(id, |texture| texture.data.timestamp()).unwrap())
    }

    #[test]
    fn test_double_buffer_consumed_once() {
        let (context, batch, left, depth) = setup();
        let timestamp = grab(&context);
        assert!(batch.retrieve_current_frame(timestamp));

        assert!(batch.tick());
        assert_eq!(stamps(&batch, [left, depth]), [timestamp, timestamp]);
        assert!(batch.texture(left, |texture| texture.data.as_rgba8().is_some()).unwrap());

        assert!(!batch.tick());
        assert_eq!(stamps(&batch, [left, depth]), [timestamp, timestamp]);
        assert_eq!(batch.stats().swapped, 1);
    }

    #[test]
    fn test_newest_frame_wins() {
        let (context, batch, left, depth) = setup();
        let first = grab(&context);
        assert!(batch.retrieve_current_frame(first));
        let second = grab(&context);
        assert!(batch.retrieve_current_frame(second));

        let third = grab(&context);
        assert!(!batch.retrieve_current_frame(third));
        assert_eq!(batch.dropped_frames(), 1);

        assert!(batch.tick());
        assert_eq!(stamps(&batch, [left, depth]), [second, second]);
    }

    #[test]
    fn test_outdated_slot_discarded_after_edit() {
        let (context, batch, left, _) = setup();
        let timestamp = grab(&context);
        assert!(batch.retrieve_current_frame(timestamp));

        let right = batch.add_texture(TextureDesc::view("right", View::Right));
        assert!(!batch.tick());
        assert_eq!(batch.texture(left, |texture| texture.data.timestamp()), Some(0));

        let next = grab(&context);
        assert!(batch.retrieve_current_frame(next));
        assert!(batch.tick());
        assert_eq!(batch.texture(right, |texture| texture.data.timestamp()), Some(next));
    }

    #[test]
    fn test_direct_mode_bypasses_pool() {
        let (context, batch, left, _) = setup();
        batch.set_async_retrieve_enabled(false);
        let timestamp = grab(&context);
        assert!(!batch.retrieve_current_frame(timestamp));

        assert!(batch.tick());
        assert_eq!(batch.texture(left, |texture| texture.data.timestamp()), Some(timestamp));
        assert_eq!(batch.stats().retrieved, 0);
    }

    #[test]
    fn test_disable_discards_pending_frames() {
        let (context, batch, _, _) = setup();
        let timestamp = grab(&context);
        assert!(batch.retrieve_current_frame(timestamp));

        batch.set_async_retrieve_enabled(false);
        batch.set_async_retrieve_enabled(true);
        assert!(!batch.tick());
    }

    #[test]
    fn test_attach_retrieves_on_grab() {
        let (context, mut batch, _, depth) = setup();
        batch.attach().unwrap();
        let timestamp = grab(&context);
        assert!(batch.tick());
        assert_eq!(batch.texture(depth, |texture| texture.data.timestamp()), Some(timestamp));

        batch.detach();
        assert_eq!(context.subscriber_count(), 0);
    }

    #[test]
    fn test_remove_and_clear() {
        let (_, batch, left, depth) = setup();
        assert!(batch.remove_texture(left));
        assert!(!batch.remove_texture(left));
        assert_eq!(batch.len(), 1);
        assert!(batch.texture(depth, |_| ()).is_some());
        batch.clear();
        assert!(batch.is_empty());
    }
}
