//! Fixed-capacity slot pools for handing the latest value between threads.
//!
//! A [`BufferPool`] owns `N` reusable payloads. A producer claims a free
//! slot, fills it and marks it complete; a consumer claims the complete slot
//! matching the newest timestamp and releases it when done. Claiming moves
//! the payload out of the pool into a [`SlotClaim`], so the fill and the
//! read happen without holding the pool lock and without copying.
//!
//! Every selection is a linear scan in index order under one lock. When no
//! slot qualifies the call returns `None` instead of blocking; callers skip
//! the cycle and try again on the next one.

use crate::error::PoolError;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Which side of the pool holds a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRole {
    /// Claimed by a producer through [`BufferPool::acquire_free_slot`].
    Write,
    /// Claimed by a consumer through [`BufferPool::acquire_latest_complete_slot`].
    Read,
}

/// Exclusive ownership of one slot's payload.
///
/// Must go back to its pool through [`BufferPool::mark_write_complete`] or
/// [`BufferPool::release_slot`]; a dropped claim permanently removes its
/// slot from rotation.
#[must_use = "a claimed slot must be completed or released back to its pool"]
#[derive(Debug)]
pub struct SlotClaim<T> {
    pool: u64,
    index: usize,
    epoch: u64,
    timestamp: u64,
    role: ClaimRole,
    payload: T,
}

impl<T> SlotClaim<T> {
    /// Slot index inside the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Timestamp the slot was claimed for.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Producer or consumer claim.
    pub fn role(&self) -> ClaimRole {
        self.role
    }
}

impl<T> Deref for SlotClaim<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.payload
    }
}

impl<T> DerefMut for SlotClaim<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.payload
    }
}

/// Flags of one slot, as seen under the pool lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStatus {
    pub is_free: bool,
    pub is_updated: bool,
    pub timestamp: u64,
    /// The payload is currently out in a claim.
    pub claimed: bool,
}

/// Running counters for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Producer claims granted.
    pub writes: u64,
    /// Producer requests refused because no slot was eligible.
    pub skipped_writes: u64,
    /// Consumer claims granted.
    pub reads: u64,
    /// Completed slots recycled because a newer frame superseded them.
    pub superseded: u64,
}

#[derive(Debug)]
struct Slot<T> {
    payload: Option<T>,
    is_free: bool,
    is_updated: bool,
    timestamp: u64,
}

#[derive(Debug)]
struct Slots<T, const N: usize> {
    slots: [Slot<T>; N],
    epoch: u64,
    latest_complete: u64,
    stats: PoolStats,
}

/// `N` reusable payload slots with free/updated/timestamp bookkeeping.
#[derive(Debug)]
pub struct BufferPool<T, const N: usize> {
    id: u64,
    inner: Mutex<Slots<T, N>>,
}

impl<T, const N: usize> BufferPool<T, N> {
    /// Allocate every payload up front. Slots start free with timestamp 0.
    pub fn new(mut init: impl FnMut(usize) -> T) -> Self {
        let slots = std::array::from_fn(|index| Slot {
            payload: Some(init(index)),
            is_free: true,
            is_updated: false,
            timestamp: 0,
        });

        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(Slots {
                slots,
                epoch: 0,
                latest_complete: 0,
                stats: PoolStats::default(),
            }),
        }
    }

    /// Number of slots.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Claim the first slot that is free and older than `now`.
    ///
    /// The slot is stamped with `now`. Returns `None` when every slot is
    /// busy or already holds this frame.
    pub fn acquire_free_slot(&self, now: u64) -> Option<SlotClaim<T>> {
        let mut inner = self.inner.lock();
        let epoch = inner.epoch;

        let found = inner
            .slots
            .iter()
            .position(|slot| slot.is_free && slot.timestamp < now && slot.payload.is_some());

        let Some(index) = found else {
            inner.stats.skipped_writes += 1;
            return None;
        };

        inner.stats.writes += 1;
        let slot = &mut inner.slots[index];
        slot.is_free = false;
        slot.is_updated = false;
        slot.timestamp = now;
        let payload = slot.payload.take()?;

        Some(SlotClaim {
            pool: self.id,
            index,
            epoch,
            timestamp: now,
            role: ClaimRole::Write,
            payload,
        })
    }

    /// Return a producer claim and publish it as complete.
    ///
    /// A consumer claim is released instead and reported as
    /// [`PoolError::WrongRole`], so a consumed frame is never republished.
    pub fn mark_write_complete(&self, claim: SlotClaim<T>) -> Result<(), PoolError> {
        self.check_owner(&claim)?;
        if claim.role != ClaimRole::Write {
            let index = claim.index;
            self.release_slot(claim)?;
            return Err(PoolError::WrongRole { index });
        }
        let mut inner = self.inner.lock();
        let stale = claim.epoch != inner.epoch;
        let timestamp = claim.timestamp;

        let slot = &mut inner.slots[claim.index];
        slot.payload = Some(claim.payload);
        if stale {
            slot.is_free = true;
            slot.is_updated = false;
            slot.timestamp = 0;
            return Ok(());
        }

        slot.is_free = false;
        slot.is_updated = true;
        slot.timestamp = timestamp;
        inner.latest_complete = inner.latest_complete.max(timestamp);
        Ok(())
    }

    /// Claim the complete slot stamped exactly `now`.
    ///
    /// Complete slots older than `now` are recycled to free first, since
    /// a consumer asking for `now` will never want them again.
    pub fn acquire_latest_complete_slot(&self, now: u64) -> Option<SlotClaim<T>> {
        let mut inner = self.inner.lock();
        let epoch = inner.epoch;

        let mut superseded = 0;
        for slot in inner.slots.iter_mut() {
            if slot.is_updated && slot.timestamp < now && slot.payload.is_some() {
                slot.is_updated = false;
                slot.is_free = true;
                superseded += 1;
            }
        }
        inner.stats.superseded += superseded;

        let index = inner
            .slots
            .iter()
            .position(|slot| slot.is_updated && slot.timestamp == now && slot.payload.is_some())?;

        inner.stats.reads += 1;
        let slot = &mut inner.slots[index];
        slot.is_free = false;
        slot.is_updated = false;
        let payload = slot.payload.take()?;

        Some(SlotClaim {
            pool: self.id,
            index,
            epoch,
            timestamp: now,
            role: ClaimRole::Read,
            payload,
        })
    }

    /// Return a claim and mark its slot free.
    ///
    /// The slot keeps its timestamp, so it is not handed out again for the
    /// same frame.
    pub fn release_slot(&self, claim: SlotClaim<T>) -> Result<(), PoolError> {
        self.check_owner(&claim)?;
        let mut inner = self.inner.lock();
        let stale = claim.epoch != inner.epoch;

        let slot = &mut inner.slots[claim.index];
        slot.payload = Some(claim.payload);
        slot.is_free = true;
        slot.is_updated = false;
        if stale {
            slot.timestamp = 0;
        }
        Ok(())
    }

    /// Newest timestamp ever marked complete.
    pub fn latest_complete_timestamp(&self) -> u64 {
        self.inner.lock().latest_complete
    }

    /// Logically reset every slot without freeing payloads.
    ///
    /// Slots out in a claim rejoin the pool as free when the claim returns.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.latest_complete = 0;
        for slot in inner.slots.iter_mut() {
            slot.is_free = slot.payload.is_some();
            slot.is_updated = false;
            slot.timestamp = 0;
        }
    }

    /// Per-slot flags.
    pub fn status(&self) -> [SlotStatus; N] {
        let inner = self.inner.lock();
        std::array::from_fn(|index| {
            let slot = &inner.slots[index];
            SlotStatus {
                is_free: slot.is_free,
                is_updated: slot.is_updated,
                timestamp: slot.timestamp,
                claimed: slot.payload.is_none(),
            }
        })
    }

    /// Counters since construction.
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats
    }

    fn check_owner(&self, claim: &SlotClaim<T>) -> Result<(), PoolError> {
        if claim.pool != self.id {
            return Err(PoolError::ForeignClaim {
                pool: self.id,
                claim_pool: claim.pool,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn pool<const N: usize>() -> BufferPool<Vec<u8>, N> {
        BufferPool::new(|index| vec![index as u8; 4])
    }

    #[test]
    fn test_free_slots_claimed_in_index_order() {
        let pool = pool::<3>();
        let a = pool.acquire_free_slot(1).unwrap();
        let b = pool.acquire_free_slot(2).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(a.role(), ClaimRole::Write);
        assert_eq!(b[0], 1);
        pool.release_slot(a).unwrap();
        pool.release_slot(b).unwrap();
    }

    #[test]
    fn test_exhausted_pool_returns_none() {
        let pool = pool::<2>();
        let a = pool.acquire_free_slot(1).unwrap();
        let b = pool.acquire_free_slot(1).unwrap();
        assert!(pool.acquire_free_slot(1).is_none());
        assert_eq!(pool.stats().skipped_writes, 1);
        pool.release_slot(a).unwrap();
        pool.release_slot(b).unwrap();
    }

    #[test]
    fn test_timestamp_gates_reuse() {
        let pool = pool::<1>();
        let claim = pool.acquire_free_slot(5).unwrap();
        pool.release_slot(claim).unwrap();

        assert!(pool.acquire_free_slot(5).is_none());
        let claim = pool.acquire_free_slot(6).unwrap();
        assert_eq!(claim.timestamp(), 6);
        pool.release_slot(claim).unwrap();
    }

    #[test]
    fn test_complete_slot_consumed_once() {
        let pool = pool::<2>();
        let mut claim = pool.acquire_free_slot(10).unwrap();
        claim[0] = 42;
        pool.mark_write_complete(claim).unwrap();
        assert_eq!(pool.latest_complete_timestamp(), 10);

        assert!(pool.acquire_latest_complete_slot(9).is_none());
        let read = pool.acquire_latest_complete_slot(10).unwrap();
        assert_eq!(read[0], 42);
        assert_eq!(read.role(), ClaimRole::Read);
        pool.release_slot(read).unwrap();

        assert!(pool.acquire_latest_complete_slot(10).is_none());
    }

    #[test]
    fn test_read_claim_cannot_be_republished() {
        let pool = pool::<2>();
        let claim = pool.acquire_free_slot(1).unwrap();
        pool.mark_write_complete(claim).unwrap();

        let read = pool.acquire_latest_complete_slot(1).unwrap();
        assert_eq!(
            pool.mark_write_complete(read),
            Err(PoolError::WrongRole { index: 0 })
        );

        // The slot went back as free and the frame stays consumed.
        assert!(pool.acquire_latest_complete_slot(1).is_none());
        let status = pool.status();
        assert!(status[0].is_free && !status[0].is_updated && !status[0].claimed);
        assert_eq!(pool.acquire_free_slot(2).map(|claim| claim.index()), Some(0));
    }

    #[test]
    fn test_superseded_slots_recycled() {
        let pool = pool::<2>();
        let old = pool.acquire_free_slot(1).unwrap();
        let new = pool.acquire_free_slot(2).unwrap();
        pool.mark_write_complete(old).unwrap();
        pool.mark_write_complete(new).unwrap();

        let read = pool.acquire_latest_complete_slot(pool.latest_complete_timestamp()).unwrap();
        assert_eq!(read.timestamp(), 2);
        assert_eq!(pool.stats().superseded, 1);

        let status = pool.status();
        assert!(status[0].is_free && !status[0].is_updated);
        assert!(status[1].claimed);
        pool.release_slot(read).unwrap();
    }

    #[test]
    fn test_foreign_claim_rejected() {
        let first = pool::<1>();
        let second = pool::<1>();
        let claim = first.acquire_free_slot(1).unwrap();
        assert!(matches!(
            second.release_slot(claim),
            Err(PoolError::ForeignClaim { .. })
        ));
    }

    #[test]
    fn test_reset_recycles_outstanding_claims() {
        let pool = pool::<2>();
        let claim = pool.acquire_free_slot(3).unwrap();
        let done = pool.acquire_free_slot(4).unwrap();
        pool.mark_write_complete(done).unwrap();

        pool.reset();
        assert_eq!(pool.latest_complete_timestamp(), 0);
        let status = pool.status();
        assert!(!status[0].is_free && status[0].claimed);
        assert!(status[1].is_free && !status[1].is_updated);

        pool.mark_write_complete(claim).unwrap();
        let status = pool.status();
        assert!(status[0].is_free && !status[0].is_updated);
        assert_eq!(status[0].timestamp, 0);
    }

    #[test]
    fn test_concurrent_claims_never_overlap() {
        const SLOTS: usize = 3;
        let pool = Arc::new(pool::<SLOTS>());
        let in_use: Arc<Vec<AtomicBool>> =
            Arc::new((0..SLOTS).map(|_| AtomicBool::new(false)).collect());
        let clock = Arc::new(AtomicU64::new(1));
        let done = Arc::new(AtomicBool::new(false));

        let producers: Vec<_> = (0..3)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let in_use = Arc::clone(&in_use);
                let clock = Arc::clone(&clock);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let now = clock.fetch_add(1, Ordering::SeqCst);
                        if let Some(claim) = pool.acquire_free_slot(now) {
                            assert!(!in_use[claim.index()].swap(true, Ordering::SeqCst));
                            in_use[claim.index()].store(false, Ordering::SeqCst);
                            pool.mark_write_complete(claim).unwrap();
                        }
                    }
                })
            })
            .collect();

        let consumer = {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut last = 0;
                while !done.load(Ordering::SeqCst) {
                    let now = pool.latest_complete_timestamp();
                    if let Some(claim) = pool.acquire_latest_complete_slot(now) {
                        assert!(!in_use[claim.index()].swap(true, Ordering::SeqCst));
                        assert!(claim.timestamp() >= last);
                        last = claim.timestamp();
                        in_use[claim.index()].store(false, Ordering::SeqCst);
                        pool.release_slot(claim).unwrap();
                    }
                }
            })
        };

        for producer in producers {
            producer.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        consumer.join().unwrap();

        let stats = pool.stats();
        assert!(stats.writes > 0);
        assert!(pool.status().iter().all(|slot| !slot.claimed));
    }
}
