//! Write-buffer stripes.
//!
//! One [`Stripe`] exists per write-buffer slot for the lifetime of the
//! allocator; the slot index is its write-buffer lsid. A stripe is bound
//! to a virtual stripe id when an active stripe is opened and released
//! once its flush completes.
//!
//! # Lifecycle
//!
//! ```text
//! idle (finished) --assign()--> filling --remaining == 0--> flushing
//!      ^                                                       |
//!      +-------------------- flush complete -------------------+
//! ```

use parking_lot::Mutex;

use crate::address::{BlkOffset, StripeId, VolumeId, UNMAP_STRIPE};
use crate::error::{AllocatorError, AllocatorResult};
use crate::sync::{AtomicBool, AtomicU32, Ordering};

/// Reverse-map entry for one block: which volume block lives there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReverseMapEntry {
    pub volume_id: VolumeId,
    pub rba: u64,
}

/// Per-stripe reverse map, from block offset to volume block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseMapPack {
    vsid: StripeId,
    wb_lsid: StripeId,
    entries: Vec<Option<ReverseMapEntry>>,
}

impl ReverseMapPack {
    pub fn new(vsid: StripeId, wb_lsid: StripeId, blks_per_stripe: u32) -> Self {
        Self {
            vsid,
            wb_lsid,
            entries: vec![None; blks_per_stripe as usize],
        }
    }

    pub fn vsid(&self) -> StripeId {
        self.vsid
    }

    pub fn wb_lsid(&self) -> StripeId {
        self.wb_lsid
    }

    pub fn set_entry(&mut self, offset: BlkOffset, entry: Option<ReverseMapEntry>) {
        self.entries[offset as usize] = entry;
    }

    pub fn entry(&self, offset: BlkOffset) -> Option<ReverseMapEntry> {
        self.entries.get(offset as usize).copied().flatten()
    }

    /// Number of offsets that map to a volume block.
    pub fn mapped_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

/// A write-buffer stripe slot.
pub struct Stripe {
    wb_lsid: StripeId,
    blks_per_stripe: u32,
    vsid: AtomicU32,
    user_lsid: AtomicU32,
    tail_index: AtomicU32,
    remaining: AtomicU32,
    ref_count: AtomicU32,
    finished: AtomicBool,
    buffers: Mutex<Vec<Box<[u8]>>>,
    rev_map: Mutex<Option<ReverseMapPack>>,
}

impl Stripe {
    /// Create an idle stripe for write-buffer slot `wb_lsid`.
    pub fn new(wb_lsid: StripeId, blks_per_stripe: u32) -> Self {
        Self {
            wb_lsid,
            blks_per_stripe,
            vsid: AtomicU32::new(UNMAP_STRIPE),
            user_lsid: AtomicU32::new(UNMAP_STRIPE),
            tail_index: AtomicU32::new(u32::MAX),
            remaining: AtomicU32::new(0),
            ref_count: AtomicU32::new(0),
            finished: AtomicBool::new(true),
            buffers: Mutex::new(Vec::new()),
            rev_map: Mutex::new(None),
        }
    }

    /// Bind the stripe to a virtual stripe and reset its counters.
    ///
    /// User-data vsids are their own user lsid.
    pub fn assign(&self, vsid: StripeId, tail_index: u32) {
        self.vsid.store(vsid, Ordering::Release);
        self.user_lsid.store(vsid, Ordering::Release);
        self.tail_index.store(tail_index, Ordering::Release);
        self.remaining.store(self.blks_per_stripe, Ordering::Release);
        self.ref_count.store(0, Ordering::Release);
        self.finished.store(false, Ordering::Release);
    }

    #[inline]
    pub fn wb_lsid(&self) -> StripeId {
        self.wb_lsid
    }

    #[inline]
    pub fn vsid(&self) -> StripeId {
        self.vsid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_lsid(&self) -> StripeId {
        self.user_lsid.load(Ordering::Acquire)
    }

    /// Active-stripe-tail slot the stripe was opened for.
    #[inline]
    pub fn tail_index(&self) -> u32 {
        self.tail_index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn blks_remaining(&self) -> u32 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Count `count` blocks as done. Returns the blocks still outstanding.
    ///
    /// Exactly one caller observes the transition to zero.
    ///
    /// # Panics
    ///
    /// Panics if more blocks are completed than the stripe had left.
    pub fn decrease_blks_remaining(&self, count: u32) -> u32 {
        let prev = self.remaining.fetch_sub(count, Ordering::AcqRel);
        if count > prev {
            panic!(
                "stripe wb_lsid {} remaining underflow: {} - {}",
                self.wb_lsid, prev, count
            );
        }
        prev - count
    }

    /// Blocks handed out to writers and not yet written.
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Count `count` blocks handed out to writers.
    pub fn refer(&self, count: u32) {
        self.ref_count.fetch_add(count, Ordering::AcqRel);
    }

    /// Count `count` handed-out blocks as written. Returns the blocks still
    /// in flight.
    ///
    /// Completing more blocks than are in flight is refused and leaves the
    /// count unchanged.
    pub fn derefer(&self, count: u32) -> AllocatorResult<u32> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if count > current {
                return Err(AllocatorError::RefCountUnderflow {
                    wb_lsid: self.wb_lsid,
                    current,
                    requested: count,
                });
            }
            match self.ref_count.compare_exchange(
                current,
                current - count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current - count),
                Err(actual) => current = actual,
            }
        }
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn set_finished(&self, finished: bool) {
        self.finished.store(finished, Ordering::Release);
    }

    /// Hand data buffers to the stripe.
    pub fn attach_buffers(&self, buffers: Vec<Box<[u8]>>) {
        self.buffers.lock().extend(buffers);
    }

    /// Take the stripe's data buffers back.
    pub fn take_buffers(&self) -> Vec<Box<[u8]>> {
        std::mem::take(&mut *self.buffers.lock())
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Install a reverse map, replacing any previous one.
    pub fn link_reverse_map(&self, pack: ReverseMapPack) {
        *self.rev_map.lock() = Some(pack);
    }

    pub fn unlink_reverse_map(&self) -> Option<ReverseMapPack> {
        self.rev_map.lock().take()
    }

    pub fn has_reverse_map(&self) -> bool {
        self.rev_map.lock().is_some()
    }

    /// Update one reverse-map entry. No-op if no map is linked.
    pub fn update_reverse_map(&self, offset: BlkOffset, entry: Option<ReverseMapEntry>) {
        if let Some(pack) = self.rev_map.lock().as_mut() {
            pack.set_entry(offset, entry);
        }
    }

    /// Clone of the linked reverse map.
    pub fn reverse_map(&self) -> Option<ReverseMapPack> {
        self.rev_map.lock().clone()
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;
    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn loom_single_zero_crossing() {
        loom::model(|| {
            let stripe = Arc::new(Stripe::new(0, 4));
            stripe.assign(0, 0);

            let s1 = stripe.clone();
            let t1 = thread::spawn(move || s1.decrease_blks_remaining(2) == 0);
            let s2 = stripe.clone();
            let t2 = thread::spawn(move || s2.decrease_blks_remaining(2) == 0);

            let hit1 = t1.join().unwrap();
            let hit2 = t2.join().unwrap();
            assert!(hit1 ^ hit2, "exactly one writer must see the stripe fill");
            assert_eq!(stripe.blks_remaining(), 0);
        });
    }

    #[test]
    fn loom_concurrent_derefer() {
        loom::model(|| {
            let stripe = Arc::new(Stripe::new(0, 4));
            stripe.assign(0, 0);
            stripe.refer(3);

            let s1 = stripe.clone();
            let t1 = thread::spawn(move || s1.derefer(2).is_ok());
            let s2 = stripe.clone();
            let t2 = thread::spawn(move || s2.derefer(2).is_ok());

            let ok1 = t1.join().unwrap();
            let ok2 = t2.join().unwrap();
            assert!(ok1 ^ ok2, "only one completion fits in the count");
            assert_eq!(stripe.ref_count(), 1);
        });
    }
}
