//! Collaborator interfaces consumed by the allocator.
//!
//! The stripe map (virtual stripe -> physical location), the reverse map
//! (stripe block -> volume block) and the stripe flush engine live outside
//! the allocator. They are injected as trait objects so tests and tools
//! can supply in-memory versions.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::address::{
    BlkOffset, StripeAddr, StripeId, StripeLoc, VirtualBlockAddress, VolumeId,
};
use crate::error::{AllocatorError, AllocatorResult};
use crate::stripe::{ReverseMapEntry, ReverseMapPack, Stripe};

/// Stripe map and reverse map lookups.
pub trait Mapper: Send + Sync {
    /// Physical location of a virtual stripe.
    fn get_lsa(&self, vsid: StripeId) -> StripeAddr;

    /// Record where a virtual stripe lives.
    fn update_stripe_map(&self, vsid: StripeId, lsa: StripeAddr);

    /// Attach a fresh reverse map to `stripe` for `(vsid, wb_lsid)`.
    fn link_reverse_map(
        &self,
        stripe: &Stripe,
        wb_lsid: StripeId,
        vsid: StripeId,
    ) -> AllocatorResult<()>;

    /// Refill the first `blk_count` reverse-map entries of `stripe` from the
    /// forward block map. Returns the number of entries found.
    fn reconstruct_reverse_map(
        &self,
        stripe: &Stripe,
        volume_id: VolumeId,
        blk_count: u32,
    ) -> AllocatorResult<u32>;
}

/// Stripe flush engine.
pub trait StripeFlusher: Send + Sync {
    /// Start writing a full stripe to the user-data area. Completion is
    /// reported back through the allocator's stripe-flushed entry point.
    fn request_flush(&self, stripe: &Arc<Stripe>) -> AllocatorResult<()>;
}

/// In-memory [`Mapper`].
pub struct MemMapper {
    blks_per_stripe: u32,
    stripe_map: Mutex<HashMap<StripeId, StripeAddr>>,
    block_map: Mutex<HashMap<(StripeId, BlkOffset), ReverseMapEntry>>,
    fail_next_link: AtomicBool,
}

impl MemMapper {
    pub fn new(blks_per_stripe: u32) -> Self {
        Self {
            blks_per_stripe,
            stripe_map: Mutex::new(HashMap::new()),
            block_map: Mutex::new(HashMap::new()),
            fail_next_link: AtomicBool::new(false),
        }
    }

    /// Make the next [`Mapper::link_reverse_map`] call fail.
    pub fn fail_next_link(&self) {
        self.fail_next_link.store(true, Ordering::Release);
    }

    /// Record that `(volume_id, rba)` was written at `vsa`.
    pub fn map_block(&self, volume_id: VolumeId, rba: u64, vsa: VirtualBlockAddress) {
        self.block_map
            .lock()
            .insert((vsa.stripe_id, vsa.offset), ReverseMapEntry { volume_id, rba });
    }

    /// Number of virtual stripes with a recorded location.
    pub fn mapped_stripes(&self) -> usize {
        self.stripe_map.lock().len()
    }
}

impl Mapper for MemMapper {
    fn get_lsa(&self, vsid: StripeId) -> StripeAddr {
        self.stripe_map
            .lock()
            .get(&vsid)
            .copied()
            .unwrap_or(StripeAddr::UNMAP)
    }

    fn update_stripe_map(&self, vsid: StripeId, lsa: StripeAddr) {
        self.stripe_map.lock().insert(vsid, lsa);
    }

    fn link_reverse_map(
        &self,
        stripe: &Stripe,
        wb_lsid: StripeId,
        vsid: StripeId,
    ) -> AllocatorResult<()> {
        if self.fail_next_link.swap(false, Ordering::AcqRel) {
            return Err(AllocatorError::ReverseMapLink { vsid, wb_lsid });
        }
        stripe.link_reverse_map(ReverseMapPack::new(vsid, wb_lsid, self.blks_per_stripe));
        Ok(())
    }

    fn reconstruct_reverse_map(
        &self,
        stripe: &Stripe,
        volume_id: VolumeId,
        blk_count: u32,
    ) -> AllocatorResult<u32> {
        let vsid = stripe.vsid();
        let block_map = self.block_map.lock();
        let mut found = 0;
        for offset in 0..blk_count.min(self.blks_per_stripe) {
            let entry = block_map
                .get(&(vsid, offset))
                .copied()
                .filter(|e| e.volume_id == volume_id);
            if entry.is_some() {
                found += 1;
            }
            stripe.update_reverse_map(offset, entry);
        }
        Ok(found)
    }
}

/// [`StripeFlusher`] that only records requests.
///
/// Tests and tools complete the flushes themselves, in whatever order and
/// on whatever thread they need.
pub struct RecordingFlusher {
    history: Mutex<Vec<StripeId>>,
    tx: Sender<StripeId>,
    rx: Receiver<StripeId>,
}

impl RecordingFlusher {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            history: Mutex::new(Vec::new()),
            tx,
            rx,
        }
    }

    /// Write-buffer lsids of every flush requested so far.
    pub fn requested(&self) -> Vec<StripeId> {
        self.history.lock().clone()
    }

    /// Take all requests not yet taken.
    pub fn drain(&self) -> Vec<StripeId> {
        self.rx.try_iter().collect()
    }

    /// Wait for the next request not yet taken.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<StripeId> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Default for RecordingFlusher {
    fn default() -> Self {
        Self::new()
    }
}

impl StripeFlusher for RecordingFlusher {
    fn request_flush(&self, stripe: &Arc<Stripe>) -> AllocatorResult<()> {
        let wb_lsid = stripe.wb_lsid();
        self.history.lock().push(wb_lsid);
        // receiver is owned by self, so the channel cannot be disconnected
        let _ = self.tx.send(wb_lsid);
        Ok(())
    }
}

/// Location of a stripe staged in the write buffer.
pub fn write_buffer_addr(wb_lsid: StripeId) -> StripeAddr {
    StripeAddr {
        loc: StripeLoc::WriteBuffer,
        stripe_id: wb_lsid,
    }
}

/// Location of a stripe flushed to the user-data area.
pub fn user_data_addr(user_lsid: StripeId) -> StripeAddr {
    StripeAddr {
        loc: StripeLoc::UserData,
        stripe_id: user_lsid,
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_stripe_map() {
        let mapper = MemMapper::new(8);
        assert!(mapper.get_lsa(5).is_unmapped());
        mapper.update_stripe_map(5, write_buffer_addr(2));
        assert!(mapper.get_lsa(5).is_in_write_buffer());
        mapper.update_stripe_map(5, user_data_addr(5));
        assert!(mapper.get_lsa(5).is_in_user_data());
        assert_eq!(mapper.mapped_stripes(), 1);
    }

    #[test]
    fn test_link_failure_injection() {
        let mapper = MemMapper::new(8);
        let stripe = Stripe::new(1, 8);
        stripe.assign(10, 0);

        mapper.fail_next_link();
        let err = mapper.link_reverse_map(&stripe, 1, 10).unwrap_err();
        assert!(matches!(
            err,
            AllocatorError::ReverseMapLink {
                vsid: 10,
                wb_lsid: 1
            }
        ));
        assert!(!stripe.has_reverse_map());

        mapper.link_reverse_map(&stripe, 1, 10).unwrap();
        assert!(stripe.has_reverse_map());
    }

    #[test]
    fn test_reconstruct_from_block_map() {
        let mapper = MemMapper::new(8);
        let stripe = Stripe::new(1, 8);
        stripe.assign(10, 0);
        mapper.link_reverse_map(&stripe, 1, 10).unwrap();

        mapper.map_block(3, 100, VirtualBlockAddress::new(10, 0));
        mapper.map_block(3, 101, VirtualBlockAddress::new(10, 1));
        mapper.map_block(4, 500, VirtualBlockAddress::new(10, 2));

        let found = mapper.reconstruct_reverse_map(&stripe, 3, 3).unwrap();
        assert_eq!(found, 2);
        let pack = stripe.reverse_map().unwrap();
        assert_eq!(pack.entry(1).map(|e| e.rba), Some(101));
        assert_eq!(pack.entry(2), None);
    }

    #[test]
    fn test_recording_flusher() {
        let flusher = RecordingFlusher::new();
        let stripe = Arc::new(Stripe::new(4, 8));
        flusher.request_flush(&stripe).unwrap();
        flusher.request_flush(&stripe).unwrap();

        assert_eq!(flusher.requested(), vec![4, 4]);
        assert_eq!(flusher.recv_timeout(Duration::from_millis(10)), Some(4));
        assert_eq!(flusher.drain(), vec![4]);
        assert!(flusher.drain().is_empty());
    }
}
