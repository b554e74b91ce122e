//! State and operations shared by every allocator duty.
//!
//! Owns the write-buffer stripe table and its buffer pool, applies block
//! validity changes to the segment table, and handles stripe completion:
//! a stripe is flushed once all of its blocks are written (or padded), and
//! when the flush finishes its write-buffer slot is released and its
//! segment's occupancy is updated.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::address::{
    SegmentId, StripeAddr, StripeId, TailIndex, VirtualBlockAddress, VirtualBlocks, VolumeId,
};
use crate::archive::AllocatorMetaArchive;
use crate::buffer_pool::BufferPool;
use crate::error::{AllocatorError, AllocatorResult};
use crate::gc_duty::GcDuty;
use crate::mapper::{Mapper, StripeFlusher, user_data_addr};
use crate::stripe::Stripe;

/// How long a waiter sleeps before re-checking its condition without a
/// wakeup.
const FLUSH_WAIT_INTERVAL: Duration = Duration::from_millis(10);

pub struct CommonDuty {
    archive: Arc<AllocatorMetaArchive>,
    gc: Arc<GcDuty>,
    mapper: Arc<dyn Mapper>,
    flusher: Arc<dyn StripeFlusher>,
    stripes: Vec<Arc<Stripe>>,
    buffer_pool: BufferPool,
    progress: Mutex<()>,
    progress_cv: Condvar,
}

impl CommonDuty {
    pub fn new(
        archive: Arc<AllocatorMetaArchive>,
        gc: Arc<GcDuty>,
        mapper: Arc<dyn Mapper>,
        flusher: Arc<dyn StripeFlusher>,
    ) -> Self {
        let info = *archive.info();
        let stripes = (0..info.num_wb_stripes())
            .map(|wb_lsid| Arc::new(Stripe::new(wb_lsid, info.blks_per_stripe())))
            .collect();
        let buffer_pool = BufferPool::new(
            info.num_wb_stripes() as usize * info.chunks_per_stripe() as usize,
            info.chunk_size(),
        );

        Self {
            archive,
            gc,
            mapper,
            flusher,
            stripes,
            buffer_pool,
            progress: Mutex::new(()),
            progress_cv: Condvar::new(),
        }
    }

    pub fn archive(&self) -> &Arc<AllocatorMetaArchive> {
        &self.archive
    }

    pub fn mapper(&self) -> &Arc<dyn Mapper> {
        &self.mapper
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// Stripe object of write-buffer slot `wb_lsid`.
    ///
    /// # Panics
    ///
    /// Panics if `wb_lsid` is out of range.
    pub fn get_stripe(&self, wb_lsid: StripeId) -> &Arc<Stripe> {
        &self.stripes[wb_lsid as usize]
    }

    /// Stripe object behind a write-buffer address. `None` for user-data
    /// or unmapped addresses.
    pub fn get_stripe_by_addr(&self, lsa: StripeAddr) -> Option<&Arc<Stripe>> {
        if !lsa.is_in_write_buffer() {
            return None;
        }
        self.stripes.get(lsa.stripe_id as usize)
    }

    pub fn stripes(&self) -> &[Arc<Stripe>] {
        &self.stripes
    }

    pub fn is_valid_write_buffer_stripe_id(&self, wb_lsid: StripeId) -> bool {
        self.archive.wb_lsid_bitmap().is_set(wb_lsid)
    }

    pub fn is_valid_user_data_segment_id(&self, segment_id: SegmentId) -> bool {
        self.archive.segment_bitmap().is_set(segment_id)
    }

    /// Bind write-buffer slot `wb_lsid` to `vsid` and give it data buffers.
    pub fn bind_stripe(
        &self,
        wb_lsid: StripeId,
        vsid: StripeId,
        tail_index: u32,
    ) -> AllocatorResult<Arc<Stripe>> {
        let stripe = self.get_stripe(wb_lsid).clone();
        // a replayed stripe may be bound again
        self.buffer_pool.put_all(stripe.take_buffers());
        let chunks = self.archive.info().chunks_per_stripe() as usize;
        let Some(buffers) = self.buffer_pool.try_get_many(chunks) else {
            warn!(wb_lsid, vsid, "no stripe buffers available");
            return Err(AllocatorError::BufferPoolExhausted);
        };
        stripe.assign(vsid, tail_index);
        stripe.attach_buffers(buffers);
        Ok(stripe)
    }

    /// Undo [`bind_stripe`](Self::bind_stripe) for a stripe that never
    /// received data.
    pub fn unbind_stripe(&self, stripe: &Stripe) {
        self.buffer_pool.put_all(stripe.take_buffers());
        stripe.unlink_reverse_map();
        stripe.set_finished(true);
    }

    /// Count `blks` as valid in their segment.
    pub fn validate_blks(&self, blks: VirtualBlocks) -> AllocatorResult<()> {
        let segment_id = self.segment_of_vsid(blks.start.stripe_id);
        self.archive
            .segment_info(segment_id)
            .increase_valid_block_count(blks.num_blks)?;
        Ok(())
    }

    /// Count `blks` as no longer valid, freeing the segment once nothing in
    /// it is valid.
    ///
    /// `allow_victim_release` lets a GC victim be freed by this
    /// invalidation.
    pub fn invalidate_blks(
        &self,
        blks: VirtualBlocks,
        allow_victim_release: bool,
    ) -> AllocatorResult<()> {
        let segment_id = self.segment_of_vsid(blks.start.stripe_id);
        let result = match self
            .archive
            .segment_info(segment_id)
            .decrease_valid_block_count(blks.num_blks, allow_victim_release)
        {
            Ok(result) => result,
            Err(e) => {
                // an errored segment stays claimed so it is never handed out
                let _state = self.archive.lock();
                self.archive.segment_bitmap().set_bit(segment_id);
                return Err(e);
            }
        };
        if result.released {
            self.gc.free_user_data_segment_id(segment_id)?;
        }
        Ok(())
    }

    /// Host write completion for `blks`.
    ///
    /// The blocks become valid, and the stripe is flushed once its last
    /// block lands.
    pub fn complete_write(&self, blks: VirtualBlocks) -> AllocatorResult<()> {
        let vsid = blks.start.stripe_id;
        let lsa = self.mapper.get_lsa(vsid);
        let Some(stripe) = self.get_stripe_by_addr(lsa) else {
            return Err(AllocatorError::InvalidArgument(format!(
                "vsid {vsid} is not in the write buffer"
            )));
        };

        stripe.derefer(blks.num_blks)?;
        self.validate_blks(blks)?;
        if stripe.decrease_blks_remaining(blks.num_blks) == 0 {
            self.notify_progress();
            self.request_flush(stripe)?;
        }
        Ok(())
    }

    /// Hand a full stripe to the flush engine.
    pub fn request_flush(&self, stripe: &Arc<Stripe>) -> AllocatorResult<()> {
        debug!(
            wb_lsid = stripe.wb_lsid(),
            vsid = stripe.vsid(),
            "stripe flush requested"
        );
        self.flusher.request_flush(stripe).inspect_err(|e| {
            error!(wb_lsid = stripe.wb_lsid(), "stripe flush request failed: {e}");
        })
    }

    /// Flush completion for write-buffer slot `wb_lsid`.
    ///
    /// The stripe's data now lives in the user-data area: its slot and
    /// buffers are released and its segment's occupancy drops by one.
    pub fn stripe_flushed(&self, wb_lsid: StripeId) -> AllocatorResult<()> {
        let Some(stripe) = self.stripes.get(wb_lsid as usize) else {
            return Err(AllocatorError::InvalidArgument(format!(
                "wb_lsid {wb_lsid} out of range"
            )));
        };
        if stripe.is_finished() {
            return Err(AllocatorError::InvalidArgument(format!(
                "wb_lsid {wb_lsid} is not being flushed"
            )));
        }

        let vsid = stripe.vsid();
        let user_lsid = stripe.user_lsid();
        self.mapper.update_stripe_map(vsid, user_data_addr(user_lsid));
        stripe.set_finished(true);
        stripe.unlink_reverse_map();
        self.buffer_pool.put_all(stripe.take_buffers());

        {
            let _state = self.archive.lock();
            self.archive.wb_lsid_bitmap().clear_bit(wb_lsid);
        }
        debug!(wb_lsid, vsid, user_lsid, "stripe flushed");

        let result = self.try_to_reset_segment_state(user_lsid);
        self.notify_progress();
        result
    }

    /// Count one flushed stripe against its segment. Frees the segment if
    /// it was the last stripe and nothing in it is valid.
    pub fn try_to_reset_segment_state(&self, user_lsid: StripeId) -> AllocatorResult<()> {
        let segment_id = self.archive.info().segment_of(user_lsid);
        match self
            .archive
            .segment_info(segment_id)
            .decrease_occupied_stripe_count(1)
        {
            Some(true) => self.gc.free_user_data_segment_id(segment_id),
            _ => Ok(()),
        }
    }

    /// Blocks from `tail` to the end of its stripe, if any.
    ///
    /// # Panics
    ///
    /// Panics if the tail offset lies beyond the stripe.
    pub fn remaining_blocks(&self, tail: VirtualBlockAddress) -> Option<VirtualBlocks> {
        if tail.is_unmapped() {
            return None;
        }
        let blks_per_stripe = self.archive.info().blks_per_stripe();
        if tail.offset > blks_per_stripe {
            panic!(
                "active stripe tail offset {} exceeds {} blocks per stripe",
                tail.offset, blks_per_stripe
            );
        }
        let num_blks = blks_per_stripe - tail.offset;
        (num_blks > 0).then(|| VirtualBlocks::new(tail, num_blks))
    }

    /// Pad the unwritten rest of the stripe at `tail` and flush it once the
    /// padding completes it.
    ///
    /// Returns the stripe if anything was padded.
    pub fn finish_stripe(
        &self,
        wb_lsid: StripeId,
        tail: VirtualBlockAddress,
    ) -> AllocatorResult<Option<Arc<Stripe>>> {
        let Some(remaining) = self.remaining_blocks(tail) else {
            return Ok(None);
        };
        let stripe = self.get_stripe(wb_lsid).clone();
        if stripe.vsid() != tail.stripe_id {
            return Err(AllocatorError::InvalidArgument(format!(
                "wb_lsid {wb_lsid} holds vsid {}, not {}",
                stripe.vsid(),
                tail.stripe_id
            )));
        }
        self.pad_stripe(&stripe, remaining)?;
        Ok(Some(stripe))
    }

    /// Close the active stripe in tail slot `index`.
    ///
    /// The tail is left unmapped so the next allocation opens a new stripe.
    /// Returns the padded stripe, if the tail was part way through one.
    pub fn finish_active_stripe(&self, index: TailIndex) -> AllocatorResult<Option<Arc<Stripe>>> {
        let remaining = {
            let mut tail = self.archive.tail_lock(index);
            let remaining = self.remaining_blocks(*tail);
            *tail = VirtualBlockAddress::UNMAP;
            remaining
        };
        let Some(remaining) = remaining else {
            return Ok(None);
        };

        let lsa = self.mapper.get_lsa(remaining.start.stripe_id);
        let Some(stripe) = self.get_stripe_by_addr(lsa).cloned() else {
            error!(
                vsid = remaining.start.stripe_id,
                ?lsa,
                "active stripe is not in the write buffer"
            );
            return Ok(None);
        };
        self.pad_stripe(&stripe, remaining)?;
        Ok(Some(stripe))
    }

    /// Close a volume's user and GC active stripes.
    ///
    /// Padded stripes go to `stripes_to_flush`. A stripe that was already
    /// full may still be waiting on writes, so its vsid goes to
    /// `vsids_to_check`.
    pub fn pick_active_stripe(
        &self,
        volume_id: VolumeId,
        stripes_to_flush: &mut Vec<Arc<Stripe>>,
        vsids_to_check: &mut Vec<StripeId>,
    ) -> AllocatorResult<()> {
        for is_gc in [false, true] {
            let index = self.archive.info().tail_index(volume_id, is_gc);
            let tail = self.archive.active_stripe_tail(index);
            match self.finish_active_stripe(index)? {
                Some(stripe) => stripes_to_flush.push(stripe),
                None if !tail.is_unmapped() => vsids_to_check.push(tail.stripe_id),
                None => {}
            }
        }
        Ok(())
    }

    /// [`pick_active_stripe`](Self::pick_active_stripe) for every volume.
    pub fn check_all_active_stripes(
        &self,
        stripes_to_flush: &mut Vec<Arc<Stripe>>,
        vsids_to_check: &mut Vec<StripeId>,
    ) -> AllocatorResult<()> {
        for volume_id in 0..self.archive.info().max_volumes() {
            self.pick_active_stripe(volume_id, stripes_to_flush, vsids_to_check)?;
        }
        Ok(())
    }

    /// Block until `done` holds. Re-checked on every write completion and
    /// stripe flush.
    pub fn wait_until(&self, mut done: impl FnMut() -> bool) {
        let mut guard = self.progress.lock();
        while !done() {
            self.progress_cv.wait_for(&mut guard, FLUSH_WAIT_INTERVAL);
        }
    }

    /// Write every section to the main metadata file.
    pub fn store(&self) -> AllocatorResult<()> {
        self.archive.store_sync()
    }

    fn pad_stripe(&self, stripe: &Arc<Stripe>, padding: VirtualBlocks) -> AllocatorResult<()> {
        for offset in padding.start.offset..padding.end_offset() {
            stripe.update_reverse_map(offset, None);
        }
        debug!(
            wb_lsid = stripe.wb_lsid(),
            vsid = stripe.vsid(),
            padded = padding.num_blks,
            "stripe finished"
        );
        if stripe.decrease_blks_remaining(padding.num_blks) == 0 {
            self.notify_progress();
            self.request_flush(stripe)?;
        }
        Ok(())
    }

    fn notify_progress(&self) {
        let _guard = self.progress.lock();
        self.progress_cv.notify_all();
    }

    fn segment_of_vsid(&self, vsid: StripeId) -> SegmentId {
        // user-data vsids are their own user lsid
        self.archive.info().segment_of(vsid)
    }
}
