//! Journal integration: metadata checkpoints and log replay.
//!
//! The journal checkpoints allocator metadata through
//! [`flush_metadata`](JournalManagerDuty::flush_metadata) and, after a
//! crash, replays its log through the `replay_*` and `restore_*` entry
//! points. Every replay operation is idempotent, so replaying the same
//! record twice leaves the allocator unchanged.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::address::{StripeId, TailIndex, VirtualBlockAddress, VolumeId};
use crate::archive::AllocatorMetaArchive;
use crate::common_duty::CommonDuty;
use crate::error::{AllocatorError, AllocatorResult};
use crate::io_duty::IoDuty;
use crate::mapper::{Mapper, write_buffer_addr};
use crate::segment::SegmentState;
use crate::stripe::Stripe;

/// Tail index recorded on stripes rebuilt outside any active tail.
const NO_TAIL_INDEX: u32 = u32::MAX;

pub struct JournalManagerDuty {
    archive: Arc<AllocatorMetaArchive>,
    common: Arc<CommonDuty>,
    io: Arc<IoDuty>,
    pending_full_stripes: Mutex<Vec<Arc<Stripe>>>,
}

impl JournalManagerDuty {
    pub fn new(
        archive: Arc<AllocatorMetaArchive>,
        common: Arc<CommonDuty>,
        io: Arc<IoDuty>,
    ) -> Self {
        Self {
            archive,
            common,
            io,
            pending_full_stripes: Mutex::new(Vec::new()),
        }
    }

    /// Checkpoint all allocator metadata.
    ///
    /// Sections are snapshotted under the main lock, tails under their own
    /// locks, and the snapshot is written asynchronously. `on_done` runs
    /// once the write completes. Fails with
    /// [`AllocatorError::FlushInProgress`] while an earlier checkpoint is
    /// still being written.
    pub fn flush_metadata(
        &self,
        on_done: impl FnOnce(AllocatorResult<()>) + Send + 'static,
    ) -> AllocatorResult<()> {
        if self.archive.is_flush_in_progress() {
            return Err(AllocatorError::FlushInProgress);
        }
        let mut buffer = {
            let mut state = self.archive.lock();
            self.archive.get_copied_meta_buffer(&mut state)
        };
        for index in 0..self.archive.info().tail_array_len() {
            self.archive.copy_wbuf_tail(&mut buffer, TailIndex(index));
        }
        self.archive.flush(buffer, on_done)
    }

    /// Request flushes for replayed stripes that turned out to be full.
    ///
    /// Returns how many were requested.
    pub fn flush_full_active_stripes(&self) -> AllocatorResult<usize> {
        let stripes = std::mem::take(&mut *self.pending_full_stripes.lock());
        for stripe in &stripes {
            self.common.request_flush(stripe)?;
            debug!(
                vsid = stripe.vsid(),
                wb_lsid = stripe.wb_lsid(),
                "replayed full stripe flush requested"
            );
        }
        Ok(stripes.len())
    }

    /// Rebuild the stripe in `wb_lsid` from a replayed tail and pad it out.
    pub fn flush_stripe(
        &self,
        volume_id: VolumeId,
        wb_lsid: StripeId,
        tail: VirtualBlockAddress,
    ) -> AllocatorResult<()> {
        let stripe =
            self.reconstruct_active_stripe(tail.stripe_id, wb_lsid, tail.offset, NO_TAIL_INDEX)?;
        self.reconstruct_reverse_map(volume_id, &stripe, tail.offset)?;
        self.common.finish_stripe(wb_lsid, tail)?;
        Ok(())
    }

    /// Replayed cursor position.
    pub fn replay_ssd_lsid(&self, current_ssd_lsid: StripeId) {
        self.archive.lock().current_ssd_lsid = current_ssd_lsid;
    }

    /// Replayed stripe open: the write-buffer slot is in use, and so is the
    /// segment if the stripe was its first.
    pub fn replay_stripe_allocation(&self, vsid: StripeId, wb_lsid: StripeId) {
        let info = self.archive.info();
        let _state = self.archive.lock();
        self.archive.wb_lsid_bitmap().set_bit(wb_lsid);

        let user_lsid = self.io.allocate_user_data_stripe_id(vsid);
        if info.is_first_stripe_of_segment(user_lsid) {
            self.archive
                .segment_bitmap()
                .set_bit(info.segment_of(user_lsid));
        }
    }

    /// Replayed stripe flush: the write-buffer slot is free again.
    pub fn replay_stripe_flushed(&self, wb_lsid: StripeId) {
        let _state = self.archive.lock();
        self.archive.wb_lsid_bitmap().clear_bit(wb_lsid);
    }

    /// Replayed segment claim. A segment that is no longer free was already
    /// accounted for and is left alone.
    pub fn replay_segment_allocation(&self, user_lsid: StripeId) {
        let info = self.archive.info();
        if !info.is_first_stripe_of_segment(user_lsid) {
            return;
        }
        let segment_id = info.segment_of(user_lsid);
        let _state = self.archive.lock();
        let segment = self.archive.segment_info(segment_id);
        if segment.state() != SegmentState::Free {
            debug!(segment_id, state = ?segment.state(), "segment already allocated");
            return;
        }
        if segment.move_to_nvram_state().is_ok() {
            debug!(segment_id, "segment allocation replayed");
        }
    }

    /// Every active stripe tail, in tail-index order.
    pub fn get_active_stripe_tail(&self) -> Vec<VirtualBlockAddress> {
        (0..self.archive.info().tail_array_len())
            .map(|index| self.archive.active_stripe_tail(TailIndex(index)))
            .collect()
    }

    pub fn reset_active_stripe_tail(&self, index: TailIndex) {
        *self.archive.tail_lock(index) = VirtualBlockAddress::UNMAP;
    }

    /// Put a replayed tail back and rebuild the stripe it points into.
    pub fn restore_active_stripe_tail(
        &self,
        index: TailIndex,
        tail: VirtualBlockAddress,
        wb_lsid: StripeId,
    ) -> AllocatorResult<()> {
        *self.archive.tail_lock(index) = tail;

        let stripe =
            self.reconstruct_active_stripe(tail.stripe_id, wb_lsid, tail.offset, index.0 as u32)?;
        let volume_id = index.volume_id(self.archive.info().max_volumes());
        self.reconstruct_reverse_map(volume_id, &stripe, tail.offset)
    }

    fn reconstruct_active_stripe(
        &self,
        vsid: StripeId,
        wb_lsid: StripeId,
        blk_count: u32,
        tail_index: u32,
    ) -> AllocatorResult<Arc<Stripe>> {
        let info = self.archive.info();
        if blk_count == 0 || blk_count > info.blks_per_stripe() {
            return Err(AllocatorError::WrongBlockCount(blk_count));
        }
        if wb_lsid >= info.num_wb_stripes() {
            return Err(AllocatorError::InvalidArgument(format!(
                "wb_lsid {wb_lsid} out of range"
            )));
        }

        let stripe = self.common.bind_stripe(wb_lsid, vsid, tail_index)?;
        self.common
            .mapper()
            .update_stripe_map(vsid, write_buffer_addr(wb_lsid));

        let remaining = stripe.decrease_blks_remaining(blk_count);
        if remaining == 0 {
            let mut pending = self.pending_full_stripes.lock();
            if !pending.iter().any(|s| s.wb_lsid() == wb_lsid) {
                debug!(vsid, wb_lsid, "replayed stripe is waiting to be flushed");
                pending.push(stripe.clone());
            }
        }
        debug!(vsid, wb_lsid, blk_count, remaining, "stripe reconstructed");
        Ok(stripe)
    }

    fn reconstruct_reverse_map(
        &self,
        volume_id: VolumeId,
        stripe: &Stripe,
        blk_count: u32,
    ) -> AllocatorResult<()> {
        let mapper = self.common.mapper();
        mapper.link_reverse_map(stripe, stripe.wb_lsid(), stripe.vsid())?;
        let found = mapper.reconstruct_reverse_map(stripe, volume_id, blk_count)?;
        if found < blk_count {
            info!(
                vsid = stripe.vsid(),
                found, blk_count, "no block map entry for some blocks"
            );
        }
        Ok(())
    }
}
