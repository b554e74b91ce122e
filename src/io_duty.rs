//! Block allocation for the host write path.
//!
//! Each volume has a user and a GC active stripe tail. Blocks are handed
//! out from the tail's stripe until it is full, then a new stripe is
//! opened: a write-buffer slot is claimed, the next user-data stripe id is
//! taken (claiming a fresh segment at segment boundaries), buffers are
//! bound and the reverse map is linked. Any failure part way through
//! rolls back what was claimed.

use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

use crate::address::{SegmentId, StripeId, TailIndex, VirtualBlockAddress, VirtualBlocks, VolumeId};
use crate::archive::{AllocatorMetaArchive, MetaState};
use crate::common_duty::CommonDuty;
use crate::error::{AllocatorError, AllocatorResult};
use crate::gc_duty::GcDuty;
use crate::mapper::{Mapper, write_buffer_addr};
use crate::segment::SegmentState;

/// Proof that block allocation is switched off.
///
/// Only one pause exists at a time. Allocation resumes when the pause is
/// handed back to [`IoDuty::turn_on_blk_allocation`] or dropped.
pub struct AllocationPause<'a> {
    io: &'a IoDuty,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for AllocationPause<'_> {
    fn drop(&mut self) {
        self.io.block_allocation.store(false, Ordering::Release);
        debug!("block allocation resumed");
    }
}

pub struct IoDuty {
    archive: Arc<AllocatorMetaArchive>,
    gc: Arc<GcDuty>,
    common: Arc<CommonDuty>,
    pause: Mutex<()>,
    block_allocation: AtomicBool,
}

impl IoDuty {
    pub fn new(
        archive: Arc<AllocatorMetaArchive>,
        gc: Arc<GcDuty>,
        common: Arc<CommonDuty>,
    ) -> Self {
        Self {
            archive,
            gc,
            common,
            pause: Mutex::new(()),
            block_allocation: AtomicBool::new(false),
        }
    }

    /// Allocate up to `num_blks` blocks for a user write on `volume_id`.
    ///
    /// The returned run may be shorter than asked for when the active
    /// stripe fills up; the caller asks again for the rest.
    pub fn allocate_write_buffer_blks(
        &self,
        volume_id: VolumeId,
        num_blks: u32,
    ) -> AllocatorResult<VirtualBlocks> {
        if self.gc.is_blocked_for_user_segment_alloc() || self.is_blk_allocation_blocked() {
            return Err(AllocatorError::AllocationBlocked);
        }
        let index = self.tail_index_for(volume_id, false)?;
        self.allocate_blks(index, num_blks)
    }

    /// Allocate up to `num_blks` blocks for a GC copy on `volume_id`.
    ///
    /// GC keeps allocating while user writes are blocked for lack of free
    /// segments.
    pub fn allocate_gc_blk(
        &self,
        volume_id: VolumeId,
        num_blks: u32,
    ) -> AllocatorResult<VirtualBlocks> {
        if self.is_blk_allocation_blocked() {
            return Err(AllocatorError::AllocationBlocked);
        }
        let index = self.tail_index_for(volume_id, true)?;
        self.allocate_blks(index, num_blks)
    }

    /// User-data stripes are addressed by their own lsid.
    #[inline]
    pub fn allocate_user_data_stripe_id(&self, vsid: StripeId) -> StripeId {
        vsid
    }

    /// Claim the lowest free segment that is neither a rebuild target nor
    /// in `Error`.
    ///
    /// The caller holds the main lock.
    pub(crate) fn allocate_user_data_segment_id(&self, state: &MetaState) -> Option<SegmentId> {
        let bitmap = self.archive.segment_bitmap();
        let mut start = 0;
        while let Some(segment_id) = bitmap.find_first_zero(start) {
            if state.is_rebuild_target(segment_id)
                || self.archive.segment_info(segment_id).state() == SegmentState::Error
            {
                start = segment_id + 1;
                continue;
            }
            bitmap.set_bit(segment_id);
            return Some(segment_id);
        }
        None
    }

    /// Stop handing out blocks until the returned pause is given back.
    ///
    /// Waits if another pause is outstanding.
    pub fn turn_off_blk_allocation(&self) -> AllocationPause<'_> {
        let guard = self.pause.lock();
        self.block_allocation.store(true, Ordering::Release);
        debug!("block allocation paused");
        AllocationPause {
            io: self,
            _guard: guard,
        }
    }

    pub fn turn_on_blk_allocation(&self, pause: AllocationPause<'_>) {
        drop(pause);
    }

    pub fn is_blk_allocation_blocked(&self) -> bool {
        self.block_allocation.load(Ordering::Acquire)
    }

    fn tail_index_for(&self, volume_id: VolumeId, is_gc: bool) -> AllocatorResult<TailIndex> {
        let max_volumes = self.archive.info().max_volumes();
        if volume_id >= max_volumes {
            return Err(AllocatorError::InvalidArgument(format!(
                "volume {volume_id} out of range (max {max_volumes})"
            )));
        }
        Ok(self.archive.info().tail_index(volume_id, is_gc))
    }

    fn allocate_blks(&self, index: TailIndex, num_blks: u32) -> AllocatorResult<VirtualBlocks> {
        if num_blks == 0 {
            return Err(AllocatorError::InvalidArgument(
                "zero block allocation".to_string(),
            ));
        }
        let blks_per_stripe = self.archive.info().blks_per_stripe();

        let mut tail = self.archive.tail_lock(index);
        let blks = if tail.is_unmapped() || tail.offset >= blks_per_stripe {
            let vsid = self.allocate_stripe(index)?;
            let num_blks = num_blks.min(blks_per_stripe);
            *tail = VirtualBlockAddress::new(vsid, num_blks);
            VirtualBlocks::new(VirtualBlockAddress::new(vsid, 0), num_blks)
        } else if tail.offset + num_blks > blks_per_stripe {
            let blks = VirtualBlocks::new(*tail, blks_per_stripe - tail.offset);
            tail.offset = blks_per_stripe;
            blks
        } else {
            let blks = VirtualBlocks::new(*tail, num_blks);
            tail.offset += num_blks;
            blks
        };

        let lsa = self.common.mapper().get_lsa(blks.start.stripe_id);
        if let Some(stripe) = self.common.get_stripe_by_addr(lsa) {
            stripe.refer(blks.num_blks);
        }
        drop(tail);
        Ok(blks)
    }

    /// Open a new active stripe for tail slot `index`. Returns its vsid.
    fn allocate_stripe(&self, index: TailIndex) -> AllocatorResult<StripeId> {
        let info = *self.archive.info();
        let is_user = !index.is_gc(info.max_volumes());

        let wb_lsid = {
            let _state = self.archive.lock();
            self.archive.wb_lsid_bitmap().set_first_zero(0)
        };
        let Some(wb_lsid) = wb_lsid else {
            debug!(tail = index.0, "no free write buffer stripe");
            return Err(AllocatorError::NoFreeWriteBufferStripe);
        };

        let claim = match self.allocate_user_data_stripe_id_internal(is_user) {
            Ok(claim) => claim,
            Err(e) => {
                let mut state = self.archive.lock();
                self.rollback_locked(&mut state, wb_lsid, None);
                return Err(e);
            }
        };
        let vsid = claim.lsid;

        let stripe = match self.common.bind_stripe(wb_lsid, vsid, index.0 as u32) {
            Ok(stripe) => stripe,
            Err(e) => {
                let mut state = self.archive.lock();
                self.rollback_locked(&mut state, wb_lsid, Some(&claim));
                return Err(e);
            }
        };

        if let Err(e) = self.common.mapper().link_reverse_map(&stripe, wb_lsid, vsid) {
            error!(wb_lsid, vsid, "reverse map link failed: {e}");
            self.common.unbind_stripe(&stripe);
            let mut state = self.archive.lock();
            self.rollback_locked(&mut state, wb_lsid, Some(&claim));
            return Err(e);
        }

        self.common
            .mapper()
            .update_stripe_map(vsid, write_buffer_addr(wb_lsid));
        debug!(tail = index.0, wb_lsid, vsid, "active stripe opened");
        Ok(vsid)
    }

    /// Advance the user-data cursor, claiming a new segment when it crosses
    /// a segment boundary.
    fn allocate_user_data_stripe_id_internal(
        &self,
        is_user: bool,
    ) -> AllocatorResult<SsdLsidClaim> {
        let info = *self.archive.info();
        let mut state = self.archive.lock();
        let mut lsid = state.current_ssd_lsid.wrapping_add(1);
        let mut new_segment = None;

        if info.is_first_stripe_of_segment(lsid) {
            let num_free = self.gc.get_num_of_free_user_data_segment();
            if num_free <= self.gc.get_urgent_threshold() {
                self.gc.set_up_block_segment_alloc_for_user(true);
                if is_user {
                    debug!(num_free, "user stripe refused, free segments are urgent");
                    return Err(AllocatorError::AllocationBlocked);
                }
            }

            let Some(segment_id) = self.allocate_user_data_segment_id(&state) else {
                if state.rebuild_targets.is_empty() {
                    error!("no free user data segment");
                    return Err(AllocatorError::NoFreeSegment);
                }
                warn!(
                    targets = state.rebuild_targets.len(),
                    "no free user data segment while rebuilding"
                );
                return Err(AllocatorError::UnderRebuild);
            };

            if let Err(e) = self.archive.segment_info(segment_id).move_to_nvram_state() {
                self.archive.segment_bitmap().clear_bit(segment_id);
                error!(segment_id, "claimed segment was not free: {e}");
                return Err(e);
            }
            lsid = info.first_stripe_of(segment_id);
            new_segment = Some(segment_id);
            info!(segment_id, "user data segment allocated");
        }

        let prev_lsid = state.current_ssd_lsid;
        state.prev_ssd_lsid = prev_lsid;
        state.current_ssd_lsid = lsid;
        Ok(SsdLsidClaim {
            lsid,
            prev_lsid,
            new_segment,
        })
    }

    /// Give back what a failed stripe open claimed.
    ///
    /// The cursor only moves back if no other lane took a stripe after
    /// this one. Otherwise the claimed stripe is left as a hole and
    /// discounted from its segment, which stays claimed for the stripes
    /// around it.
    fn rollback_locked(
        &self,
        state: &mut MetaState,
        wb_lsid: StripeId,
        claim: Option<&SsdLsidClaim>,
    ) {
        self.archive.wb_lsid_bitmap().clear_bit(wb_lsid);
        let Some(claim) = claim else {
            debug!(wb_lsid, "stripe allocation rolled back");
            return;
        };

        if state.current_ssd_lsid == claim.lsid {
            state.current_ssd_lsid = claim.prev_lsid;
            state.prev_ssd_lsid = claim.prev_lsid;
            if let Some(segment_id) = claim.new_segment {
                self.archive.segment_info(segment_id).reset();
                self.archive.segment_bitmap().clear_bit(segment_id);
            }
            debug!(wb_lsid, lsid = claim.lsid, "stripe allocation rolled back");
            return;
        }

        let segment_id = self.archive.info().segment_of(claim.lsid);
        let released = self
            .archive
            .segment_info(segment_id)
            .decrease_occupied_stripe_count(1);
        if released == Some(true)
            && let Err(e) = self.gc.free_user_data_segment_id_locked(state, segment_id)
        {
            warn!(segment_id, "failed to free segment after rollback: {e}");
        }
        debug!(
            wb_lsid,
            lsid = claim.lsid,
            current_ssd_lsid = state.current_ssd_lsid,
            "stripe allocation rolled back, cursor already moved on"
        );
    }
}

/// A user-data stripe id taken from the shared cursor.
struct SsdLsidClaim {
    lsid: StripeId,
    /// Cursor value before this claim.
    prev_lsid: StripeId,
    /// Segment claimed because `lsid` starts it.
    new_segment: Option<SegmentId>,
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::address::AddressInfo;
    use crate::config::GcConfig;
    use crate::mapper::{MemMapper, RecordingFlusher};
    use crate::meta_file::MemFile;

    struct Fixture {
        archive: Arc<AllocatorMetaArchive>,
        gc: Arc<GcDuty>,
        mapper: Arc<MemMapper>,
        common: Arc<CommonDuty>,
        io: IoDuty,
    }

    // 4 blocks per stripe, 2 stripes per segment, 2 volumes
    fn fixture(wb_stripes: u32, segments: u32, urgent: u32) -> Fixture {
        let info = AddressInfo::new(4, 2, 1, 16, wb_stripes, segments, 2);
        let archive = Arc::new(AllocatorMetaArchive::new(
            info,
            Arc::new(MemFile::new("meta")),
            Arc::new(MemFile::new("rebuild")),
        ));
        archive.init().unwrap();
        let gc = Arc::new(GcDuty::new(
            archive.clone(),
            &GcConfig {
                normal_threshold: urgent,
                urgent_threshold: urgent,
            },
        ));
        let mapper = Arc::new(MemMapper::new(4));
        let common = Arc::new(CommonDuty::new(
            archive.clone(),
            gc.clone(),
            mapper.clone(),
            Arc::new(RecordingFlusher::new()),
        ));
        let io = IoDuty::new(archive.clone(), gc.clone(), common.clone());
        Fixture {
            archive,
            gc,
            mapper,
            common,
            io,
        }
    }

    #[test]
    fn test_first_allocation_claims_segment() {
        let f = fixture(4, 4, 0);
        let blks = f.io.allocate_write_buffer_blks(0, 3).unwrap();
        assert_eq!(blks, VirtualBlocks::new(VirtualBlockAddress::new(0, 0), 3));

        assert!(f.archive.segment_bitmap().is_set(0));
        assert_eq!(f.archive.segment_info(0).state(), SegmentState::Nvram);
        assert!(f.archive.wb_lsid_bitmap().is_set(0));
        assert_eq!(f.archive.lock().current_ssd_lsid(), 0);
        assert!(f.mapper.get_lsa(0).is_in_write_buffer());
        assert_eq!(f.common.get_stripe(0).ref_count(), 3);
        assert!(f.common.get_stripe(0).has_reverse_map());
    }

    #[test]
    fn test_tail_advances_then_partial_then_new_stripe() {
        let f = fixture(4, 4, 0);
        let index = f.archive.info().tail_index(1, false);

        f.io.allocate_write_buffer_blks(1, 2).unwrap();
        assert_eq!(
            f.archive.active_stripe_tail(index),
            VirtualBlockAddress::new(0, 2)
        );

        // only 2 of 3 fit
        let partial = f.io.allocate_write_buffer_blks(1, 3).unwrap();
        assert_eq!(partial, VirtualBlocks::new(VirtualBlockAddress::new(0, 2), 2));
        assert_eq!(
            f.archive.active_stripe_tail(index),
            VirtualBlockAddress::new(0, 4)
        );

        let next = f.io.allocate_write_buffer_blks(1, 9).unwrap();
        assert_eq!(next, VirtualBlocks::new(VirtualBlockAddress::new(1, 0), 4));
        assert_eq!(f.mapper.get_lsa(1).stripe_id, 1);
        assert_eq!(f.archive.segment_bitmap().num_bits_set(), 1);
    }

    #[test]
    fn test_user_and_gc_tails_are_separate() {
        let f = fixture(4, 4, 0);
        let user = f.io.allocate_write_buffer_blks(0, 1).unwrap();
        let gc = f.io.allocate_gc_blk(0, 1).unwrap();
        assert_ne!(user.start.stripe_id, gc.start.stripe_id);
        assert_eq!(f.archive.wb_lsid_bitmap().num_bits_set(), 2);
    }

    #[test]
    fn test_segment_boundary_claims_next_segment() {
        let f = fixture(8, 4, 0);
        for expected in 0..4 {
            let blks = f.io.allocate_write_buffer_blks(0, 4).unwrap();
            assert_eq!(blks.start.stripe_id, expected);
        }
        assert_eq!(f.archive.segment_bitmap().num_bits_set(), 2);
        assert_eq!(f.archive.segment_info(1).state(), SegmentState::Nvram);
    }

    #[test]
    fn test_no_free_write_buffer_stripe() {
        let f = fixture(1, 4, 0);
        f.io.allocate_write_buffer_blks(0, 4).unwrap();
        let err = f.io.allocate_write_buffer_blks(0, 1).unwrap_err();
        assert!(matches!(err, AllocatorError::NoFreeWriteBufferStripe));
        assert!(err.is_transient());
    }

    #[test]
    fn test_no_free_segment_rolls_back_wb_slot() {
        let f = fixture(8, 1, 0);
        f.io.allocate_write_buffer_blks(0, 4).unwrap();
        f.io.allocate_write_buffer_blks(0, 4).unwrap();
        // a user stripe would be refused as urgent first
        let err = f.io.allocate_gc_blk(0, 4).unwrap_err();
        assert!(matches!(err, AllocatorError::NoFreeSegment));
        assert_eq!(f.archive.wb_lsid_bitmap().num_bits_set(), 2);
        assert_eq!(f.archive.lock().current_ssd_lsid(), 1);
    }

    #[test]
    fn test_exhaustion_during_rebuild() {
        let f = fixture(8, 2, 0);
        f.archive.lock().insert_rebuild_target(1);
        f.io.allocate_write_buffer_blks(0, 4).unwrap();
        f.io.allocate_write_buffer_blks(0, 4).unwrap();
        let err = f.io.allocate_write_buffer_blks(0, 4).unwrap_err();
        assert!(matches!(err, AllocatorError::UnderRebuild));
        assert!(!f.archive.segment_bitmap().is_set(1));
    }

    #[test]
    fn test_urgent_blocks_user_but_not_gc() {
        let f = fixture(8, 3, 2);
        // 3 free > urgent 2
        f.io.allocate_write_buffer_blks(0, 4).unwrap();
        f.io.allocate_write_buffer_blks(0, 4).unwrap();

        // next boundary sees 2 free
        let err = f.io.allocate_write_buffer_blks(0, 4).unwrap_err();
        assert!(matches!(err, AllocatorError::AllocationBlocked));
        assert!(f.gc.is_blocked_for_user_segment_alloc());
        assert_eq!(f.archive.wb_lsid_bitmap().num_bits_set(), 2);

        let gc_blks = f.io.allocate_gc_blk(0, 4).unwrap();
        assert_eq!(gc_blks.start.stripe_id, 2);
        assert!(matches!(
            f.io.allocate_write_buffer_blks(1, 1),
            Err(AllocatorError::AllocationBlocked)
        ));
    }

    #[test]
    fn test_pause_blocks_all_allocation() {
        let f = fixture(4, 4, 0);
        let pause = f.io.turn_off_blk_allocation();
        assert!(f.io.is_blk_allocation_blocked());
        assert!(matches!(
            f.io.allocate_write_buffer_blks(0, 1),
            Err(AllocatorError::AllocationBlocked)
        ));
        assert!(matches!(
            f.io.allocate_gc_blk(0, 1),
            Err(AllocatorError::AllocationBlocked)
        ));
        f.io.turn_on_blk_allocation(pause);
        assert!(!f.io.is_blk_allocation_blocked());
        f.io.allocate_write_buffer_blks(0, 1).unwrap();
    }

    #[test]
    fn test_pause_resumes_on_drop() {
        let f = fixture(4, 4, 0);
        {
            let _pause = f.io.turn_off_blk_allocation();
        }
        assert!(!f.io.is_blk_allocation_blocked());
    }

    #[test]
    fn test_reverse_map_failure_rolls_back_everything() {
        let f = fixture(4, 4, 0);
        f.mapper.fail_next_link();
        let err = f.io.allocate_write_buffer_blks(0, 1).unwrap_err();
        assert!(matches!(err, AllocatorError::ReverseMapLink { .. }));

        assert_eq!(f.archive.wb_lsid_bitmap().num_bits_set(), 0);
        assert_eq!(f.archive.segment_bitmap().num_bits_set(), 0);
        assert_eq!(f.archive.segment_info(0).state(), SegmentState::Free);
        assert_eq!(f.common.buffer_pool().available(), 4);
        assert!(f.archive.active_stripe_tail(f.archive.info().tail_index(0, false)).is_unmapped());

        // the same ids come back on retry
        let blks = f.io.allocate_write_buffer_blks(0, 1).unwrap();
        assert_eq!(blks.start.stripe_id, 0);
        assert!(f.common.is_valid_write_buffer_stripe_id(0));
    }

    #[test]
    fn test_rollback_keeps_stripe_taken_by_another_lane() {
        let f = fixture(4, 4, 0);
        let first = f.io.allocate_user_data_stripe_id_internal(true).unwrap();
        let second = f.io.allocate_user_data_stripe_id_internal(false).unwrap();
        assert_eq!((first.lsid, first.new_segment), (0, Some(0)));
        assert_eq!((second.lsid, second.new_segment), (1, None));

        // the first open fails after the second lane moved the cursor on
        f.archive.wb_lsid_bitmap().set_bit(0);
        let mut state = f.archive.lock();
        f.io.rollback_locked(&mut state, 0, Some(&first));
        assert_eq!(state.current_ssd_lsid(), 1);
        drop(state);

        let segment = f.archive.segment_info(0);
        assert_eq!(segment.state(), SegmentState::Nvram);
        assert_eq!(segment.occupied_stripe_count(), 1);
        assert!(f.archive.segment_bitmap().is_set(0));
        assert!(!f.archive.wb_lsid_bitmap().is_set(0));
    }

    #[test]
    fn test_rollbacks_in_reverse_order_restore_cursor() {
        let f = fixture(4, 4, 0);
        let first = f.io.allocate_user_data_stripe_id_internal(true).unwrap();
        let second = f.io.allocate_user_data_stripe_id_internal(false).unwrap();

        let mut state = f.archive.lock();
        f.io.rollback_locked(&mut state, 1, Some(&second));
        assert_eq!(state.current_ssd_lsid(), 0);
        f.io.rollback_locked(&mut state, 0, Some(&first));
        // back to the initial cursor, segment 0 free again
        assert_eq!(state.current_ssd_lsid(), 1);
        drop(state);
        assert_eq!(f.archive.segment_info(0).state(), SegmentState::Free);
        assert!(!f.archive.segment_bitmap().is_set(0));
    }

    #[test]
    fn test_error_segment_is_skipped() {
        let f = fixture(4, 4, 0);
        f.archive.segment_info(0).restore(1, 0, SegmentState::Error);
        let state = f.archive.lock();
        assert_eq!(f.io.allocate_user_data_segment_id(&state), Some(1));
    }

    #[test]
    fn test_invalid_arguments() {
        let f = fixture(4, 4, 0);
        assert!(matches!(
            f.io.allocate_write_buffer_blks(2, 1),
            Err(AllocatorError::InvalidArgument(_))
        ));
        assert!(matches!(
            f.io.allocate_write_buffer_blks(0, 0),
            Err(AllocatorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_segment_allocation_skips_rebuild_targets() {
        let f = fixture(4, 4, 0);
        let mut state = f.archive.lock();
        state.insert_rebuild_target(0);
        state.insert_rebuild_target(2);
        assert_eq!(f.io.allocate_user_data_segment_id(&state), Some(1));
        assert_eq!(f.io.allocate_user_data_segment_id(&state), Some(3));
        assert_eq!(f.io.allocate_user_data_segment_id(&state), None);
    }

    #[test]
    fn test_concurrent_allocation_never_shares_blocks() {
        let f = Arc::new(fixture(64, 32, 0));
        let handles: Vec<_> = (0..2)
            .map(|volume_id| {
                let f = f.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..40 {
                        got.push(f.io.allocate_write_buffer_blks(volume_id, 3).unwrap());
                    }
                    got
                })
            })
            .collect();

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for blks in handle.join().unwrap() {
                for offset in blks.start.offset..blks.end_offset() {
                    assert!(seen.insert((blks.start.stripe_id, offset)));
                }
            }
        }
    }
}
