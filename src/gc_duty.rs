//! Free-segment accounting for garbage collection.
//!
//! GC decides when to run from the number of free user-data segments,
//! picks the segment with the most invalid blocks as its victim, and hands
//! fully invalidated segments back to the allocator. When free segments
//! drop to the urgent threshold, new user stripes are refused until GC has
//! freed enough space again.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::address::SegmentId;
use crate::archive::{AllocatorMetaArchive, MetaState};
use crate::config::GcConfig;
use crate::error::{AllocatorError, AllocatorResult};
use crate::segment::SegmentState;
use crate::sync::{AtomicBool, AtomicU32, Ordering};

/// How hard GC should be working right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    NoGc,
    NormalGc,
    UrgentGc,
}

pub struct GcDuty {
    archive: Arc<AllocatorMetaArchive>,
    normal_threshold: AtomicU32,
    urgent_threshold: AtomicU32,
    block_user_alloc: AtomicBool,
}

impl GcDuty {
    pub fn new(archive: Arc<AllocatorMetaArchive>, config: &GcConfig) -> Self {
        Self {
            archive,
            normal_threshold: AtomicU32::new(config.normal_threshold),
            urgent_threshold: AtomicU32::new(config.urgent_threshold),
            block_user_alloc: AtomicBool::new(false),
        }
    }

    /// User-data segments not currently claimed.
    pub fn get_num_of_free_user_data_segment(&self) -> u32 {
        let bitmap = self.archive.segment_bitmap();
        bitmap.num_bits() - bitmap.num_bits_set()
    }

    /// GC mode for `num_free_segments` free segments.
    pub fn get_current_gc_mode(&self, num_free_segments: u32) -> GcMode {
        if num_free_segments <= self.urgent_threshold.load(Ordering::Acquire) {
            GcMode::UrgentGc
        } else if num_free_segments <= self.normal_threshold.load(Ordering::Acquire) {
            GcMode::NormalGc
        } else {
            GcMode::NoGc
        }
    }

    /// GC mode for the current free-segment count.
    pub fn gc_mode(&self) -> GcMode {
        self.get_current_gc_mode(self.get_num_of_free_user_data_segment())
    }

    pub fn get_gc_threshold(&self) -> u32 {
        self.normal_threshold.load(Ordering::Acquire)
    }

    pub fn set_gc_threshold(&self, threshold: u32) {
        self.normal_threshold.store(threshold, Ordering::Release);
    }

    pub fn get_urgent_threshold(&self) -> u32 {
        self.urgent_threshold.load(Ordering::Acquire)
    }

    pub fn set_urgent_threshold(&self, threshold: u32) {
        self.urgent_threshold.store(threshold, Ordering::Release);
    }

    /// Refuse (or allow again) new user stripes that need a fresh segment.
    pub fn set_up_block_segment_alloc_for_user(&self, block: bool) {
        let prev = self.block_user_alloc.swap(block, Ordering::AcqRel);
        if prev != block {
            info!(block, "user segment allocation block changed");
        }
    }

    pub fn is_blocked_for_user_segment_alloc(&self) -> bool {
        self.block_user_alloc.load(Ordering::Acquire)
    }

    /// The `Ssd` segment with the most invalid blocks.
    ///
    /// A segment with nothing valid left ends the scan early.
    pub fn get_most_invalidated_segment(&self) -> Option<SegmentId> {
        let blks_per_segment = self.archive.info().blks_per_segment();
        let mut victim = None;
        let mut max_invalid = 0;

        for info in self.archive.segment_infos() {
            let Some(valid) = info.valid_block_count_if_ssd_state() else {
                continue;
            };
            let invalid = blks_per_segment - valid;
            if victim.is_none() || invalid > max_invalid {
                victim = Some(info.id());
                max_invalid = invalid;
            }
            if invalid == blks_per_segment {
                break;
            }
        }
        victim
    }

    /// Pick the most invalidated segment and mark it as the GC victim.
    pub fn select_victim_segment(&self) -> Option<SegmentId> {
        let segment_id = self.get_most_invalidated_segment()?;
        if self.archive.segment_info(segment_id).move_to_victim_state() {
            debug!(segment_id, "gc victim selected");
            Some(segment_id)
        } else {
            // lost a race with an invalidation that freed it
            None
        }
    }

    /// Return a fully invalidated segment to the free pool.
    pub fn free_user_data_segment_id(&self, segment_id: SegmentId) -> AllocatorResult<()> {
        let mut state = self.archive.lock();
        self.free_user_data_segment_id_locked(&mut state, segment_id)
    }

    /// [`free_user_data_segment_id`](Self::free_user_data_segment_id) for
    /// callers already holding the main lock.
    ///
    /// A segment with valid blocks left is refused and kept.
    pub(crate) fn free_user_data_segment_id_locked(
        &self,
        state: &mut MetaState,
        segment_id: SegmentId,
    ) -> AllocatorResult<()> {
        let info = self.archive.segment_info(segment_id);
        let valid = info.valid_block_count();
        if valid != 0 {
            error!(segment_id, valid, "refusing to free segment with valid blocks");
            return Err(AllocatorError::SegmentNotEmpty {
                segment: segment_id,
                valid,
            });
        }
        debug_assert!(matches!(
            info.state(),
            SegmentState::Free | SegmentState::Ssd | SegmentState::Victim
        ));

        info.reset();
        self.archive.segment_bitmap().clear_bit(segment_id);
        debug!(segment_id, "segment freed");

        if state.remove_rebuild_target(segment_id) {
            info!(segment_id, "freed segment dropped from rebuild targets");
            if let Err(e) = self.archive.store_rebuild_segment_sync(state) {
                warn!(segment_id, "failed to store rebuild targets: {e}");
                return Err(e);
            }
        }

        if self.is_blocked_for_user_segment_alloc()
            && self.get_num_of_free_user_data_segment() > self.get_urgent_threshold()
        {
            self.set_up_block_segment_alloc_for_user(false);
        }
        Ok(())
    }
}
