//! Rebuild bookkeeping.
//!
//! When a device fails every segment in use becomes a rebuild target.
//! Preparing a rebuild pauses allocation, records the targets, moves the
//! user-data cursor onto a fresh segment so new writes land outside the
//! targets, and drains the stripes still in flight. The rebuild worker then
//! takes targets one at a time and releases each once it is rebuilt.
//!
//! ```text
//! Idle --prepare_rebuild()--> Preparing (allocation paused)
//!   Preparing --targets recorded--> TargetsComputed
//!   TargetsComputed --cursor moved--> NextLsidReserved
//!   NextLsidReserved --stripes drained--> Idle (rebuild running)
//! ```

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::address::{SegmentId, StripeId};
use crate::archive::{AllocatorMetaArchive, MetaState};
use crate::common_duty::CommonDuty;
use crate::error::{AllocatorError, AllocatorResult};
use crate::gc_duty::GcDuty;
use crate::io_duty::IoDuty;
use crate::main_duty::MainDuty;
use crate::mapper::Mapper;
use crate::segment::SegmentState;

pub struct ArrayDuty {
    archive: Arc<AllocatorMetaArchive>,
    gc: Arc<GcDuty>,
    common: Arc<CommonDuty>,
    main: Arc<MainDuty>,
    io: Arc<IoDuty>,
}

impl ArrayDuty {
    pub fn new(
        archive: Arc<AllocatorMetaArchive>,
        gc: Arc<GcDuty>,
        common: Arc<CommonDuty>,
        main: Arc<MainDuty>,
        io: Arc<IoDuty>,
    ) -> Self {
        Self {
            archive,
            gc,
            common,
            main,
            io,
        }
    }

    /// Prepare for rebuilding every segment in use.
    ///
    /// Returns the number of rebuild targets; zero means there is nothing
    /// to rebuild. Allocation is paused for the duration and resumed on
    /// every path out.
    pub fn prepare_rebuild(&self) -> AllocatorResult<u32> {
        info!("prepare rebuild started");
        let pause = self.io.turn_off_blk_allocation();
        let result = self.prepare_rebuild_paused();
        self.io.turn_on_blk_allocation(pause);

        match &result {
            Ok(count) => info!(targets = count, "prepare rebuild done"),
            Err(e) => error!("prepare rebuild failed: {e}"),
        }
        result
    }

    fn prepare_rebuild_paused(&self) -> AllocatorResult<u32> {
        let count = self.make_rebuild_target()?;
        if count == 0 {
            info!("no user data segment to rebuild");
            return Ok(0);
        }

        self.set_next_ssd_lsid()?;

        let mut stripes_to_flush = Vec::new();
        let mut vsids_to_check = self.flush_online_stripes();
        self.common
            .check_all_active_stripes(&mut stripes_to_flush, &mut vsids_to_check)?;
        self.main
            .finalize_write_io(&stripes_to_flush, &vsids_to_check)?;
        Ok(count)
    }

    /// Make every segment in use a rebuild target and persist the set.
    fn make_rebuild_target(&self) -> AllocatorResult<u32> {
        let mut state = self.archive.lock();
        if !state.rebuild_targets.is_empty() {
            warn!(
                residue = ?state.rebuild_targets,
                "rebuild target set is not empty, clearing"
            );
            state.rebuild_targets.clear();
        }

        let bitmap = self.archive.segment_bitmap();
        let mut start = 0;
        while let Some(segment_id) = bitmap.find_first_set(start) {
            state.insert_rebuild_target(segment_id);
            info!(segment_id, "segment is a rebuild target");
            start = segment_id + 1;
        }

        self.archive.store_rebuild_segment_sync(&state)?;
        Ok(state.rebuild_targets.len() as u32)
    }

    /// Move the user-data cursor to the first stripe of a fresh segment.
    ///
    /// The stripes the cursor skips, on the segment it leaves and the
    /// reserved first stripe of the new one, will never be written and are
    /// discounted from their segments now.
    fn set_next_ssd_lsid(&self) -> AllocatorResult<()> {
        let info = *self.archive.info();
        let mut state = self.archive.lock();

        let Some(segment_id) = self.io.allocate_user_data_segment_id(&state) else {
            error!("no free segment to continue writing during rebuild");
            return Err(AllocatorError::NoFreeSegment);
        };
        let new_segment = self.archive.segment_info(segment_id);
        if let Err(e) = new_segment.move_to_nvram_state() {
            self.archive.segment_bitmap().clear_bit(segment_id);
            return Err(e);
        }

        let old_lsid = state.current_ssd_lsid;
        let sps = info.stripes_per_segment();
        let skipped = sps - 1 - old_lsid % sps;
        if skipped > 0 {
            let old_segment = info.segment_of(old_lsid);
            self.discount_stripes(&mut state, old_segment, skipped)?;
        }
        self.discount_stripes(&mut state, segment_id, 1)?;

        state.prev_ssd_lsid = old_lsid;
        state.current_ssd_lsid = info.first_stripe_of(segment_id);
        info!(
            segment_id,
            current_ssd_lsid = state.current_ssd_lsid,
            "next ssd lsid reserved"
        );
        Ok(())
    }

    fn discount_stripes(
        &self,
        state: &mut MetaState,
        segment_id: SegmentId,
        count: u32,
    ) -> AllocatorResult<()> {
        let released = self
            .archive
            .segment_info(segment_id)
            .decrease_occupied_stripe_count(count);
        if released == Some(true) {
            self.gc.free_user_data_segment_id_locked(state, segment_id)?;
        }
        Ok(())
    }

    /// Full stripes of target segments still waiting on their flush.
    fn flush_online_stripes(&self) -> Vec<StripeId> {
        let info = *self.archive.info();
        let targets: Vec<SegmentId> = self.archive.lock().rebuild_targets.iter().copied().collect();
        let mapper = self.common.mapper();

        let mut vsids = Vec::new();
        for segment_id in targets {
            let start = info.first_stripe_of(segment_id);
            for vsid in start..start + info.stripes_per_segment() {
                let lsa = mapper.get_lsa(vsid);
                let Some(stripe) = self.common.get_stripe_by_addr(lsa) else {
                    continue;
                };
                if !stripe.is_finished() && stripe.blks_remaining() == 0 {
                    vsids.push(stripe.vsid());
                }
            }
        }
        vsids
    }

    /// Abandon the rebuild, dropping every target.
    pub fn stop_rebuilding(&self) -> AllocatorResult<()> {
        let mut state = self.archive.lock();
        if state.rebuild_targets.is_empty() {
            info!("rebuild already done or never started");
            return Err(AllocatorError::RebuildTargetSetEmpty);
        }
        state.rebuild_targets.clear();
        self.archive.store_rebuild_segment_sync(&state)
    }

    /// Whether targets persisted by an interrupted rebuild were loaded.
    pub fn need_rebuild_again(&self) -> bool {
        self.archive.need_rebuild_cont()
    }

    /// The lowest target still awaiting rebuild.
    ///
    /// Targets GC freed in the meantime are dropped along the way. The
    /// returned target stays in the set until
    /// [`release_rebuild_segment`](Self::release_rebuild_segment).
    pub fn get_rebuild_target_segment(&self) -> Option<SegmentId> {
        let mut state = self.archive.lock();
        while let Some(&segment_id) = state.rebuild_targets.first() {
            if self.archive.segment_info(segment_id).state() == SegmentState::Free {
                info!(segment_id, "rebuild target was freed by gc");
                state.remove_rebuild_target(segment_id);
                continue;
            }
            info!(segment_id, "segment is going to be rebuilt");
            return Some(segment_id);
        }
        None
    }

    /// Mark `segment_id` rebuilt. A segment no longer in the set is
    /// ignored.
    pub fn release_rebuild_segment(&self, segment_id: SegmentId) -> AllocatorResult<()> {
        let mut state = self.archive.lock();
        if !state.remove_rebuild_target(segment_id) {
            info!(segment_id, "segment not in rebuild targets, likely freed by gc");
            return Ok(());
        }
        info!(segment_id, "segment rebuild done");
        self.archive.store_rebuild_segment_sync(&state)
    }
}
