//! The allocator façade.
//!
//! [`Allocator`] owns the metadata archive and wires up the duties that
//! operate on it. Collaborators (the stripe map and the flush engine) are
//! injected at construction.

use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

use crate::address::{AddressInfo, StripeId, TailIndex, VirtualBlocks, VolumeId};
use crate::archive::{AllocatorMetaArchive, MetaSection};
use crate::array_duty::ArrayDuty;
use crate::common_duty::CommonDuty;
use crate::config::AllocatorConfig;
use crate::error::{AllocatorError, AllocatorResult};
use crate::gc_duty::GcDuty;
use crate::io_duty::IoDuty;
use crate::journal_duty::JournalManagerDuty;
use crate::main_duty::MainDuty;
use crate::mapper::{Mapper, StripeFlusher};
use crate::meta_file::{FileStore, MetaFile};
use crate::metrics::AllocatorMetrics;
use crate::segment::SegmentState;

pub struct Allocator {
    config: AllocatorConfig,
    archive: Arc<AllocatorMetaArchive>,
    gc: Arc<GcDuty>,
    common: Arc<CommonDuty>,
    io: Arc<IoDuty>,
    main: Arc<MainDuty>,
    array: ArrayDuty,
    journal: JournalManagerDuty,
}

impl Allocator {
    /// Open an allocator whose metadata files live in `config.meta.dir`.
    pub fn open(
        config: AllocatorConfig,
        mapper: Arc<dyn Mapper>,
        flusher: Arc<dyn StripeFlusher>,
    ) -> AllocatorResult<Self> {
        let meta_file = Arc::new(FileStore::new(&config.meta.dir, &config.meta.file_name));
        let rebuild_file = Arc::new(FileStore::new(
            &config.meta.dir,
            &config.meta.rebuild_file_name,
        ));
        Self::new(config, meta_file, rebuild_file, mapper, flusher)
    }

    /// Build an allocator over the given metadata files.
    ///
    /// Existing files are loaded; missing files are created with a fresh
    /// layout.
    pub fn new(
        config: AllocatorConfig,
        meta_file: Arc<dyn MetaFile>,
        rebuild_file: Arc<dyn MetaFile>,
        mapper: Arc<dyn Mapper>,
        flusher: Arc<dyn StripeFlusher>,
    ) -> AllocatorResult<Self> {
        config
            .validate()
            .map_err(|e| AllocatorError::InvalidArgument(e.to_string()))?;

        let info = AddressInfo::from(&config.geometry);
        let archive = Arc::new(AllocatorMetaArchive::new(info, meta_file, rebuild_file));
        archive.init()?;

        let gc = Arc::new(GcDuty::new(archive.clone(), &config.gc));
        let common = Arc::new(CommonDuty::new(archive.clone(), gc.clone(), mapper, flusher));
        let io = Arc::new(IoDuty::new(archive.clone(), gc.clone(), common.clone()));
        let main = Arc::new(MainDuty::new(common.clone()));
        let array = ArrayDuty::new(
            archive.clone(),
            gc.clone(),
            common.clone(),
            main.clone(),
            io.clone(),
        );
        let journal = JournalManagerDuty::new(archive.clone(), common.clone(), io.clone());

        info!(
            blks_per_stripe = info.blks_per_stripe(),
            stripes_per_segment = info.stripes_per_segment(),
            wb_stripes = info.num_wb_stripes(),
            segments = info.num_user_area_segments(),
            "allocator ready"
        );

        Ok(Self {
            config,
            archive,
            gc,
            common,
            io,
            main,
            array,
            journal,
        })
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    #[inline]
    pub fn info(&self) -> &AddressInfo {
        self.archive.info()
    }

    pub fn archive(&self) -> &Arc<AllocatorMetaArchive> {
        &self.archive
    }

    pub fn gc_duty(&self) -> &Arc<GcDuty> {
        &self.gc
    }

    pub fn common_duty(&self) -> &Arc<CommonDuty> {
        &self.common
    }

    pub fn io_duty(&self) -> &Arc<IoDuty> {
        &self.io
    }

    pub fn main_duty(&self) -> &Arc<MainDuty> {
        &self.main
    }

    pub fn array_duty(&self) -> &ArrayDuty {
        &self.array
    }

    pub fn journal_duty(&self) -> &JournalManagerDuty {
        &self.journal
    }

    // -- write path --------------------------------------------------------

    /// See [`IoDuty::allocate_write_buffer_blks`].
    pub fn allocate_write_buffer_blks(
        &self,
        volume_id: VolumeId,
        num_blks: u32,
    ) -> AllocatorResult<VirtualBlocks> {
        self.io.allocate_write_buffer_blks(volume_id, num_blks)
    }

    /// See [`IoDuty::allocate_gc_blk`].
    pub fn allocate_gc_blk(
        &self,
        volume_id: VolumeId,
        num_blks: u32,
    ) -> AllocatorResult<VirtualBlocks> {
        self.io.allocate_gc_blk(volume_id, num_blks)
    }

    /// Blocks in `blks` reached the write buffer.
    pub fn complete_write(&self, blks: VirtualBlocks) -> AllocatorResult<()> {
        self.common.complete_write(blks)
    }

    pub fn validate_blks(&self, blks: VirtualBlocks) -> AllocatorResult<()> {
        self.common.validate_blks(blks)
    }

    /// Blocks in `blks` were overwritten or trimmed.
    pub fn invalidate_blks(&self, blks: VirtualBlocks) -> AllocatorResult<()> {
        self.common.invalidate_blks(blks, true)
    }

    /// The flush engine finished writing stripe `wb_lsid` to the user area.
    pub fn stripe_flushed(&self, wb_lsid: StripeId) -> AllocatorResult<()> {
        self.common.stripe_flushed(wb_lsid)
    }

    pub fn flush_all_user_data(&self) -> AllocatorResult<()> {
        self.main.flush_all_user_data()
    }

    pub fn volume_unmounted(&self, volume_id: VolumeId) -> AllocatorResult<()> {
        self.main.volume_unmounted(volume_id)
    }

    // -- rebuild / journal -------------------------------------------------

    pub fn prepare_rebuild(&self) -> AllocatorResult<u32> {
        self.array.prepare_rebuild()
    }

    /// See [`JournalManagerDuty::flush_metadata`].
    pub fn flush_metadata(
        &self,
        on_done: impl FnOnce(AllocatorResult<()>) + Send + 'static,
    ) -> AllocatorResult<()> {
        self.journal.flush_metadata(on_done)
    }

    /// Synchronously store all metadata.
    pub fn store(&self) -> AllocatorResult<()> {
        self.common.store()
    }

    /// Store metadata and close both files.
    pub fn close(&self) -> AllocatorResult<()> {
        self.archive.store_sync()?;
        self.archive.close()?;
        info!("allocator closed");
        Ok(())
    }

    // -- diagnostics -------------------------------------------------------

    pub fn metrics(&self) -> AllocatorMetrics {
        let info = self.archive.info();
        let rebuild_targets = self.archive.lock().rebuild_targets().len() as u32;
        let free_segments = self.gc.get_num_of_free_user_data_segment();
        AllocatorMetrics {
            total_wb_stripes: info.num_wb_stripes(),
            used_wb_stripes: self.archive.wb_lsid_bitmap().num_bits_set(),
            total_segments: info.num_user_area_segments(),
            used_segments: self.archive.segment_bitmap().num_bits_set(),
            free_segments,
            rebuild_targets,
            gc_mode: self.gc.get_current_gc_mode(free_segments),
            user_alloc_blocked: self.gc.is_blocked_for_user_segment_alloc(),
            alloc_paused: self.io.is_blk_allocation_blocked(),
        }
    }

    /// Human readable snapshot of the allocator metadata.
    pub fn instant_meta_info(&self) -> String {
        let info = *self.archive.info();
        let mut out = String::new();

        let (current, prev, targets) = {
            let state = self.archive.lock();
            (
                state.current_ssd_lsid(),
                state.prev_ssd_lsid(),
                state.rebuild_targets().clone(),
            )
        };

        let wb = self.archive.wb_lsid_bitmap();
        let segments = self.archive.segment_bitmap();
        let _ = writeln!(
            out,
            "wb lsid bitmap: {}/{} in use",
            wb.num_bits_set(),
            wb.num_bits()
        );
        let _ = writeln!(
            out,
            "segment bitmap: {}/{} in use",
            segments.num_bits_set(),
            segments.num_bits()
        );
        let _ = writeln!(out, "current ssd lsid: {current} (prev {prev})");

        let _ = writeln!(out, "active stripe tails:");
        for i in 0..info.tail_array_len() {
            let index = TailIndex(i);
            let tail = self.archive.active_stripe_tail(index);
            if tail.is_unmapped() {
                continue;
            }
            let lane = if index.is_gc(info.max_volumes()) {
                "gc"
            } else {
                "user"
            };
            let _ = writeln!(
                out,
                "  volume {} {lane}: stripe {} offset {}",
                index.volume_id(info.max_volumes()),
                tail.stripe_id,
                tail.offset
            );
        }

        let _ = writeln!(out, "segments:");
        for segment in self.archive.segment_infos() {
            let (valid, occupied, state) = segment.snapshot();
            if state == SegmentState::Free {
                continue;
            }
            let _ = writeln!(
                out,
                "  {}: {state:?} valid {valid} occupied {occupied}",
                segment.id()
            );
        }

        let _ = writeln!(out, "rebuild targets: {targets:?}");
        out
    }

    /// Offsets and sizes of each section in the main metadata file.
    pub fn bitmap_layout(&self) -> String {
        let layout = self.archive.layout();
        let mut out = String::new();
        for section in MetaSection::PERSISTED {
            let _ = writeln!(
                out,
                "{:<20} offset {:>8} size {:>8}",
                section.name(),
                layout.offset(section).unwrap_or_default(),
                layout.size(section)
            );
        }
        let _ = writeln!(out, "{:<20} {:>24}", "total", layout.total_size());
        out
    }

    /// Dump one section into `file`.
    pub fn get_meta(&self, section: MetaSection, file: &dyn MetaFile) -> AllocatorResult<()> {
        self.archive.dump_section(section, file)
    }

    /// Restore one section from a file written by [`get_meta`](Self::get_meta).
    pub fn set_meta(&self, section: MetaSection, file: &dyn MetaFile) -> AllocatorResult<()> {
        self.archive.load_section(section, file)
    }
}
