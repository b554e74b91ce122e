//! Durable allocator metadata.
//!
//! [`AllocatorMetaArchive`] owns every piece of allocator state that must
//! survive a restart and knows how to move it to and from its two
//! metadata files.
//!
//! # Main file layout
//!
//! Fixed order, little-endian, no version tag. Offsets are computed once
//! from the geometry by [`MetaLayout`]:
//!
//! ```text
//! +-------------------------------------------------------------+
//! | header: total_size u32, num_valid_wb_lsid u32,              |
//! |         num_valid_segment u32                               |
//! +-------------------------------------------------------------+
//! | write-buffer lsid bitmap (u64 words)                        |
//! +-------------------------------------------------------------+
//! | segment bitmap (u64 words)                                  |
//! +-------------------------------------------------------------+
//! | active stripe tails: 2 * max_volumes * (stripe u32, off u32)|
//! +-------------------------------------------------------------+
//! | current ssd lsid u32                                        |
//! +-------------------------------------------------------------+
//! | segment infos: (valid u32, occupied u32, state u32) each    |
//! +-------------------------------------------------------------+
//! ```
//!
//! # Rebuild file layout
//!
//! `[count u32][count * segment id u32]`, ids ascending.
//!
//! # Locking
//!
//! One main lock guards the header, the cursors and the rebuild-target
//! set, and serializes bitmap and segment-table mutations that must be
//! observed together. Each active stripe tail has its own lock. A tail
//! lock is always taken before the main lock, never after.

use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::address::{
    AddressInfo, SegmentId, StripeId, TailIndex, VirtualBlockAddress, read_u32, write_u32,
};
use crate::bitmap::BitMap;
use crate::error::{AllocatorError, AllocatorResult};
use crate::meta_file::{AsyncIoRequest, MetaFile};
use crate::segment::{SegmentInfo, SegmentState};
use crate::sync::{AtomicBool, Ordering};

/// Size of the serialized header.
pub const HEADER_SIZE: usize = 12;

/// Size of one serialized segment info.
pub const SEGMENT_INFO_SIZE: usize = 12;

/// A section of allocator metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaSection {
    Header,
    WbLsidBitmap,
    SegmentBitmap,
    ActiveStripeTail,
    CurrentSsdLsid,
    SegmentInfo,
    /// Per-segment invalid block counts. Dump only, not part of the file.
    SegmentInvalidCount,
}

impl MetaSection {
    /// Sections stored in the main file, in file order.
    pub const PERSISTED: [MetaSection; 6] = [
        MetaSection::Header,
        MetaSection::WbLsidBitmap,
        MetaSection::SegmentBitmap,
        MetaSection::ActiveStripeTail,
        MetaSection::CurrentSsdLsid,
        MetaSection::SegmentInfo,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MetaSection::Header => "header",
            MetaSection::WbLsidBitmap => "wb_lsid_bitmap",
            MetaSection::SegmentBitmap => "segment_bitmap",
            MetaSection::ActiveStripeTail => "active_stripe_tail",
            MetaSection::CurrentSsdLsid => "current_ssd_lsid",
            MetaSection::SegmentInfo => "segment_info",
            MetaSection::SegmentInvalidCount => "segment_invalid_count",
        }
    }

    /// Parse a section name as printed by [`name`](Self::name).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::PERSISTED
            .iter()
            .chain(std::iter::once(&MetaSection::SegmentInvalidCount))
            .find(|s| s.name() == name)
            .copied()
    }

    fn index(&self) -> Option<usize> {
        Self::PERSISTED.iter().position(|s| s == self)
    }
}

/// Byte offsets of each section in the main file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaLayout {
    offsets: [usize; 6],
    sizes: [usize; 6],
    total_size: usize,
    num_segments: usize,
}

impl MetaLayout {
    pub fn new(info: &AddressInfo) -> Self {
        let sizes = [
            HEADER_SIZE,
            BitMap::words_for(info.num_wb_stripes()) * 8,
            BitMap::words_for(info.num_user_area_segments()) * 8,
            info.tail_array_len() * VirtualBlockAddress::SIZE,
            4,
            info.num_user_area_segments() as usize * SEGMENT_INFO_SIZE,
        ];
        let mut offsets = [0; 6];
        let mut offset = 0;
        for (i, size) in sizes.iter().enumerate() {
            offsets[i] = offset;
            offset += size;
        }
        Self {
            offsets,
            sizes,
            total_size: offset,
            num_segments: info.num_user_area_segments() as usize,
        }
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Offset of a section in the main file. `None` for dump-only sections.
    pub fn offset(&self, section: MetaSection) -> Option<usize> {
        section.index().map(|i| self.offsets[i])
    }

    /// Serialized size of a section.
    pub fn size(&self, section: MetaSection) -> usize {
        match section.index() {
            Some(i) => self.sizes[i],
            None => self.num_segments * 4,
        }
    }

    fn range(&self, section: MetaSection) -> std::ops::Range<usize> {
        let i = section
            .index()
            .unwrap_or_else(|| panic!("{} is not stored in the meta file", section.name()));
        self.offsets[i]..self.offsets[i] + self.sizes[i]
    }
}

/// Header of the main file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaHeader {
    pub total_size: u32,
    pub num_valid_wb_lsid: u32,
    pub num_valid_segment: u32,
}

impl MetaHeader {
    fn write_to(&self, buf: &mut [u8]) {
        write_u32(buf, 0, self.total_size);
        write_u32(buf, 4, self.num_valid_wb_lsid);
        write_u32(buf, 8, self.num_valid_segment);
    }

    fn read_from(buf: &[u8]) -> Self {
        Self {
            total_size: read_u32(buf, 0),
            num_valid_wb_lsid: read_u32(buf, 4),
            num_valid_segment: read_u32(buf, 8),
        }
    }
}

/// State guarded by the main archive lock.
#[derive(Debug)]
pub struct MetaState {
    pub(crate) header: MetaHeader,
    pub(crate) current_ssd_lsid: StripeId,
    pub(crate) prev_ssd_lsid: StripeId,
    pub(crate) rebuild_targets: BTreeSet<SegmentId>,
    pub(crate) need_rebuild_cont: bool,
}

impl MetaState {
    pub fn header(&self) -> MetaHeader {
        self.header
    }

    /// Last user-data lsid handed out.
    pub fn current_ssd_lsid(&self) -> StripeId {
        self.current_ssd_lsid
    }

    pub fn prev_ssd_lsid(&self) -> StripeId {
        self.prev_ssd_lsid
    }

    pub fn rebuild_targets(&self) -> &BTreeSet<SegmentId> {
        &self.rebuild_targets
    }

    pub fn is_rebuild_target(&self, segment_id: SegmentId) -> bool {
        self.rebuild_targets.contains(&segment_id)
    }

    /// Add a rebuild target.
    ///
    /// # Panics
    ///
    /// Panics if the segment is already a target.
    pub(crate) fn insert_rebuild_target(&mut self, segment_id: SegmentId) {
        if !self.rebuild_targets.insert(segment_id) {
            panic!("segment {segment_id} is already a rebuild target");
        }
    }

    pub(crate) fn remove_rebuild_target(&mut self, segment_id: SegmentId) -> bool {
        self.rebuild_targets.remove(&segment_id)
    }
}

/// The allocator metadata archive.
pub struct AllocatorMetaArchive {
    info: AddressInfo,
    layout: MetaLayout,
    wb_lsid_bitmap: BitMap,
    segment_bitmap: BitMap,
    tails: Vec<Mutex<VirtualBlockAddress>>,
    segment_infos: Vec<SegmentInfo>,
    state: Mutex<MetaState>,
    meta_file: Arc<dyn MetaFile>,
    rebuild_file: Arc<dyn MetaFile>,
    flush_in_progress: Arc<AtomicBool>,
}

impl AllocatorMetaArchive {
    /// Build a default-initialized archive. Nothing is read or written
    /// until [`init`](Self::init).
    pub fn new(
        info: AddressInfo,
        meta_file: Arc<dyn MetaFile>,
        rebuild_file: Arc<dyn MetaFile>,
    ) -> Self {
        let layout = MetaLayout::new(&info);
        let segment_infos = (0..info.num_user_area_segments())
            .map(|id| SegmentInfo::new(id, info.blks_per_segment(), info.stripes_per_segment()))
            .collect();
        let tails = (0..info.tail_array_len())
            .map(|_| Mutex::new(VirtualBlockAddress::UNMAP))
            .collect();
        // the first allocation crosses a segment boundary and claims a segment
        let initial_lsid = info.stripes_per_segment() - 1;

        Self {
            info,
            layout,
            wb_lsid_bitmap: BitMap::new(info.num_wb_stripes()),
            segment_bitmap: BitMap::new(info.num_user_area_segments()),
            tails,
            segment_infos,
            state: Mutex::new(MetaState {
                header: MetaHeader {
                    total_size: layout.total_size() as u32,
                    ..Default::default()
                },
                current_ssd_lsid: initial_lsid,
                prev_ssd_lsid: initial_lsid,
                rebuild_targets: BTreeSet::new(),
                need_rebuild_cont: false,
            }),
            meta_file,
            rebuild_file,
            flush_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Load both files, or create and store them if they do not exist.
    pub fn init(&self) -> AllocatorResult<()> {
        if self.meta_file.exists() {
            self.open(&self.meta_file)?;
            self.load_sync()?;
            info!(file = self.meta_file.name(), "allocator meta loaded");
        } else {
            self.meta_file
                .create(self.layout.total_size() as u64)
                .map_err(|e| AllocatorError::meta_io(self.meta_file.name(), e))?;
            self.open(&self.meta_file)?;
            self.store_sync()?;
            info!(file = self.meta_file.name(), "allocator meta created");
        }

        if self.rebuild_file.exists() {
            self.open(&self.rebuild_file)?;
            self.load_rebuild_segment_sync()?;
        } else {
            self.rebuild_file
                .create(self.rebuild_file_size() as u64)
                .map_err(|e| AllocatorError::meta_io(self.rebuild_file.name(), e))?;
            self.open(&self.rebuild_file)?;
            let state = self.lock();
            self.store_rebuild_segment_sync(&state)?;
        }
        Ok(())
    }

    /// Close both files.
    pub fn close(&self) -> AllocatorResult<()> {
        self.meta_file
            .close()
            .map_err(|e| AllocatorError::meta_io(self.meta_file.name(), e))?;
        self.rebuild_file
            .close()
            .map_err(|e| AllocatorError::meta_io(self.rebuild_file.name(), e))
    }

    fn open(&self, file: &Arc<dyn MetaFile>) -> AllocatorResult<()> {
        if file.is_open() {
            return Ok(());
        }
        file.open()
            .map_err(|e| AllocatorError::meta_io(file.name(), e))
    }

    #[inline]
    pub fn info(&self) -> &AddressInfo {
        &self.info
    }

    #[inline]
    pub fn layout(&self) -> &MetaLayout {
        &self.layout
    }

    /// Acquire the main archive lock.
    pub fn lock(&self) -> MutexGuard<'_, MetaState> {
        self.state.lock()
    }

    /// Acquire the lock of one active stripe tail.
    pub fn tail_lock(&self, index: TailIndex) -> MutexGuard<'_, VirtualBlockAddress> {
        self.tails[index.0].lock()
    }

    /// Copy of one tail, taken under its lock.
    pub fn active_stripe_tail(&self, index: TailIndex) -> VirtualBlockAddress {
        *self.tail_lock(index)
    }

    #[inline]
    pub fn wb_lsid_bitmap(&self) -> &BitMap {
        &self.wb_lsid_bitmap
    }

    #[inline]
    pub fn segment_bitmap(&self) -> &BitMap {
        &self.segment_bitmap
    }

    #[inline]
    pub fn segment_info(&self, segment_id: SegmentId) -> &SegmentInfo {
        &self.segment_infos[segment_id as usize]
    }

    #[inline]
    pub fn segment_infos(&self) -> &[SegmentInfo] {
        &self.segment_infos
    }

    /// Rebuild targets were found on load.
    pub fn need_rebuild_cont(&self) -> bool {
        self.lock().need_rebuild_cont
    }

    pub fn is_flush_in_progress(&self) -> bool {
        self.flush_in_progress.load(Ordering::Acquire)
    }

    // -- main file ---------------------------------------------------------

    /// Read the main file and apply it.
    pub fn load_sync(&self) -> AllocatorResult<()> {
        let mut buffer = vec![0u8; self.layout.total_size()];
        self.meta_file
            .read_at(0, &mut buffer)
            .map_err(|e| AllocatorError::meta_io(self.meta_file.name(), e))?;
        self.meta_loaded(&buffer)
    }

    /// Read the main file asynchronously and apply it on completion.
    pub fn load(
        self: &Arc<Self>,
        on_done: impl FnOnce(AllocatorResult<()>) + Send + 'static,
    ) -> AllocatorResult<()> {
        let archive = self.clone();
        let request = AsyncIoRequest::read(0, self.layout.total_size(), move |ctx| {
            let result = match ctx.result {
                Ok(()) => archive.meta_loaded(&ctx.buffer),
                Err(e) => Err(AllocatorError::meta_io(archive.meta_file.name(), e)),
            };
            if let Err(e) = &result {
                error!("allocator meta load failed: {e}");
            }
            on_done(result);
        });
        self.meta_file
            .async_io(request)
            .map_err(|e| AllocatorError::meta_io(self.meta_file.name(), e))
    }

    /// Write every section to the main file.
    pub fn store_sync(&self) -> AllocatorResult<()> {
        let buffer = self.prepare_meta_store();
        self.meta_file
            .write_at(0, &buffer)
            .map_err(|e| AllocatorError::meta_io(self.meta_file.name(), e))
    }

    /// Write every section to the main file asynchronously.
    pub fn store(
        &self,
        on_done: impl FnOnce(AllocatorResult<()>) + Send + 'static,
    ) -> AllocatorResult<()> {
        let buffer = self.prepare_meta_store();
        let name = self.meta_file.name().to_string();
        let request = AsyncIoRequest::write(0, buffer, move |ctx| {
            let result = ctx.result.map_err(|e| AllocatorError::meta_io(name, e));
            debug!(ok = result.is_ok(), "allocator meta stored");
            on_done(result);
        });
        self.meta_file
            .async_io(request)
            .map_err(|e| AllocatorError::meta_io(self.meta_file.name(), e))
    }

    /// Write a prepared snapshot. At most one flush runs at a time; a second
    /// call before the first completes fails with
    /// [`AllocatorError::FlushInProgress`].
    ///
    /// The in-progress guard is released before `on_done` runs.
    pub fn flush(
        &self,
        buffer: Vec<u8>,
        on_done: impl FnOnce(AllocatorResult<()>) + Send + 'static,
    ) -> AllocatorResult<()> {
        if buffer.len() != self.layout.total_size() {
            return Err(AllocatorError::InvalidArgument(format!(
                "flush buffer is {} bytes, expected {}",
                buffer.len(),
                self.layout.total_size()
            )));
        }
        if self.flush_in_progress.swap(true, Ordering::AcqRel) {
            return Err(AllocatorError::FlushInProgress);
        }

        let guard = self.flush_in_progress.clone();
        let name = self.meta_file.name().to_string();
        let request = AsyncIoRequest::write(0, buffer, move |ctx| {
            let result = ctx.result.map_err(|e| AllocatorError::meta_io(name, e));
            guard.store(false, Ordering::Release);
            debug!(ok = result.is_ok(), "allocator meta flushed");
            on_done(result);
        });

        if let Err(e) = self.meta_file.async_io(request) {
            self.flush_in_progress.store(false, Ordering::Release);
            return Err(AllocatorError::meta_io(self.meta_file.name(), e));
        }
        Ok(())
    }

    /// Snapshot of every section except the active stripe tails.
    ///
    /// The caller holds the main lock; tails are filled in afterwards with
    /// [`copy_wbuf_tail`](Self::copy_wbuf_tail) under their own locks.
    pub fn get_copied_meta_buffer(&self, state: &mut MetaState) -> Vec<u8> {
        let mut buffer = vec![0u8; self.layout.total_size()];
        self.fill_locked_sections(state, &mut buffer);
        buffer
    }

    /// Copy one active stripe tail into a snapshot buffer.
    pub fn copy_wbuf_tail(&self, buffer: &mut [u8], index: TailIndex) {
        let tail = self.tail_lock(index);
        let at = self.layout.range(MetaSection::ActiveStripeTail).start
            + index.0 * VirtualBlockAddress::SIZE;
        tail.write_to(&mut buffer[at..at + VirtualBlockAddress::SIZE]);
    }

    fn prepare_meta_store(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; self.layout.total_size()];
        for i in 0..self.tails.len() {
            self.copy_wbuf_tail(&mut buffer, TailIndex(i));
        }
        let mut state = self.lock();
        self.fill_locked_sections(&mut state, &mut buffer);
        buffer
    }

    fn fill_locked_sections(&self, state: &mut MetaState, buffer: &mut [u8]) {
        state.header = MetaHeader {
            total_size: self.layout.total_size() as u32,
            num_valid_wb_lsid: self.wb_lsid_bitmap.num_bits_set(),
            num_valid_segment: self.segment_bitmap.num_bits_set(),
        };
        state
            .header
            .write_to(&mut buffer[self.layout.range(MetaSection::Header)]);
        self.wb_lsid_bitmap
            .write_to(&mut buffer[self.layout.range(MetaSection::WbLsidBitmap)]);
        self.segment_bitmap
            .write_to(&mut buffer[self.layout.range(MetaSection::SegmentBitmap)]);
        write_u32(
            buffer,
            self.layout.range(MetaSection::CurrentSsdLsid).start,
            state.current_ssd_lsid,
        );
        self.write_segment_infos(&mut buffer[self.layout.range(MetaSection::SegmentInfo)]);
    }

    fn write_segment_infos(&self, buf: &mut [u8]) {
        for (i, segment) in self.segment_infos.iter().enumerate() {
            let (valid, occupied, state) = segment.snapshot();
            let at = i * SEGMENT_INFO_SIZE;
            write_u32(buf, at, valid);
            write_u32(buf, at + 4, occupied);
            write_u32(buf, at + 8, state.as_u32());
        }
    }

    fn parse_segment_infos(&self, buf: &[u8]) -> AllocatorResult<Vec<(u32, u32, SegmentState)>> {
        (0..self.segment_infos.len())
            .map(|i| {
                let at = i * SEGMENT_INFO_SIZE;
                let valid = read_u32(buf, at);
                let occupied = read_u32(buf, at + 4);
                let raw = read_u32(buf, at + 8);
                let state = SegmentState::from_u32(raw).ok_or_else(|| {
                    AllocatorError::CorruptedMeta(format!("segment {i} has state {raw}"))
                })?;
                if valid > self.info.blks_per_segment()
                    || occupied > self.info.stripes_per_segment()
                {
                    return Err(AllocatorError::CorruptedMeta(format!(
                        "segment {i} counts out of range (valid {valid}, occupied {occupied})"
                    )));
                }
                Ok((valid, occupied, state))
            })
            .collect()
    }

    fn meta_loaded(&self, buffer: &[u8]) -> AllocatorResult<()> {
        let header = MetaHeader::read_from(&buffer[self.layout.range(MetaSection::Header)]);
        if header.total_size as usize != self.layout.total_size() {
            return Err(AllocatorError::CorruptedMeta(format!(
                "total size {} does not match layout size {}",
                header.total_size,
                self.layout.total_size()
            )));
        }
        if header.num_valid_wb_lsid > self.info.num_wb_stripes()
            || header.num_valid_segment > self.info.num_user_area_segments()
        {
            return Err(AllocatorError::CorruptedMeta(format!(
                "header counts out of range ({} wb stripes, {} segments)",
                header.num_valid_wb_lsid, header.num_valid_segment
            )));
        }
        let infos = self.parse_segment_infos(&buffer[self.layout.range(MetaSection::SegmentInfo)])?;

        let tail_start = self.layout.range(MetaSection::ActiveStripeTail).start;
        for (i, tail) in self.tails.iter().enumerate() {
            let at = tail_start + i * VirtualBlockAddress::SIZE;
            *tail.lock() = VirtualBlockAddress::read_from(&buffer[at..]);
        }

        let mut state = self.lock();
        state.header = header;
        restore_bitmap(
            &self.wb_lsid_bitmap,
            MetaSection::WbLsidBitmap,
            &buffer[self.layout.range(MetaSection::WbLsidBitmap)],
            header.num_valid_wb_lsid,
        );
        restore_bitmap(
            &self.segment_bitmap,
            MetaSection::SegmentBitmap,
            &buffer[self.layout.range(MetaSection::SegmentBitmap)],
            header.num_valid_segment,
        );
        state.header.num_valid_wb_lsid = self.wb_lsid_bitmap.num_bits_set();
        state.header.num_valid_segment = self.segment_bitmap.num_bits_set();
        state.current_ssd_lsid =
            read_u32(buffer, self.layout.range(MetaSection::CurrentSsdLsid).start);
        state.prev_ssd_lsid = state.current_ssd_lsid;
        for (segment, (valid, occupied, seg_state)) in self.segment_infos.iter().zip(infos) {
            segment.restore(valid, occupied, seg_state);
        }
        Ok(())
    }

    // -- rebuild file ------------------------------------------------------

    fn rebuild_file_size(&self) -> usize {
        4 + 4 * self.info.num_user_area_segments() as usize
    }

    fn prepare_rebuild_meta(state: &MetaState) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(4 + 4 * state.rebuild_targets.len());
        buffer.extend_from_slice(&(state.rebuild_targets.len() as u32).to_le_bytes());
        for segment_id in &state.rebuild_targets {
            buffer.extend_from_slice(&segment_id.to_le_bytes());
        }
        buffer
    }

    /// Persist the rebuild-target set. The caller holds the main lock.
    pub fn store_rebuild_segment_sync(&self, state: &MetaState) -> AllocatorResult<()> {
        let buffer = Self::prepare_rebuild_meta(state);
        self.rebuild_file
            .write_at(0, &buffer)
            .map_err(|e| AllocatorError::meta_io(self.rebuild_file.name(), e))?;
        debug!(count = state.rebuild_targets.len(), "rebuild segments stored");
        Ok(())
    }

    /// Persist the rebuild-target set asynchronously. The caller holds the
    /// main lock while the snapshot is taken.
    pub fn store_rebuild_segment(
        &self,
        state: &MetaState,
        on_done: impl FnOnce(AllocatorResult<()>) + Send + 'static,
    ) -> AllocatorResult<()> {
        let buffer = Self::prepare_rebuild_meta(state);
        let count = state.rebuild_targets.len();
        let name = self.rebuild_file.name().to_string();
        let request = AsyncIoRequest::write(0, buffer, move |ctx| {
            let result = ctx.result.map_err(|e| AllocatorError::meta_io(name, e));
            debug!(count, ok = result.is_ok(), "rebuild segments stored");
            on_done(result);
        });
        self.rebuild_file
            .async_io(request)
            .map_err(|e| AllocatorError::meta_io(self.rebuild_file.name(), e))
    }

    /// Load the rebuild-target set.
    pub fn load_rebuild_segment_sync(&self) -> AllocatorResult<()> {
        let mut buffer = vec![0u8; self.rebuild_file_size()];
        self.rebuild_file
            .read_at(0, &mut buffer)
            .map_err(|e| AllocatorError::meta_io(self.rebuild_file.name(), e))?;
        self.rebuild_meta_loaded(&buffer)
    }

    /// Load the rebuild-target set asynchronously.
    pub fn load_rebuild_segment(
        self: &Arc<Self>,
        on_done: impl FnOnce(AllocatorResult<()>) + Send + 'static,
    ) -> AllocatorResult<()> {
        let archive = self.clone();
        let request = AsyncIoRequest::read(0, self.rebuild_file_size(), move |ctx| {
            let result = match ctx.result {
                Ok(()) => archive.rebuild_meta_loaded(&ctx.buffer),
                Err(e) => Err(AllocatorError::meta_io(archive.rebuild_file.name(), e)),
            };
            on_done(result);
        });
        self.rebuild_file
            .async_io(request)
            .map_err(|e| AllocatorError::meta_io(self.rebuild_file.name(), e))
    }

    fn rebuild_meta_loaded(&self, buffer: &[u8]) -> AllocatorResult<()> {
        let count = read_u32(buffer, 0);
        if count > self.info.num_user_area_segments() {
            return Err(AllocatorError::CorruptedMeta(format!(
                "{count} rebuild targets for {} segments",
                self.info.num_user_area_segments()
            )));
        }

        let mut targets = BTreeSet::new();
        for i in 0..count as usize {
            let segment_id = read_u32(buffer, 4 + i * 4);
            if segment_id >= self.info.num_user_area_segments() || !targets.insert(segment_id) {
                return Err(AllocatorError::CorruptedMeta(format!(
                    "bad rebuild target segment {segment_id}"
                )));
            }
        }

        let mut state = self.lock();
        state.rebuild_targets = targets;
        state.need_rebuild_cont = count != 0;
        debug!(count, "rebuild segments loaded");
        Ok(())
    }

    // -- per-section dump / restore ----------------------------------------

    /// Serialize one section for diagnostics.
    ///
    /// Bitmap sections are prefixed with their population count.
    pub fn section_bytes(&self, section: MetaSection) -> Vec<u8> {
        match section {
            MetaSection::SegmentInvalidCount => self
                .segment_infos
                .iter()
                .flat_map(|s| s.invalid_block_count().to_le_bytes())
                .collect(),
            MetaSection::ActiveStripeTail => {
                let mut buffer = vec![0u8; self.layout.total_size()];
                for i in 0..self.tails.len() {
                    self.copy_wbuf_tail(&mut buffer, TailIndex(i));
                }
                buffer[self.layout.range(section)].to_vec()
            }
            _ => {
                let mut state = self.lock();
                let buffer = self.get_copied_meta_buffer(&mut state);
                drop(state);
                let body = &buffer[self.layout.range(section)];
                let population = match section {
                    MetaSection::WbLsidBitmap => Some(self.wb_lsid_bitmap.num_bits_set()),
                    MetaSection::SegmentBitmap => Some(self.segment_bitmap.num_bits_set()),
                    _ => None,
                };
                match population {
                    Some(count) => {
                        let mut out = count.to_le_bytes().to_vec();
                        out.extend_from_slice(body);
                        out
                    }
                    None => body.to_vec(),
                }
            }
        }
    }

    /// Apply bytes produced by [`section_bytes`](Self::section_bytes).
    pub fn restore_section(&self, section: MetaSection, bytes: &[u8]) -> AllocatorResult<()> {
        let prefix = match section {
            MetaSection::WbLsidBitmap | MetaSection::SegmentBitmap => 4,
            _ => 0,
        };
        let expected = prefix + self.layout.size(section);
        if bytes.len() != expected {
            return Err(AllocatorError::InvalidArgument(format!(
                "{} dump is {} bytes, expected {expected}",
                section.name(),
                bytes.len()
            )));
        }

        match section {
            MetaSection::Header => {
                let header = MetaHeader::read_from(bytes);
                self.lock().header = header;
            }
            MetaSection::WbLsidBitmap | MetaSection::SegmentBitmap => {
                let bitmap = if section == MetaSection::WbLsidBitmap {
                    &self.wb_lsid_bitmap
                } else {
                    &self.segment_bitmap
                };
                let count = read_u32(bytes, 0);
                if count > bitmap.num_bits() {
                    return Err(AllocatorError::CorruptedMeta(format!(
                        "{} population {count} exceeds {} bits",
                        section.name(),
                        bitmap.num_bits()
                    )));
                }
                let _state = self.lock();
                restore_bitmap(bitmap, section, &bytes[4..], count);
            }
            MetaSection::ActiveStripeTail => {
                for (i, tail) in self.tails.iter().enumerate() {
                    let at = i * VirtualBlockAddress::SIZE;
                    *tail.lock() = VirtualBlockAddress::read_from(&bytes[at..]);
                }
            }
            MetaSection::CurrentSsdLsid => {
                self.lock().current_ssd_lsid = read_u32(bytes, 0);
            }
            MetaSection::SegmentInfo => {
                let infos = self.parse_segment_infos(bytes)?;
                let _state = self.lock();
                for (segment, (valid, occupied, state)) in self.segment_infos.iter().zip(infos) {
                    segment.restore(valid, occupied, state);
                }
            }
            MetaSection::SegmentInvalidCount => {
                let _state = self.lock();
                for (i, segment) in self.segment_infos.iter().enumerate() {
                    let invalid = read_u32(bytes, i * 4);
                    if invalid > self.info.blks_per_segment() {
                        return Err(AllocatorError::CorruptedMeta(format!(
                            "segment {i} invalid count {invalid} out of range"
                        )));
                    }
                    let (_, occupied, state) = segment.snapshot();
                    segment.restore(self.info.blks_per_segment() - invalid, occupied, state);
                }
            }
        }
        info!(section = section.name(), "allocator meta section restored");
        Ok(())
    }

    /// Write one section to a dump file, creating it.
    pub fn dump_section(&self, section: MetaSection, file: &dyn MetaFile) -> AllocatorResult<()> {
        let bytes = self.section_bytes(section);
        let io = |e: std::io::Error| AllocatorError::meta_io(file.name(), e);
        file.create(bytes.len() as u64).map_err(io)?;
        file.open().map_err(io)?;
        file.write_at(0, &bytes).map_err(io)?;
        file.close().map_err(io)
    }

    /// Read one section from a dump file and apply it.
    pub fn load_section(&self, section: MetaSection, file: &dyn MetaFile) -> AllocatorResult<()> {
        let prefix = match section {
            MetaSection::WbLsidBitmap | MetaSection::SegmentBitmap => 4,
            _ => 0,
        };
        let mut bytes = vec![0u8; prefix + self.layout.size(section)];
        let io = |e: std::io::Error| AllocatorError::meta_io(file.name(), e);
        file.open().map_err(io)?;
        let read = file.read_at(0, &mut bytes).map_err(io);
        file.close().map_err(io)?;
        read?;
        self.restore_section(section, &bytes)
    }
}

/// Load bitmap words and set the population from the words themselves.
///
/// A stored count that disagrees with the words is logged and ignored.
fn restore_bitmap(bitmap: &BitMap, section: MetaSection, bytes: &[u8], stored_count: u32) {
    bitmap.read_from(bytes);
    let counted = bitmap.recount();
    if counted != stored_count {
        warn!(
            section = section.name(),
            stored_count, counted, "bitmap population mismatch, using counted bits"
        );
    }
}
