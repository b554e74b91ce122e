//! Address types and array geometry.
//!
//! Three id spaces meet in the allocator:
//!
//! - **VSID**: the virtual stripe id handed to the block layer. For user
//!   data it is identical to the user-area lsid.
//! - **WB-LSID**: index into the fixed write-buffer stripe pool.
//! - **User-LSID**: stripe index inside the user-data area. The owning
//!   segment is `lsid / stripes_per_segment`.

use crate::config::GeometryConfig;

/// Stripe id in any of the three id spaces.
pub type StripeId = u32;
/// User-data segment id.
pub type SegmentId = u32;
/// Volume id.
pub type VolumeId = u32;
/// Block offset inside a stripe.
pub type BlkOffset = u32;

/// Sentinel for an unassigned stripe id.
pub const UNMAP_STRIPE: StripeId = u32::MAX;
/// Sentinel for an unassigned offset.
pub const UNMAP_OFFSET: BlkOffset = u32::MAX;
/// Sentinel for an unassigned segment id.
pub const UNMAP_SEGMENT: SegmentId = u32::MAX;

/// A block address in virtual stripe space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualBlockAddress {
    /// Virtual stripe id.
    pub stripe_id: StripeId,
    /// Block offset inside the stripe.
    pub offset: BlkOffset,
}

impl VirtualBlockAddress {
    /// The unmapped address. Used as the "no stripe assigned" tail value.
    pub const UNMAP: Self = Self {
        stripe_id: UNMAP_STRIPE,
        offset: UNMAP_OFFSET,
    };

    /// Serialized size in bytes.
    pub const SIZE: usize = 8;

    /// Create an address.
    pub const fn new(stripe_id: StripeId, offset: BlkOffset) -> Self {
        Self { stripe_id, offset }
    }

    /// Check if no stripe is assigned.
    #[inline]
    pub fn is_unmapped(&self) -> bool {
        self.stripe_id == UNMAP_STRIPE
    }

    /// Write the address as two little-endian u32s.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.stripe_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_le_bytes());
    }

    /// Read an address written by [`write_to`](Self::write_to).
    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            stripe_id: read_u32(buf, 0),
            offset: read_u32(buf, 4),
        }
    }
}

impl Default for VirtualBlockAddress {
    fn default() -> Self {
        Self::UNMAP
    }
}

/// A run of blocks starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualBlocks {
    /// First block of the run.
    pub start: VirtualBlockAddress,
    /// Number of blocks in the run.
    pub num_blks: u32,
}

impl VirtualBlocks {
    /// Create a run.
    pub const fn new(start: VirtualBlockAddress, num_blks: u32) -> Self {
        Self { start, num_blks }
    }

    /// Offset one past the last block of the run.
    pub fn end_offset(&self) -> BlkOffset {
        self.start.offset + self.num_blks
    }
}

/// Which area a logical stripe currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeLoc {
    /// Staged in the NVRAM write buffer.
    WriteBuffer,
    /// Flushed to the user-data area.
    UserData,
}

/// Physical location of a virtual stripe, as recorded by the stripe map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeAddr {
    /// Area the stripe lives in.
    pub loc: StripeLoc,
    /// Stripe id inside that area.
    pub stripe_id: StripeId,
}

impl StripeAddr {
    /// The unmapped stripe address.
    pub const UNMAP: Self = Self {
        loc: StripeLoc::UserData,
        stripe_id: UNMAP_STRIPE,
    };

    /// Check if this address points nowhere.
    pub fn is_unmapped(&self) -> bool {
        self.stripe_id == UNMAP_STRIPE
    }

    /// Check if the stripe is still staged in the write buffer.
    pub fn is_in_write_buffer(&self) -> bool {
        !self.is_unmapped() && self.loc == StripeLoc::WriteBuffer
    }

    /// Check if the stripe lives in the user-data area.
    pub fn is_in_user_data(&self) -> bool {
        !self.is_unmapped() && self.loc == StripeLoc::UserData
    }
}

/// Index into the active-stripe-tail array.
///
/// The first `max_volumes` slots are user-I/O lanes, the second
/// `max_volumes` slots are GC lanes, one of each per volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TailIndex(pub usize);

impl TailIndex {
    /// Slot for a volume's user or GC lane.
    pub fn new(volume_id: VolumeId, is_gc: bool, max_volumes: u32) -> Self {
        let base = if is_gc { max_volumes as usize } else { 0 };
        Self(base + volume_id as usize)
    }

    /// Volume that owns this slot.
    pub fn volume_id(&self, max_volumes: u32) -> VolumeId {
        (self.0 % max_volumes as usize) as VolumeId
    }

    /// Check if this is a GC lane.
    pub fn is_gc(&self, max_volumes: u32) -> bool {
        self.0 >= max_volumes as usize
    }
}

/// Array geometry, derived once from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressInfo {
    blks_per_stripe: u32,
    stripes_per_segment: u32,
    chunks_per_stripe: u32,
    chunk_size: usize,
    num_wb_stripes: u32,
    num_user_area_segments: u32,
    max_volumes: u32,
}

impl AddressInfo {
    /// Build geometry from explicit values.
    pub fn new(
        blks_per_stripe: u32,
        stripes_per_segment: u32,
        chunks_per_stripe: u32,
        chunk_size: usize,
        num_wb_stripes: u32,
        num_user_area_segments: u32,
        max_volumes: u32,
    ) -> Self {
        Self {
            blks_per_stripe,
            stripes_per_segment,
            chunks_per_stripe,
            chunk_size,
            num_wb_stripes,
            num_user_area_segments,
            max_volumes,
        }
    }

    #[inline]
    pub fn blks_per_stripe(&self) -> u32 {
        self.blks_per_stripe
    }

    #[inline]
    pub fn stripes_per_segment(&self) -> u32 {
        self.stripes_per_segment
    }

    #[inline]
    pub fn blks_per_segment(&self) -> u32 {
        self.blks_per_stripe * self.stripes_per_segment
    }

    #[inline]
    pub fn chunks_per_stripe(&self) -> u32 {
        self.chunks_per_stripe
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub fn num_wb_stripes(&self) -> u32 {
        self.num_wb_stripes
    }

    #[inline]
    pub fn num_user_area_segments(&self) -> u32 {
        self.num_user_area_segments
    }

    #[inline]
    pub fn num_user_area_stripes(&self) -> u32 {
        self.num_user_area_segments * self.stripes_per_segment
    }

    #[inline]
    pub fn max_volumes(&self) -> u32 {
        self.max_volumes
    }

    /// Length of the active-stripe-tail array: a user and a GC lane per volume.
    #[inline]
    pub fn tail_array_len(&self) -> usize {
        2 * self.max_volumes as usize
    }

    /// Segment owning a user-area lsid.
    #[inline]
    pub fn segment_of(&self, lsid: StripeId) -> SegmentId {
        lsid / self.stripes_per_segment
    }

    /// Check if `lsid` is the first stripe of its segment.
    #[inline]
    pub fn is_first_stripe_of_segment(&self, lsid: StripeId) -> bool {
        lsid % self.stripes_per_segment == 0
    }

    /// First user-area lsid of a segment.
    #[inline]
    pub fn first_stripe_of(&self, segment_id: SegmentId) -> StripeId {
        segment_id * self.stripes_per_segment
    }

    /// Tail slot for a volume's user or GC lane.
    pub fn tail_index(&self, volume_id: VolumeId, is_gc: bool) -> TailIndex {
        TailIndex::new(volume_id, is_gc, self.max_volumes)
    }
}

impl From<&GeometryConfig> for AddressInfo {
    fn from(config: &GeometryConfig) -> Self {
        Self::new(
            config.blocks_per_stripe,
            config.stripes_per_segment,
            config.chunks_per_stripe,
            config.chunk_size,
            config.write_buffer_stripes,
            config.user_segments,
            config.max_volumes,
        )
    }
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}
