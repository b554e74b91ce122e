//! Error types for allocator operations.
//!
//! Exhaustion, paused allocation, I/O failure, a flush that is already
//! running and bad counts handed in by callers all come back as
//! [`AllocatorError`]. Conditions that mean the bitmaps or rebuild set are
//! already inconsistent are not represented here; those paths panic.

use std::io;

use crate::address::{SegmentId, StripeId};
use crate::segment::SegmentState;

/// Errors that can occur during allocator operations.
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// Every write-buffer stripe is in use.
    #[error("no free write buffer stripe")]
    NoFreeWriteBufferStripe,

    /// Every user-data segment is in use and no rebuild is pending.
    #[error("no free user data segment")]
    NoFreeSegment,

    /// Segments are exhausted while rebuild targets are still pending.
    /// Rebuild will eventually release segments, so callers may retry.
    #[error("no free user data segment while rebuild is in progress")]
    UnderRebuild,

    /// Allocation is paused, or user allocation is blocked by urgent GC.
    #[error("block allocation is blocked")]
    AllocationBlocked,

    /// The mapper refused to link a reverse map to a new stripe.
    #[error("failed to link reverse map for stripe (vsid {vsid}, wb_lsid {wb_lsid})")]
    ReverseMapLink {
        /// Virtual stripe id that was being linked.
        vsid: StripeId,
        /// Write-buffer stripe id that was being linked.
        wb_lsid: StripeId,
    },

    /// The stripe data buffer pool ran dry.
    #[error("stripe buffer pool exhausted")]
    BufferPoolExhausted,

    /// A decrement would take a segment's valid block count below zero.
    #[error("valid block count underflow on segment {segment}: {current} - {requested}")]
    ValidCountUnderflow {
        /// Segment whose count would underflow.
        segment: SegmentId,
        /// Count before the rejected decrement.
        current: u32,
        /// Amount the caller tried to subtract.
        requested: u32,
    },

    /// An increment would take a segment's valid block count past the
    /// blocks in a segment.
    #[error("valid block count overflow on segment {segment}: {current} + {requested}")]
    ValidCountOverflow {
        /// Segment whose count would overflow.
        segment: SegmentId,
        /// Count before the rejected increment.
        current: u32,
        /// Amount the caller tried to add.
        requested: u32,
    },

    /// A segment still holding valid blocks was asked to be freed.
    #[error("segment {segment} still has {valid} valid blocks")]
    SegmentNotEmpty {
        /// Segment that was to be freed.
        segment: SegmentId,
        /// Valid blocks it still holds.
        valid: u32,
    },

    /// More blocks were completed on a stripe than were handed out.
    #[error("stripe wb_lsid {wb_lsid} has {current} blocks in flight, {requested} completed")]
    RefCountUnderflow {
        /// Write-buffer slot of the stripe.
        wb_lsid: StripeId,
        /// Blocks in flight before the rejected completion.
        current: u32,
        /// Blocks the caller tried to complete.
        requested: u32,
    },

    /// A segment was asked to make a transition its state does not allow.
    #[error("segment {segment} cannot move from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Segment being transitioned.
        segment: SegmentId,
        /// State observed under the segment lock.
        from: SegmentState,
        /// Requested state.
        to: SegmentState,
    },

    /// A metadata flush is already in flight. Retry after it completes.
    #[error("allocator metadata flush already in progress")]
    FlushInProgress,

    /// Reading or writing a metadata file failed.
    #[error("metadata file {file} I/O failed: {source}")]
    MetaIo {
        /// Name of the metadata file.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Metadata read back from a file does not describe this geometry.
    #[error("corrupted allocator metadata: {0}")]
    CorruptedMeta(String),

    /// No rebuild is in progress.
    #[error("rebuild target segment set is empty")]
    RebuildTargetSetEmpty,

    /// A journal record described a stripe with an impossible block count.
    #[error("wrong block count {0}")]
    WrongBlockCount(u32),

    /// An argument was outside the configured geometry.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl AllocatorError {
    /// Wrap an I/O error raised against the named metadata file.
    pub fn meta_io(file: impl Into<String>, source: io::Error) -> Self {
        Self::MetaIo {
            file: file.into(),
            source,
        }
    }

    /// True when the caller can retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoFreeWriteBufferStripe
                | Self::UnderRebuild
                | Self::AllocationBlocked
                | Self::FlushInProgress
        )
    }
}

/// Result type for allocator operations.
pub type AllocatorResult<T> = Result<T, AllocatorError>;
