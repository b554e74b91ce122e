//! pos-allocator: write-buffer stripe and user segment allocation for a
//! log-structured SSD array.
//!
//! Host writes land in a fixed pool of write-buffer stripes staged in
//! NVRAM. Each stripe is later flushed to a stripe of a user-data segment
//! on the SSDs. This crate decides where every block goes and keeps the
//! bookkeeping that makes that decision durable:
//!
//! - **Bitmaps**: claimed write-buffer stripes and claimed segments
//! - **Segments**: per-segment valid block and occupied stripe counts with a
//!   `Free -> Nvram -> Ssd -> Victim -> Free` lifecycle
//! - **Active stripe tails**: one user and one GC append point per volume
//! - **Metadata archive**: a fixed-layout main file and a separate rebuild
//!   target file
//! - **Duties**: allocation ([`IoDuty`]), stripe finishing and flush
//!   completion ([`CommonDuty`]), GC bookkeeping ([`GcDuty`]), drains
//!   ([`MainDuty`]), rebuild ([`ArrayDuty`]) and journal replay
//!   ([`JournalManagerDuty`])
//!
//! # Architecture
//!
//! ```text
//!   host write           GC copy            journal replay     rebuild
//!       |                   |                     |               |
//!       v                   v                     v               v
//!  +---------------------------------+   +----------------+  +-----------+
//!  |             IoDuty              |   | JournalManager |  | ArrayDuty |
//!  +---------------------------------+   +----------------+  +-----------+
//!       |                                      |                  |
//!       v                                      v                  v
//!  +----------------------------------------------------------------------+
//!  |      CommonDuty (stripe pool, buffers, finish, flush completion)     |
//!  +----------------------------------------------------------------------+
//!       |                    |                        |
//!       v                    v                        v
//!  +---------+     +--------------------+     +-----------------+
//!  | GcDuty  |     | AllocatorMetaArchive|    | Mapper, Flusher |
//!  +---------+     +--------------------+     +-----------------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pos_allocator::*;
//!
//! let config = AllocatorConfig::load("allocator.toml")?;
//! let allocator = Allocator::open(config, mapper, flusher)?;
//!
//! let blks = allocator.allocate_write_buffer_blks(0, 8)?;
//! // ... write the blocks into the stripe buffers ...
//! allocator.complete_write(blks)?;
//! ```

#![warn(clippy::all)]

pub mod address;
pub mod allocator;
pub mod archive;
pub mod array_duty;
pub mod bitmap;
pub mod buffer_pool;
pub mod common_duty;
pub mod config;
pub mod error;
pub mod gc_duty;
pub mod io_duty;
pub mod journal_duty;
pub mod logging;
pub mod main_duty;
pub mod mapper;
pub mod meta_file;
pub mod metrics;
pub mod segment;
pub mod stripe;
pub mod sync;

pub use address::{
    AddressInfo, BlkOffset, SegmentId, StripeAddr, StripeId, StripeLoc, TailIndex,
    VirtualBlockAddress, VirtualBlocks, VolumeId,
};
pub use allocator::Allocator;
pub use archive::{AllocatorMetaArchive, MetaLayout, MetaSection, MetaState};
pub use array_duty::ArrayDuty;
pub use bitmap::BitMap;
pub use buffer_pool::BufferPool;
pub use common_duty::CommonDuty;
pub use config::{AllocatorConfig, ConfigError, GcConfig, GeometryConfig, LoggingConfig};
pub use error::{AllocatorError, AllocatorResult};
pub use gc_duty::{GcDuty, GcMode};
pub use io_duty::{AllocationPause, IoDuty};
pub use journal_duty::JournalManagerDuty;
pub use main_duty::MainDuty;
pub use mapper::{Mapper, MemMapper, RecordingFlusher, StripeFlusher};
pub use meta_file::{FileStore, MemFile, MetaFile};
pub use metrics::AllocatorMetrics;
pub use segment::{SegmentInfo, SegmentState};
pub use stripe::{ReverseMapEntry, ReverseMapPack, Stripe};
