#![cfg(not(feature = "loom"))]
//! Rebuild flows through the allocator façade.

use crossbeam_channel::TryRecvError;
use pos_allocator::{
    Allocator, AllocatorConfig, AllocatorError, GeometryConfig, MemFile, MemMapper,
    RecordingFlusher, SegmentState, VirtualBlocks,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct Harness {
    allocator: Arc<Allocator>,
    flusher: Arc<RecordingFlusher>,
}

// 4 blocks per stripe, 2 stripes per segment
fn harness(segments: u32, wb_stripes: u32) -> Harness {
    let geometry = GeometryConfig::default()
        .blocks_per_stripe(4)
        .stripes_per_segment(2)
        .chunks_per_stripe(1)
        .chunk_size(64)
        .write_buffer_stripes(wb_stripes)
        .user_segments(segments)
        .max_volumes(2);
    let config = AllocatorConfig::new()
        .geometry(geometry)
        .gc_thresholds(0, 0);
    let flusher = Arc::new(RecordingFlusher::new());
    let allocator = Allocator::new(
        config,
        Arc::new(MemFile::new("meta")),
        Arc::new(MemFile::new("rebuild")),
        Arc::new(MemMapper::new(4)),
        flusher.clone(),
    )
    .unwrap();
    Harness {
        allocator: Arc::new(allocator),
        flusher,
    }
}

fn complete_flushes(h: &Harness) {
    for wb_lsid in h.flusher.drain() {
        h.allocator.stripe_flushed(wb_lsid).unwrap();
    }
}

/// Write a GC run and push its stripe through the flush engine if full.
fn write_gc(h: &Harness, volume: u32, n: u32) -> VirtualBlocks {
    let blks = h.allocator.allocate_gc_blk(volume, n).unwrap();
    h.allocator.complete_write(blks).unwrap();
    complete_flushes(h);
    blks
}

fn spawn_flush_completer(h: &Harness) -> (crossbeam_channel::Sender<()>, thread::JoinHandle<()>) {
    let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
    let allocator = h.allocator.clone();
    let flusher = h.flusher.clone();
    let handle = thread::spawn(move || {
        loop {
            if let Some(wb_lsid) = flusher.recv_timeout(Duration::from_millis(20)) {
                allocator.stripe_flushed(wb_lsid).unwrap();
            }
            if let Err(TryRecvError::Disconnected) = stopped.try_recv() {
                break;
            }
        }
        for wb_lsid in flusher.drain() {
            allocator.stripe_flushed(wb_lsid).unwrap();
        }
    });
    (stop, handle)
}

#[test]
fn test_rebuild_with_stripes_in_flight() {
    let h = harness(6, 8);
    let archive = h.allocator.archive().clone();

    // segment 0: one full stripe, one half written
    let full = h.allocator.allocate_write_buffer_blks(0, 4).unwrap();
    h.allocator.complete_write(full).unwrap();
    let half = h.allocator.allocate_write_buffer_blks(0, 2).unwrap();
    h.allocator.complete_write(half).unwrap();
    // segment 1: a full GC stripe
    let gc = h.allocator.allocate_gc_blk(1, 4).unwrap();
    h.allocator.complete_write(gc).unwrap();
    assert_eq!(gc.start.stripe_id, 2);

    let (stop, completer) = spawn_flush_completer(&h);
    assert_eq!(h.allocator.prepare_rebuild().unwrap(), 2);
    drop(stop);
    completer.join().unwrap();

    assert!(!h.allocator.metrics().alloc_paused);
    assert_eq!(archive.wb_lsid_bitmap().num_bits_set(), 0);
    let seg0 = archive.segment_info(0);
    assert_eq!(seg0.state(), SegmentState::Ssd);
    assert_eq!(seg0.valid_block_count(), 6);
    // the cursor skipped stripe 3, so segment 1 settled with one flush
    let seg1 = archive.segment_info(1);
    assert_eq!(seg1.state(), SegmentState::Ssd);
    assert_eq!(seg1.occupied_stripe_count(), 0);
    // stripe 4 is reserved, new writes continue from stripe 5
    assert_eq!(archive.lock().current_ssd_lsid(), 4);
    assert_eq!(archive.segment_info(2).occupied_stripe_count(), 1);

    let next = h.allocator.allocate_write_buffer_blks(0, 1).unwrap();
    assert_eq!(next.start.stripe_id, 5);

    let array = h.allocator.array_duty();
    assert_eq!(array.get_rebuild_target_segment(), Some(0));
    // still there until released
    assert_eq!(array.get_rebuild_target_segment(), Some(0));
    array.release_rebuild_segment(0).unwrap();
    assert_eq!(array.get_rebuild_target_segment(), Some(1));
    array.release_rebuild_segment(1).unwrap();
    assert_eq!(array.get_rebuild_target_segment(), None);

    let err = array.stop_rebuilding().unwrap_err();
    assert!(matches!(err, AllocatorError::RebuildTargetSetEmpty));
}

#[test]
fn test_gc_frees_target_before_rebuild() {
    let h = harness(6, 8);
    let runs = [write_gc(&h, 0, 4), write_gc(&h, 0, 4)];
    write_gc(&h, 0, 4);
    write_gc(&h, 0, 4);

    assert_eq!(h.allocator.prepare_rebuild().unwrap(), 2);
    for blks in runs {
        h.allocator.invalidate_blks(blks).unwrap();
    }
    let archive = h.allocator.archive();
    assert_eq!(archive.segment_info(0).state(), SegmentState::Free);
    assert!(!archive.lock().is_rebuild_target(0));

    let array = h.allocator.array_duty();
    assert_eq!(array.get_rebuild_target_segment(), Some(1));
    // releasing a segment GC already took is not an error
    array.release_rebuild_segment(0).unwrap();
    array.release_rebuild_segment(1).unwrap();
    assert_eq!(array.get_rebuild_target_segment(), None);
}

#[test]
fn test_exhaustion_under_rebuild_is_transient() {
    let h = harness(3, 4);
    write_gc(&h, 0, 4);
    write_gc(&h, 0, 4);

    assert_eq!(h.allocator.prepare_rebuild().unwrap(), 1);
    // segment 1 was claimed by the rebuild, its first stripe skipped
    write_gc(&h, 0, 4);
    write_gc(&h, 0, 4);
    write_gc(&h, 0, 4);

    let err = h.allocator.allocate_gc_blk(0, 1).unwrap_err();
    assert!(matches!(err, AllocatorError::UnderRebuild));
    assert!(err.is_transient());
    assert_eq!(h.allocator.archive().wb_lsid_bitmap().num_bits_set(), 0);

    h.allocator
        .array_duty()
        .release_rebuild_segment(0)
        .unwrap();
    let err = h.allocator.allocate_gc_blk(0, 1).unwrap_err();
    assert!(matches!(err, AllocatorError::NoFreeSegment));
}

#[test]
fn test_rebuild_without_free_segment_resumes_allocation() {
    let h = harness(1, 4);
    write_gc(&h, 0, 4);

    let err = h.allocator.prepare_rebuild().unwrap_err();
    assert!(matches!(err, AllocatorError::NoFreeSegment));
    assert!(!h.allocator.io_duty().is_blk_allocation_blocked());
    // the targets stay recorded for the next attempt
    assert!(h.allocator.archive().lock().is_rebuild_target(0));
}

#[test]
fn test_pause_blocks_allocation() {
    let h = harness(4, 4);
    let pause = h.allocator.io_duty().turn_off_blk_allocation();
    assert!(h.allocator.metrics().alloc_paused);
    assert!(matches!(
        h.allocator.allocate_write_buffer_blks(0, 1),
        Err(AllocatorError::AllocationBlocked)
    ));
    assert!(matches!(
        h.allocator.allocate_gc_blk(0, 1),
        Err(AllocatorError::AllocationBlocked)
    ));
    h.allocator.io_duty().turn_on_blk_allocation(pause);
    h.allocator.allocate_write_buffer_blks(0, 1).unwrap();
}
