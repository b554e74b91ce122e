#![cfg(not(feature = "loom"))]
//! Crash recovery through journal replay.
//!
//! An allocator checkpoints, keeps allocating and "crashes" without
//! storing. A second allocator over the same files replays the journal
//! records for the lost work, and replaying any record twice must leave
//! it exactly as replaying once.

use pos_allocator::{
    Allocator, AllocatorConfig, GeometryConfig, Mapper, MemFile, MemMapper, MetaSection,
    RecordingFlusher, SegmentState, TailIndex, VirtualBlockAddress, VirtualBlocks,
};
use std::sync::Arc;

struct Node {
    allocator: Allocator,
    mapper: Arc<MemMapper>,
    flusher: Arc<RecordingFlusher>,
}

fn node(meta: &MemFile, rebuild: &MemFile) -> Node {
    let geometry = GeometryConfig::default()
        .blocks_per_stripe(4)
        .stripes_per_segment(2)
        .chunks_per_stripe(2)
        .chunk_size(64)
        .write_buffer_stripes(4)
        .user_segments(4)
        .max_volumes(2);
    let config = AllocatorConfig::new()
        .geometry(geometry)
        .gc_thresholds(0, 0);
    let mapper = Arc::new(MemMapper::new(4));
    let flusher = Arc::new(RecordingFlusher::new());
    let allocator = Allocator::new(
        config,
        Arc::new(meta.clone()),
        Arc::new(rebuild.clone()),
        mapper.clone(),
        flusher.clone(),
    )
    .unwrap();
    Node {
        allocator,
        mapper,
        flusher,
    }
}

fn snapshot(allocator: &Allocator) -> Vec<Vec<u8>> {
    MetaSection::PERSISTED
        .iter()
        .map(|&section| allocator.archive().section_bytes(section))
        .collect()
}

/// Journal records for a stripe opened at `vsid` in `wb_lsid` with
/// `written` blocks, as the log would hold them.
fn replay(node: &Node, index: TailIndex, vsid: u32, wb_lsid: u32, written: u32) {
    let journal = node.allocator.journal_duty();
    journal.replay_segment_allocation(vsid);
    journal.replay_stripe_allocation(vsid, wb_lsid);
    journal.replay_ssd_lsid(vsid);
    journal
        .restore_active_stripe_tail(index, VirtualBlockAddress::new(vsid, written), wb_lsid)
        .unwrap();
}

#[test]
fn test_replay_after_crash() {
    let meta = MemFile::new("meta");
    let rebuild = MemFile::new("rebuild");

    // checkpoint at an empty state, then lose three blocks of work
    {
        let crashed = node(&meta, &rebuild);
        crashed.allocator.store().unwrap();
        let blks = crashed.allocator.allocate_write_buffer_blks(0, 3).unwrap();
        assert_eq!(blks.start, VirtualBlockAddress::new(0, 0));
    }

    let recovered = node(&meta, &rebuild);
    assert_eq!(recovered.allocator.metrics().used_segments, 0);
    for offset in 0..3 {
        recovered
            .mapper
            .map_block(0, 100 + offset as u64, VirtualBlockAddress::new(0, offset));
    }

    replay(&recovered, TailIndex(0), 0, 0, 3);
    recovered
        .allocator
        .validate_blks(VirtualBlocks::new(VirtualBlockAddress::new(0, 0), 3))
        .unwrap();

    let archive = recovered.allocator.archive();
    assert!(archive.wb_lsid_bitmap().is_set(0));
    assert!(archive.segment_bitmap().is_set(0));
    assert_eq!(archive.segment_info(0).state(), SegmentState::Nvram);
    assert_eq!(archive.segment_info(0).valid_block_count(), 3);
    assert_eq!(archive.lock().current_ssd_lsid(), 0);

    let stripe = recovered.allocator.common_duty().get_stripe(0).clone();
    assert_eq!(stripe.vsid(), 0);
    assert_eq!(stripe.blks_remaining(), 1);
    let rev = stripe.reverse_map().unwrap();
    assert_eq!(rev.mapped_count(), 3);
    assert_eq!(rev.entry(2).map(|e| e.rba), Some(102));
    assert!(recovered.mapper.get_lsa(0).is_in_write_buffer());

    // writing resumes at the replayed tail and fills the stripe
    let blks = recovered.allocator.allocate_write_buffer_blks(0, 2).unwrap();
    assert_eq!(blks.start, VirtualBlockAddress::new(0, 3));
    assert_eq!(blks.num_blks, 1);
    recovered.allocator.complete_write(blks).unwrap();
    assert_eq!(recovered.flusher.requested(), vec![0]);

    recovered.allocator.stripe_flushed(0).unwrap();
    assert_eq!(archive.wb_lsid_bitmap().num_bits_set(), 0);
    assert_eq!(archive.segment_info(0).occupied_stripe_count(), 1);
}

#[test]
fn test_replay_twice_matches_once() {
    let once = node(&MemFile::new("meta"), &MemFile::new("rebuild"));
    replay(&once, TailIndex(0), 0, 0, 3);
    replay(&once, TailIndex(3), 2, 1, 2);

    let twice = node(&MemFile::new("meta"), &MemFile::new("rebuild"));
    for _ in 0..2 {
        replay(&twice, TailIndex(0), 0, 0, 3);
        replay(&twice, TailIndex(3), 2, 1, 2);
    }

    assert_eq!(snapshot(&once.allocator), snapshot(&twice.allocator));
    for allocator in [&once.allocator, &twice.allocator] {
        let pool = allocator.common_duty().buffer_pool();
        // two stripes bound, two chunks each
        assert_eq!(pool.available(), pool.capacity() - 4);
        assert_eq!(allocator.common_duty().get_stripe(0).blks_remaining(), 1);
        assert_eq!(allocator.common_duty().get_stripe(1).blks_remaining(), 2);
    }
}

#[test]
fn test_replayed_full_stripe_flushed_once() {
    let recovered = node(&MemFile::new("meta"), &MemFile::new("rebuild"));
    replay(&recovered, TailIndex(0), 0, 2, 4);
    replay(&recovered, TailIndex(0), 0, 2, 4);
    assert!(recovered.flusher.requested().is_empty());

    let journal = recovered.allocator.journal_duty();
    assert_eq!(journal.flush_full_active_stripes().unwrap(), 1);
    assert_eq!(journal.flush_full_active_stripes().unwrap(), 0);
    assert_eq!(recovered.flusher.requested(), vec![2]);

    journal.replay_stripe_flushed(2);
    journal.replay_stripe_flushed(2);
    assert_eq!(
        recovered.allocator.archive().wb_lsid_bitmap().num_bits_set(),
        0
    );
}

#[test]
fn test_flush_stripe_on_recovery() {
    let recovered = node(&MemFile::new("meta"), &MemFile::new("rebuild"));
    let journal = recovered.allocator.journal_duty();
    journal.replay_segment_allocation(2);
    journal.replay_stripe_allocation(2, 3);

    // a GC stripe left half written is padded out and flushed
    journal
        .flush_stripe(1, 3, VirtualBlockAddress::new(2, 2))
        .unwrap();
    assert_eq!(recovered.flusher.requested(), vec![3]);

    recovered.allocator.stripe_flushed(3).unwrap();
    let archive = recovered.allocator.archive();
    assert!(!archive.wb_lsid_bitmap().is_set(3));
    assert_eq!(archive.segment_info(1).occupied_stripe_count(), 1);
    assert!(recovered.mapper.get_lsa(2).is_in_user_data());
}

#[test]
fn test_tail_reset_and_listing() {
    let recovered = node(&MemFile::new("meta"), &MemFile::new("rebuild"));
    replay(&recovered, TailIndex(1), 0, 0, 1);
    let journal = recovered.allocator.journal_duty();

    let tails = journal.get_active_stripe_tail();
    assert_eq!(tails.len(), 4);
    assert_eq!(tails[1], VirtualBlockAddress::new(0, 1));
    assert!(tails[0].is_unmapped());

    journal.reset_active_stripe_tail(TailIndex(1));
    assert!(journal.get_active_stripe_tail()[1].is_unmapped());
}
