//! User-data segment state machine and block accounting.
//!
//! # State Transition Diagram
//!
//! ```text
//!            move_to_nvram_state()
//!   +------+ ------------------------> +-------+
//!   | Free |                           | Nvram |
//!   +------+ <----+                    +-------+
//!      ^          | all stripes flushed,    | all stripes flushed,
//!      |          | nothing valid           | something valid
//!      |          +-------------------------+
//!      |                                    v
//!      |  valid count reaches 0        +-------+
//!      +------------------------------ |  Ssd  |
//!      |                               +-------+
//!      |                                    | move_to_victim_state()
//!      |  valid count reaches 0             v
//!      |  (victim release allowed)     +--------+
//!      +------------------------------ | Victim |
//!                                      +--------+
//! ```
//!
//! A valid count underflow moves a segment of any state to `Error`. It
//! stays there: it is never claimed, settled, chosen as a victim or
//! released.
//!
//! The valid block count and occupied stripe count are atomics so readers
//! never block, but every transition and every zero-crossing check runs
//! under the per-segment state lock.

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::address::SegmentId;
use crate::error::{AllocatorError, AllocatorResult};
use crate::sync::{AtomicU32, Ordering};

/// Lifecycle state of a user-data segment.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Not allocated to any stripe.
    Free = 0,
    /// Claimed for new stripes, some still staged in the write buffer.
    Nvram = 1,
    /// Every stripe flushed to the user-data area.
    Ssd = 2,
    /// Selected by GC for relocation.
    Victim = 3,
    /// Faulted. Never left once entered.
    Error = 4,
}

impl SegmentState {
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Convert from the persisted representation.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SegmentState::Free),
            1 => Some(SegmentState::Nvram),
            2 => Some(SegmentState::Ssd),
            3 => Some(SegmentState::Victim),
            4 => Some(SegmentState::Error),
            _ => None,
        }
    }
}

/// Result of decreasing a segment's valid block count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecreaseResult {
    /// The segment was released to `Free` by this call.
    pub released: bool,
    /// State observed before the call.
    pub prior_state: SegmentState,
    /// Valid block count after the call.
    pub valid_count: u32,
}

/// Per-segment accounting.
pub struct SegmentInfo {
    id: SegmentId,
    blks_per_segment: u32,
    stripes_per_segment: u32,
    valid_block_count: AtomicU32,
    occupied_stripe_count: AtomicU32,
    state: Mutex<SegmentState>,
}

impl SegmentInfo {
    /// Create a `Free` segment with zeroed counts.
    pub fn new(id: SegmentId, blks_per_segment: u32, stripes_per_segment: u32) -> Self {
        Self {
            id,
            blks_per_segment,
            stripes_per_segment,
            valid_block_count: AtomicU32::new(0),
            occupied_stripe_count: AtomicU32::new(0),
            state: Mutex::new(SegmentState::Free),
        }
    }

    #[inline]
    pub fn id(&self) -> SegmentId {
        self.id
    }

    #[inline]
    pub fn valid_block_count(&self) -> u32 {
        self.valid_block_count.load(Ordering::Acquire)
    }

    /// Blocks not holding live data: `blks_per_segment - valid`.
    #[inline]
    pub fn invalid_block_count(&self) -> u32 {
        self.blks_per_segment - self.valid_block_count()
    }

    #[inline]
    pub fn occupied_stripe_count(&self) -> u32 {
        self.occupied_stripe_count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SegmentState {
        *self.state.lock()
    }

    /// Consistent `(valid, occupied, state)` triple.
    pub fn snapshot(&self) -> (u32, u32, SegmentState) {
        let state = self.state.lock();
        (
            self.valid_block_count(),
            self.occupied_stripe_count(),
            *state,
        )
    }

    /// Count `count` newly written blocks as valid. Returns the new count.
    ///
    /// A count past the blocks in a segment means the same blocks were
    /// validated twice; it is rejected and the segment left unchanged.
    pub fn increase_valid_block_count(&self, count: u32) -> AllocatorResult<u32> {
        let _state = self.state.lock();
        let current = self.valid_block_count.load(Ordering::Acquire);
        let next = current.saturating_add(count);
        if next > self.blks_per_segment {
            error!(
                segment_id = self.id,
                current, count, "valid block count overflow"
            );
            return Err(AllocatorError::ValidCountOverflow {
                segment: self.id,
                current,
                requested: count,
            });
        }
        self.valid_block_count.store(next, Ordering::Release);
        Ok(next)
    }

    /// Remove `count` blocks from the valid count.
    ///
    /// Releases the segment to `Free` when the count reaches zero and the
    /// segment is `Ssd`, or `Victim` with `allow_victim_release`.
    /// Underflow leaves the counts untouched, moves the segment to
    /// `Error` and returns an error.
    pub fn decrease_valid_block_count(
        &self,
        count: u32,
        allow_victim_release: bool,
    ) -> AllocatorResult<DecreaseResult> {
        let mut state = self.state.lock();
        let current = self.valid_block_count.load(Ordering::Acquire);
        if count > current {
            error!(
                segment_id = self.id,
                current, count, prior_state = ?*state, "valid block count underflow"
            );
            *state = SegmentState::Error;
            return Err(AllocatorError::ValidCountUnderflow {
                segment: self.id,
                current,
                requested: count,
            });
        }

        let valid_count = current - count;
        self.valid_block_count.store(valid_count, Ordering::Release);

        let prior_state = *state;
        let releasable = match prior_state {
            SegmentState::Ssd => true,
            SegmentState::Victim => allow_victim_release,
            _ => false,
        };
        let released = valid_count == 0 && releasable;
        if released {
            self.release_locked(&mut state);
            debug!(segment_id = self.id, ?prior_state, "segment released");
        }

        Ok(DecreaseResult {
            released,
            prior_state,
            valid_count,
        })
    }

    /// Claim a free segment for new stripes.
    ///
    /// Every stripe of the segment is counted occupied until its flush
    /// completes.
    pub fn move_to_nvram_state(&self) -> AllocatorResult<()> {
        let mut state = self.state.lock();
        if *state != SegmentState::Free {
            return Err(AllocatorError::InvalidStateTransition {
                segment: self.id,
                from: *state,
                to: SegmentState::Nvram,
            });
        }
        self.occupied_stripe_count
            .store(self.stripes_per_segment, Ordering::Release);
        *state = SegmentState::Nvram;
        Ok(())
    }

    /// Settle a segment whose stripes have all left the write buffer.
    ///
    /// Returns `true` if the segment held nothing valid and went straight
    /// back to `Free`.
    pub fn move_to_ssd_state_or_free(&self) -> bool {
        let mut state = self.state.lock();
        self.settle_locked(&mut state)
    }

    /// Mark an `Ssd` segment as a GC victim.
    pub fn move_to_victim_state(&self) -> bool {
        let mut state = self.state.lock();
        if *state != SegmentState::Ssd {
            debug!(segment_id = self.id, state = ?*state, "cannot become victim");
            return false;
        }
        *state = SegmentState::Victim;
        true
    }

    /// Valid block count, or `None` unless the segment is `Ssd`.
    pub fn valid_block_count_if_ssd_state(&self) -> Option<u32> {
        let state = self.state.lock();
        (*state == SegmentState::Ssd).then(|| self.valid_block_count())
    }

    /// Count `count` stripes as no longer occupying the segment.
    ///
    /// Returns `None` while stripes remain. Once the count reaches zero the
    /// segment is settled as by [`move_to_ssd_state_or_free`] and
    /// `Some(released)` is returned.
    ///
    /// # Panics
    ///
    /// Panics if more stripes are discounted than were occupied.
    ///
    /// [`move_to_ssd_state_or_free`]: Self::move_to_ssd_state_or_free
    pub fn decrease_occupied_stripe_count(&self, count: u32) -> Option<bool> {
        let mut state = self.state.lock();
        let prev = self.occupied_stripe_count.load(Ordering::Acquire);
        if count > prev {
            panic!(
                "segment {} occupied stripe count underflow: {} - {}",
                self.id, prev, count
            );
        }
        let next = prev - count;
        self.occupied_stripe_count.store(next, Ordering::Release);
        if next == 0 {
            Some(self.settle_locked(&mut state))
        } else {
            None
        }
    }

    /// Force the segment back to `Free` with zeroed counts.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        self.release_locked(&mut state);
    }

    /// Overwrite all fields, used when loading persisted metadata.
    pub fn restore(&self, valid: u32, occupied: u32, state: SegmentState) {
        let mut guard = self.state.lock();
        self.valid_block_count.store(valid, Ordering::Release);
        self.occupied_stripe_count.store(occupied, Ordering::Release);
        *guard = state;
    }

    fn settle_locked(&self, state: &mut SegmentState) -> bool {
        if *state == SegmentState::Error {
            return false;
        }
        if self.valid_block_count.load(Ordering::Acquire) == 0 {
            self.release_locked(state);
            true
        } else {
            *state = SegmentState::Ssd;
            false
        }
    }

    fn release_locked(&self, state: &mut SegmentState) {
        self.valid_block_count.store(0, Ordering::Release);
        self.occupied_stripe_count.store(0, Ordering::Release);
        *state = SegmentState::Free;
    }
}
