//! Point-in-time allocator statistics.

use crate::gc_duty::GcMode;

/// Snapshot of allocator occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorMetrics {
    /// Write-buffer stripes in the pool.
    pub total_wb_stripes: u32,
    /// Write-buffer stripes currently claimed.
    pub used_wb_stripes: u32,
    /// User-data segments in the array.
    pub total_segments: u32,
    /// User-data segments currently claimed.
    pub used_segments: u32,
    /// User-data segments free for allocation.
    pub free_segments: u32,
    /// Segments still awaiting rebuild.
    pub rebuild_targets: u32,
    /// GC mode for the current free-segment count.
    pub gc_mode: GcMode,
    /// New user stripes are refused until GC frees segments.
    pub user_alloc_blocked: bool,
    /// All block allocation is paused.
    pub alloc_paused: bool,
}

impl AllocatorMetrics {
    /// Segment utilization as a percentage (0.0 - 100.0).
    pub fn segment_utilization(&self) -> f64 {
        if self.total_segments == 0 {
            0.0
        } else {
            (self.used_segments as f64 / self.total_segments as f64) * 100.0
        }
    }

    /// Write-buffer utilization as a percentage (0.0 - 100.0).
    pub fn wb_utilization(&self) -> f64 {
        if self.total_wb_stripes == 0 {
            0.0
        } else {
            (self.used_wb_stripes as f64 / self.total_wb_stripes as f64) * 100.0
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    fn metrics(used_segments: u32, total_segments: u32) -> AllocatorMetrics {
        AllocatorMetrics {
            total_wb_stripes: 8,
            used_wb_stripes: 2,
            total_segments,
            used_segments,
            free_segments: total_segments - used_segments,
            rebuild_targets: 0,
            gc_mode: GcMode::NoGc,
            user_alloc_blocked: false,
            alloc_paused: false,
        }
    }

    #[test]
    fn test_utilization() {
        let m = metrics(25, 100);
        assert!((m.segment_utilization() - 25.0).abs() < 0.001);
        assert!((m.wb_utilization() - 25.0).abs() < 0.001);
    }

    #[test]
    fn test_utilization_empty() {
        assert_eq!(metrics(0, 0).segment_utilization(), 0.0);
    }
}
