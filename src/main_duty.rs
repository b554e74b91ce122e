//! Drain operations: close active stripes and wait for them to reach the
//! user-data area.

use std::sync::Arc;
use tracing::{debug, info};

use crate::address::{StripeId, VolumeId};
use crate::common_duty::CommonDuty;
use crate::error::AllocatorResult;
use crate::mapper::Mapper;
use crate::stripe::Stripe;

pub struct MainDuty {
    common: Arc<CommonDuty>,
}

impl MainDuty {
    pub fn new(common: Arc<CommonDuty>) -> Self {
        Self { common }
    }

    /// Wait until every stripe in `stripes_to_flush` has all of its blocks
    /// written, and every stripe in `vsids_to_check` has left the write
    /// buffer.
    pub fn finalize_write_io(
        &self,
        stripes_to_flush: &[Arc<Stripe>],
        vsids_to_check: &[StripeId],
    ) -> AllocatorResult<()> {
        for stripe in stripes_to_flush {
            self.common.wait_until(|| stripe.blks_remaining() == 0);
        }
        let mapper = self.common.mapper();
        for &vsid in vsids_to_check {
            self.common
                .wait_until(|| !mapper.get_lsa(vsid).is_in_write_buffer());
        }
        debug!(
            stripes = stripes_to_flush.len(),
            vsids = vsids_to_check.len(),
            "write io finalized"
        );
        Ok(())
    }

    /// Close every active stripe and wait for them.
    pub fn flush_all_user_data(&self) -> AllocatorResult<()> {
        let mut stripes = Vec::new();
        let mut vsids = Vec::new();
        self.common
            .check_all_active_stripes(&mut stripes, &mut vsids)?;
        info!(
            stripes = stripes.len(),
            vsids = vsids.len(),
            "flushing all user data"
        );
        self.finalize_write_io(&stripes, &vsids)
    }

    /// Close a volume's active stripes and wait for them.
    pub fn volume_unmounted(&self, volume_id: VolumeId) -> AllocatorResult<()> {
        let mut stripes = Vec::new();
        let mut vsids = Vec::new();
        self.common
            .pick_active_stripe(volume_id, &mut stripes, &mut vsids)?;
        info!(volume_id, stripes = stripes.len(), "volume unmounted");
        self.finalize_write_io(&stripes, &vsids)
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::address::{AddressInfo, VirtualBlockAddress};
    use crate::archive::AllocatorMetaArchive;
    use crate::config::GcConfig;
    use crate::gc_duty::GcDuty;
    use crate::io_duty::IoDuty;
    use crate::mapper::{MemMapper, RecordingFlusher};
    use crate::meta_file::MemFile;
    use std::time::Duration;

    struct Fixture {
        archive: Arc<AllocatorMetaArchive>,
        flusher: Arc<RecordingFlusher>,
        common: Arc<CommonDuty>,
        io: IoDuty,
        main: MainDuty,
    }

    fn fixture() -> Arc<Fixture> {
        let info = AddressInfo::new(4, 4, 1, 16, 8, 4, 2);
        let archive = Arc::new(AllocatorMetaArchive::new(
            info,
            Arc::new(MemFile::new("meta")),
            Arc::new(MemFile::new("rebuild")),
        ));
        archive.init().unwrap();
        let gc = Arc::new(GcDuty::new(
            archive.clone(),
            &GcConfig {
                normal_threshold: 0,
                urgent_threshold: 0,
            },
        ));
        let flusher = Arc::new(RecordingFlusher::new());
        let common = Arc::new(CommonDuty::new(
            archive.clone(),
            gc.clone(),
            Arc::new(MemMapper::new(4)),
            flusher.clone(),
        ));
        let io = IoDuty::new(archive.clone(), gc, common.clone());
        let main = MainDuty::new(common.clone());
        Arc::new(Fixture {
            archive,
            flusher,
            common,
            io,
            main,
        })
    }

    // completes flush requests until none arrive for a while
    fn spawn_flush_completer(f: &Arc<Fixture>) -> std::thread::JoinHandle<usize> {
        let f = f.clone();
        std::thread::spawn(move || {
            let mut completed = 0;
            while let Some(wb_lsid) = f.flusher.recv_timeout(Duration::from_millis(200)) {
                f.common.stripe_flushed(wb_lsid).unwrap();
                completed += 1;
            }
            completed
        })
    }

    #[test]
    fn test_flush_all_user_data() {
        let f = fixture();
        let a = f.io.allocate_write_buffer_blks(0, 1).unwrap();
        let b = f.io.allocate_write_buffer_blks(1, 2).unwrap();
        f.common.complete_write(a).unwrap();
        f.common.complete_write(b).unwrap();

        let completer = spawn_flush_completer(&f);
        f.main.flush_all_user_data().unwrap();
        assert_eq!(completer.join().unwrap(), 2);

        assert_eq!(f.archive.wb_lsid_bitmap().num_bits_set(), 0);
        for volume_id in 0..2 {
            let index = f.archive.info().tail_index(volume_id, false);
            assert!(f.archive.active_stripe_tail(index).is_unmapped());
        }
    }

    #[test]
    fn test_flush_waits_for_outstanding_writes() {
        let f = fixture();
        let blks = f.io.allocate_write_buffer_blks(0, 2).unwrap();
        let completer = spawn_flush_completer(&f);

        let f2 = f.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            f2.common.complete_write(blks).unwrap();
        });
        f.main.flush_all_user_data().unwrap();
        writer.join().unwrap();
        assert_eq!(completer.join().unwrap(), 1);
    }

    #[test]
    fn test_full_tail_is_waited_on() {
        let f = fixture();
        let blks = f.io.allocate_write_buffer_blks(0, 4).unwrap();
        f.common.complete_write(blks).unwrap();
        assert_eq!(f.flusher.requested(), vec![0]);

        let completer = spawn_flush_completer(&f);
        f.main.volume_unmounted(0).unwrap();
        assert!(f.common.mapper().get_lsa(0).is_in_user_data());
        assert_eq!(completer.join().unwrap(), 1);
    }

    #[test]
    fn test_volume_unmounted_leaves_other_volumes() {
        let f = fixture();
        let a = f.io.allocate_write_buffer_blks(0, 1).unwrap();
        let b = f.io.allocate_write_buffer_blks(1, 1).unwrap();
        f.common.complete_write(a).unwrap();
        f.common.complete_write(b).unwrap();

        let completer = spawn_flush_completer(&f);
        f.main.volume_unmounted(0).unwrap();
        completer.join().unwrap();

        let other = f.archive.info().tail_index(1, false);
        assert_eq!(
            f.archive.active_stripe_tail(other),
            VirtualBlockAddress::new(b.start.stripe_id, 1)
        );
        assert!(f.common.is_valid_write_buffer_stripe_id(1));
    }
}
