//! Space reservation
//!
//! Before a record is composed the writer reserves room for it in the
//! open block. Ordinary writers have to leave a number of free or
//! erasable blocks behind and drive the GC until they can; deletions are
//! held to a lower threshold so that freeing space never deadlocks on a
//! full filesystem. The GC reserves through its own path that never
//! re-enters the GC.

use chfs_common::{AllocPriority, Error, Lnr, Result};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

use crate::fs::Txn;
use crate::ledger::Space;
use crate::nodes::BlockQueue;

impl Txn<'_> {
    /// Make sure the open block has `size` free bytes
    pub(crate) fn reserve_space(&mut self, size: u32) -> Result<()> {
        if size > self.fs.eb_size {
            return Err(Error::invalid_argument(format!(
                "record of {size} bytes does not fit an eraseblock of {}",
                self.fs.eb_size
            )));
        }
        loop {
            if let Some(lnr) = self.m.nextblock {
                if self.fs.sizes.lock().block(lnr).free >= size {
                    return Ok(());
                }
                self.close_open_block(lnr)?;
            }
            if let Some(lnr) = self.m.blocks.front(BlockQueue::Free) {
                self.m.blocks.file(lnr, BlockQueue::Next);
                self.m.nextblock = Some(lnr);
                debug!(%lnr, "opened block for writing");
                continue;
            }
            if !self.remap_leb()? {
                debug!(size, "no free or erasable block left");
                return Err(Error::NoSpace);
            }
        }
    }

    fn close_open_block(&mut self, lnr: Lnr) -> Result<()> {
        let res = self.fs.wbuf.write().flush(&self.fs.ebh);
        match res {
            Ok(pad) => {
                self.fs
                    .sizes
                    .lock()
                    .transfer(lnr, Space::Free, Space::Wasted, pad);
                self.close_eraseblock(lnr);
                Ok(())
            }
            Err(e) => {
                warn!(%lnr, "flush before close failed: {e}");
                self.recover_lost_page(lnr)
            }
        }
    }

    /// Reserve as an ordinary writer
    pub(crate) fn reserve_space_normal(&mut self, size: u32, prio: AllocPriority) -> Result<()> {
        let t = self.fs.thresholds;
        let needed = match prio {
            AllocPriority::Normal => t.write_blocks,
            AllocPriority::Deletion => t.deletion_blocks,
        };
        let eb_size = u64::from(self.fs.eb_size);
        let max_passes = self.fs.config.gc.max_passes_per_reservation;

        let mut passes = 0;
        loop {
            let nr_free = self.m.blocks.len(BlockQueue::Free) as u64;
            let nr_erasable = self.m.blocks.len(BlockQueue::ErasePending) as u64;
            if nr_free + nr_erasable >= u64::from(needed) {
                break;
            }

            let totals = self.fs.sizes.lock().totals();
            let reclaimable =
                totals.dirty.saturating_sub(nr_erasable * eb_size) + totals.unchecked;
            if reclaimable < u64::from(t.nospc_dirty) {
                debug!(
                    size,
                    ?prio,
                    nr_free,
                    nr_erasable,
                    reclaimable,
                    "too little dirty space to collect"
                );
                return Err(Error::NoSpace);
            }
            if passes >= max_passes {
                warn!(size, ?prio, passes, "GC made no room in time");
                return Err(Error::NoSpace);
            }
            passes += 1;
            self.gc_pass()?;
        }
        self.reserve_space(size)
    }

    /// Reserve on behalf of the GC
    pub(crate) fn reserve_space_gc(&mut self, size: u32) -> Result<()> {
        self.remap_leb()?;
        let free = self.fs.sizes.lock().totals().free;
        if u64::from(size) > free {
            debug!(size, free, "GC reservation exhausted");
            return Err(Error::NoSpace);
        }
        self.reserve_space(size)
    }

    /// Hand the first erase-pending block back to the EBH
    ///
    /// The LEB is unmapped (its PEB goes to the erase queue), its obsolete
    /// references are released and it joins the free queue. Returns
    /// whether there was a block to recycle.
    pub(crate) fn remap_leb(&mut self) -> Result<bool> {
        let Some(lnr) = self.m.blocks.front(BlockQueue::ErasePending) else {
            return Ok(false);
        };
        self.fs.ebh.unmap_leb(lnr)?;
        self.release_block_refs(lnr);
        self.fs.sizes.lock().reset(lnr);
        self.m.blocks.file(lnr, BlockQueue::Free);
        self.fs.stats.blocks_recycled.fetch_add(1, Ordering::Relaxed);
        info!(%lnr, "recycled eraseblock");
        Ok(true)
    }

    fn release_block_refs(&mut self, lnr: Lnr) {
        let ids = self.m.blocks.take_refs(lnr);
        let v = &mut *self.v;
        for id in ids {
            let Some(r) = v.nrefs.free(id) else {
                continue;
            };
            assert!(
                r.is_obsolete(),
                "recycling {lnr} with a live record at offset {}",
                r.offset
            );
            if let Some(vc) = v.vnodes.get_mut(&r.owner) {
                vc.unlink(r.lnr, r.offset, id);
            }
        }
    }
}
