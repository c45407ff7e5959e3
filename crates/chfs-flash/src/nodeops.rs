//! Node log operations
//!
//! Every change to the space ledger goes through this module: appending a
//! record, retiring one, closing a block. Record writes run under the
//! mount lock, so the records of a block are appended in offset order.

use chfs_common::{Error, Lnr, Result, Vno};
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

use crate::fs::{Alloc, Txn};
use crate::ledger::Space;
use crate::nodes::{BlockQueue, NodeRef, NrefId, NrefState};
use crate::record::{Node, NodeType};

impl Txn<'_> {
    /// New reference for a record at `lnr:offset`, appended to the block
    pub(crate) fn alloc_node_ref(
        &mut self,
        lnr: Lnr,
        offset: u32,
        len: u32,
        node_type: NodeType,
        owner: Vno,
        state: NrefState,
    ) -> NrefId {
        let id = self.v.nrefs.alloc(NodeRef {
            lnr,
            offset,
            len,
            state,
            node_type,
            owner,
        });
        self.m.blocks.push_ref(lnr, id);
        id
    }

    /// Link a reference into its owner's chain
    ///
    /// A different live reference at the same position is obsoleted.
    pub(crate) fn add_node_to_list(&mut self, owner: Vno, id: NrefId) {
        let displaced = {
            let v = &mut *self.v;
            let r = v.nrefs[id];
            v.get_or_insert(owner).link(r.lnr, r.offset, id)
        };
        if let Some(old) = displaced {
            warn!(?old, new = ?id, "duplicate record position, replacing");
            self.obsolete_if_live(old);
        }
    }

    /// Move a record's bytes to dirty and refile its block
    ///
    /// # Panics
    ///
    /// Panics if the reference is already obsolete.
    pub(crate) fn mark_node_obsolete(&mut self, id: NrefId) {
        let (lnr, len, from) = {
            let r = &mut self.v.nrefs[id];
            assert!(
                !r.is_obsolete(),
                "record at {}:{} obsoleted twice",
                r.lnr,
                r.offset
            );
            let from = if r.state == NrefState::Unchecked {
                Space::Unchecked
            } else {
                Space::Used
            };
            r.state = NrefState::Obsolete;
            (r.lnr, r.len, from)
        };
        let eb = {
            let mut sizes = self.fs.sizes.lock();
            sizes.transfer(lnr, from, Space::Dirty, len);
            sizes.block(lnr)
        };
        self.fs.stats.nodes_obsoleted.fetch_add(1, Ordering::Relaxed);

        if self.m.nextblock == Some(lnr) {
            return;
        }
        let queue = self.m.blocks.queue_of(lnr);
        if matches!(
            queue,
            BlockQueue::Free | BlockQueue::ErasePending | BlockQueue::Unscanned
        ) {
            return;
        }
        if eb.is_reclaimable() {
            if self.m.gcblock == Some(lnr) {
                self.m.gcblock = None;
                self.m.gc_cursor = 0;
            }
            debug!(%lnr, "nothing live left, queued for erase");
            self.m.blocks.file(lnr, BlockQueue::ErasePending);
            return;
        }
        if queue == BlockQueue::Gc {
            return;
        }
        let target = self.fs.classify(eb.dirty);
        if target != queue {
            debug!(%lnr, from = ?queue, to = ?target, dirty = eb.dirty, "block moved");
            self.m.blocks.file(lnr, target);
        }
    }

    pub(crate) fn obsolete_if_live(&mut self, id: NrefId) {
        if !self.v.nrefs[id].is_obsolete() {
            self.mark_node_obsolete(id);
        }
    }

    /// Free bytes of a block that can never hold data become dirty
    pub(crate) fn update_eb_dirty(&mut self, lnr: Lnr, size: u32) {
        self.fs
            .sizes
            .lock()
            .transfer(lnr, Space::Free, Space::Dirty, size);
    }

    /// Seal a block and file it by how dirty it is
    pub(crate) fn close_eraseblock(&mut self, lnr: Lnr) {
        let free = self.fs.sizes.lock().block(lnr).free;
        self.update_eb_dirty(lnr, free);
        let eb = self.fs.sizes.lock().block(lnr);

        self.m.blocks.seal(lnr);
        if self.m.nextblock == Some(lnr) {
            self.m.nextblock = None;
        }
        let target = if eb.is_reclaimable() {
            BlockQueue::ErasePending
        } else {
            self.fs.classify(eb.dirty)
        };
        self.m.blocks.file(lnr, target);
        self.fs.stats.blocks_closed.fetch_add(1, Ordering::Relaxed);
        debug!(%lnr, queue = ?target, dirty = eb.dirty, used = eb.used, "closed eraseblock");
    }

    /// Point every live structure that used `old` at `new`
    pub(crate) fn replace_node_ref(&mut self, old: NrefId, new: NrefId) {
        let v = &mut *self.v;
        let owner = v.nrefs[old].owner;
        if let Some(vc) = v.vnodes.get_mut(&owner) {
            vc.repoint(old, new);
        }
    }

    /// Drop a reference from its vnode's live view
    pub(crate) fn forget_ref(&mut self, id: NrefId) {
        let v = &mut *self.v;
        let owner = v.nrefs[id].owner;
        let Some(vc) = v.vnodes.get_mut(&owner) else {
            return;
        };
        vc.drop_frags_of(id);
        if vc.info_ref == Some(id) {
            vc.info_ref = None;
        }
        if let Some((name, _)) = vc.dirent_by_ref(id) {
            vc.remove_dirent(&name);
        }
    }

    /// Read and validate the record behind a reference
    pub(crate) fn read_node(&self, id: NrefId) -> Result<Node> {
        let r = self.v.nrefs[id];
        let bytes = self.fs.read_record(r.lnr, r.offset, r.len)?;
        Node::decode(&bytes).map_err(|e| Error::corrupt(r.lnr, r.offset, e.to_string()))
    }

    /// Append an encoded record to the open block
    ///
    /// Space comes from the normal or the GC reservation path. When the
    /// write fails the block is abandoned, the records stranded in the
    /// write buffer are rewritten elsewhere and the write is retried once
    /// on a new block.
    pub(crate) fn write_record(
        &mut self,
        bytes: &[u8],
        owner: Vno,
        node_type: NodeType,
        alloc: Alloc,
        state: NrefState,
    ) -> Result<NrefId> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| Error::invalid_argument("record too large"))?;
        let mut retried = false;
        loop {
            match alloc {
                Alloc::Normal(prio) => self.reserve_space_normal(len, prio)?,
                Alloc::Gc => self.reserve_space_gc(len)?,
            }
            let lnr = self
                .m
                .nextblock
                .ok_or_else(|| Error::internal("reservation left no open block"))?;
            let offset = self.fs.sizes.lock().write_offset(lnr);

            let res = self.fs.wbuf.write().write(&self.fs.ebh, lnr, offset, bytes);
            match res {
                Ok(padded) => {
                    if let Some((pad_lnr, pad)) = padded {
                        self.fs
                            .sizes
                            .lock()
                            .transfer(pad_lnr, Space::Free, Space::Wasted, pad);
                    }
                    let space = if state == NrefState::Unchecked {
                        Space::Unchecked
                    } else {
                        Space::Used
                    };
                    self.fs.sizes.lock().transfer(lnr, Space::Free, space, len);
                    let id = self.alloc_node_ref(lnr, offset, len, node_type, owner, state);
                    self.add_node_to_list(owner, id);
                    self.fs.stats.nodes_written.fetch_add(1, Ordering::Relaxed);
                    return Ok(id);
                }
                Err(e) => {
                    self.fs.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(%lnr, offset, len, "record write failed, abandoning block: {e}");
                    self.recover_lost_page(lnr)?;
                    if retried {
                        return Err(e);
                    }
                    retried = true;
                }
            }
        }
    }

    /// Abandon the open block after a failed program
    ///
    /// Its remaining free space turns dirty, and the live records whose
    /// bytes were still in the write buffer are rewritten on another block.
    pub(crate) fn recover_lost_page(&mut self, lnr: Lnr) -> Result<()> {
        let pending = self.fs.wbuf.write().take_pending();
        if self.m.nextblock == Some(lnr) {
            self.close_eraseblock(lnr);
        }
        let Some(page) = pending else {
            return Ok(());
        };
        if self.m.nextblock == Some(page.lnr) {
            self.close_eraseblock(page.lnr);
        }

        let stranded: Vec<NrefId> = self
            .m
            .blocks
            .refs(page.lnr)
            .iter()
            .copied()
            .filter(|&id| {
                let r = &self.v.nrefs[id];
                !r.is_obsolete() && r.end() > page.offset
            })
            .collect();
        if !stranded.is_empty() {
            warn!(lnr = %page.lnr, records = stranded.len(), "rewriting records lost with the write buffer");
        }

        for id in stranded {
            let r = self.v.nrefs[id];
            let mut bytes = vec![0u8; r.len as usize];
            // part of the record may have reached flash with an earlier page
            if r.offset < page.offset {
                let head = (page.offset - r.offset) as usize;
                self.fs.ebh.read_leb(r.lnr, r.offset, &mut bytes[..head])?;
            }
            let from = r.offset.max(page.offset);
            let src = (from - page.offset) as usize;
            let dst = (from - r.offset) as usize;
            let n = (r.end() - from) as usize;
            let tail = page.bytes.get(src..src + n).ok_or_else(|| {
                Error::internal(format!("record at {}:{} runs past the write buffer", r.lnr, r.offset))
            })?;
            bytes[dst..].copy_from_slice(tail);
            self.relocate_record(id, &bytes)?;
        }
        Ok(())
    }

    /// Write an identical copy of a record elsewhere and retire the original
    pub(crate) fn relocate_record(&mut self, id: NrefId, bytes: &[u8]) -> Result<()> {
        let r = self.v.nrefs[id];
        let state = if r.state == NrefState::Pristine {
            NrefState::Pristine
        } else {
            NrefState::Normal
        };
        let new = self.write_record(bytes, r.owner, r.node_type, Alloc::Gc, state)?;
        self.replace_node_ref(id, new);
        self.mark_node_obsolete(id);
        self.fs.stats.nodes_relocated.fetch_add(1, Ordering::Relaxed);
        debug!(from = %r.lnr, offset = r.offset, to = ?new, "relocated record");
        Ok(())
    }

    /// Pad and write out the write buffer, accounting the pad as wasted
    pub(crate) fn sync(&mut self) -> Result<()> {
        let buffered = self.fs.wbuf.read().lnr();
        let Some(lnr) = buffered else {
            return Ok(());
        };
        let res = self.fs.wbuf.write().flush(&self.fs.ebh);
        match res {
            Ok(pad) => {
                self.fs
                    .sizes
                    .lock()
                    .transfer(lnr, Space::Free, Space::Wasted, pad);
                Ok(())
            }
            Err(e) => {
                warn!(%lnr, "write buffer flush failed: {e}");
                self.recover_lost_page(lnr)
            }
        }
    }

    /// Cross-check the ledger with the reference lists
    pub(crate) fn check_consistency(&self) {
        let sizes = self.fs.sizes.lock();
        sizes.check_all();
        for n in 0..self.m.blocks.leb_count() {
            let lnr = Lnr::new(n as u32);
            let mut used = 0u32;
            let mut unchecked = 0u32;
            for &id in self.m.blocks.refs(lnr) {
                let r = &self.v.nrefs[id];
                assert_eq!(r.lnr, lnr, "reference filed under the wrong block");
                match r.state {
                    NrefState::Normal | NrefState::Pristine => used += r.len,
                    NrefState::Unchecked => unchecked += r.len,
                    NrefState::Obsolete => {}
                }
            }
            let eb = sizes.block(lnr);
            assert_eq!(eb.used, used, "{lnr}: used bytes disagree with references");
            assert_eq!(
                eb.unchecked, unchecked,
                "{lnr}: unchecked bytes disagree with references"
            );
            if self.m.blocks.queue_of(lnr) == BlockQueue::Free {
                assert_eq!(eb.free, self.fs.eb_size, "{lnr}: free block is not empty");
            }
        }
    }
}
