//! Garbage collector
//!
//! Each pass does one unit of work: validate one vnode with unchecked
//! records, recycle one erase-pending block, or move one live record out
//! of the victim block. The victim and the walk position survive between
//! passes, so collection proceeds in small steps whether it is driven by
//! the GC thread or by a writer short of space.

use chfs_common::{Error, Lnr, Result, Vno};
use crossbeam_channel::RecvTimeoutError;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::fs::{Alloc, ChfsInner, Txn};
use crate::ledger::Space;
use crate::nodes::{BlockQueue, NrefId, NrefState};
use crate::record::{Node, NodeType, VnodeInfo};
use crate::vnode::{DirentEntry, VnodeState};

/// Passes the GC thread runs per wake before sleeping again
const PASSES_PER_WAKE: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Victim {
    ErasePending,
    Block(Lnr),
}

impl Txn<'_> {
    /// Run one GC pass
    pub(crate) fn gc_pass(&mut self) -> Result<()> {
        self.fs.stats.gc_passes.fetch_add(1, Ordering::Relaxed);

        if self.fs.sizes.lock().totals().unchecked > 0 {
            return self.gc_check_unchecked();
        }

        let victim = match self.m.gcblock {
            Some(lnr) => lnr,
            None => match self.select_victim() {
                None => {
                    debug!("nothing to collect");
                    return Ok(());
                }
                Some(Victim::ErasePending) => {
                    self.remap_leb()?;
                    return Ok(());
                }
                Some(Victim::Block(lnr)) => {
                    assert_ne!(
                        Some(lnr),
                        self.m.nextblock,
                        "GC picked the block open for writing"
                    );
                    self.m.blocks.file(lnr, BlockQueue::Gc);
                    self.m.gcblock = Some(lnr);
                    self.m.gc_cursor = 0;
                    debug!(%lnr, "selected GC victim");
                    lnr
                }
            },
        };

        // every record handled below either becomes obsolete or changes
        // state, so the walk only ever skips obsolete references
        let next = loop {
            let Some(&id) = self.m.blocks.refs(victim).get(self.m.gc_cursor) else {
                break None;
            };
            if self.v.nrefs[id].is_obsolete() {
                self.m.gc_cursor += 1;
                continue;
            }
            break Some(id);
        };
        if let Some(id) = next {
            self.gc_node(victim, id)?;
        }
        self.gc_close_out(victim)
    }

    fn select_victim(&mut self) -> Option<Victim> {
        let w = self.fs.config.gc.weights;
        let draw = self.m.rng.gen_range(0..w.total);
        let preferred = if draw < w.erase_pending {
            BlockQueue::ErasePending
        } else if draw < w.very_dirty {
            BlockQueue::VeryDirty
        } else if draw < w.dirty {
            BlockQueue::Dirty
        } else {
            BlockQueue::Clean
        };

        let blocks = &self.m.blocks;
        let queue = [
            preferred,
            BlockQueue::ErasePending,
            BlockQueue::VeryDirty,
            BlockQueue::Dirty,
            BlockQueue::Clean,
        ]
        .into_iter()
        .find(|&q| blocks.len(q) > 0)?;
        if queue == BlockQueue::ErasePending {
            return Some(Victim::ErasePending);
        }
        let open = self.m.nextblock;
        blocks
            .members(queue)
            .into_iter()
            .find(|&lnr| Some(lnr) != open)
            .map(Victim::Block)
    }

    fn gc_node(&mut self, victim: Lnr, id: NrefId) -> Result<()> {
        let r = self.v.nrefs[id];
        debug!(%victim, offset = r.offset, kind = ?r.node_type, state = ?r.state, "collecting record");
        match r.state {
            NrefState::Obsolete => Ok(()),
            NrefState::Unchecked => self.check_vnode(r.owner),
            NrefState::Pristine => self.gc_pristine(id),
            NrefState::Normal => match r.node_type {
                NodeType::Vnode => self.gc_vnode(victim, id, r.owner),
                NodeType::Data => self.gc_data(id, r.owner),
                NodeType::Dirent => self.gc_dirent(victim, id, r.owner),
                NodeType::Padding => {
                    self.mark_node_obsolete(id);
                    Ok(())
                }
            },
        }
    }

    fn gc_pristine(&mut self, id: NrefId) -> Result<()> {
        let r = self.v.nrefs[id];
        let bytes = self.fs.read_record(r.lnr, r.offset, r.len)?;
        if let Err(e) = Node::decode(&bytes) {
            warn!(lnr = %r.lnr, offset = r.offset, "pristine record is corrupt, dropping it: {e}");
            self.mark_node_obsolete(id);
            return Ok(());
        }
        self.relocate_record(id, &bytes)
    }

    fn gc_vnode(&mut self, victim: Lnr, id: NrefId, owner: Vno) -> Result<()> {
        let info = self
            .v
            .vnodes
            .get(&owner)
            .filter(|vc| vc.info_ref == Some(id))
            .and_then(|vc| vc.info.clone());
        let Some(mut info) = info else {
            self.mark_node_obsolete(id);
            return Ok(());
        };
        if info.is_deleted() && !self.deletion_record_needed(victim, owner, id) {
            debug!(%owner, "dropping deletion record");
            self.mark_node_obsolete(id);
            self.v.vnodes.remove(&owner);
            return Ok(());
        }
        info.version = self.v.get_or_insert(owner).next_version();
        self.install_vnode_info(owner, info, Alloc::Gc)?;
        self.fs.stats.nodes_relocated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn gc_data(&mut self, id: NrefId, owner: Vno) -> Result<()> {
        let frags = self
            .v
            .vnodes
            .get(&owner)
            .map(|vc| vc.frags_of(id))
            .unwrap_or_default();
        if frags.is_empty() {
            self.mark_node_obsolete(id);
            return Ok(());
        }

        let data = match self.read_node(id) {
            Ok(Node::Data(d)) => d.data,
            Ok(_) => {
                let r = self.v.nrefs[id];
                return Err(self.drop_unreadable(id, Error::corrupt(r.lnr, r.offset, "not a data record")));
            }
            Err(e) if e.is_corruption() => return Err(self.drop_unreadable(id, e)),
            Err(e) => return Err(e),
        };

        for (start, frag) in frags {
            let from = frag.node_ofs as usize;
            let piece = data
                .get(from..from + frag.len as usize)
                .ok_or_else(|| Error::internal(format!("fragment past the end of {id:?}")))?
                .to_vec();
            self.write_data_node(owner, start, piece, Alloc::Gc)?;
        }
        self.fs.stats.nodes_relocated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// A live record failed validation: its data is gone, so stop serving
    /// it and let the block be reclaimed, then report the loss
    fn drop_unreadable(&mut self, id: NrefId, err: Error) -> Error {
        error!(?id, "live record is unreadable, dropping it: {err}");
        self.forget_ref(id);
        self.mark_node_obsolete(id);
        err
    }

    fn gc_dirent(&mut self, victim: Lnr, id: NrefId, owner: Vno) -> Result<()> {
        let found = self
            .v
            .vnodes
            .get(&owner)
            .and_then(|vc| vc.dirent_by_ref(id));
        let Some((name, entry)) = found else {
            self.mark_node_obsolete(id);
            return Ok(());
        };

        if !entry.is_deletion() {
            self.write_dirent(owner, name, entry.vno, entry.dtype, Alloc::Gc)?;
        } else if self.deletion_still_needed(victim, owner, &name, entry.version) {
            debug!(%owner, name = %String::from_utf8_lossy(&name), "keeping deletion entry");
            self.write_dirent(owner, name, Vno::NONE, 0, Alloc::Gc)?;
        } else {
            if let Some(vc) = self.v.vnodes.get_mut(&owner) {
                vc.remove_dirent(&name);
            }
            self.mark_node_obsolete(id);
            return Ok(());
        }
        self.fs.stats.nodes_relocated.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// A deleted vnode's last record has to survive while any record it
    /// supersedes is still on flash outside the victim
    fn deletion_record_needed(&self, victim: Lnr, owner: Vno, id: NrefId) -> bool {
        self.v.vnodes.get(&owner).is_some_and(|vc| {
            vc.chain()
                .any(|other| other != id && self.v.nrefs[other].lnr != victim)
        })
    }

    /// A deletion entry has to survive while an older entry for the same
    /// name is still on flash outside the victim
    fn deletion_still_needed(&self, victim: Lnr, owner: Vno, name: &[u8], version: u64) -> bool {
        let Some(vc) = self.v.vnodes.get(&owner) else {
            return false;
        };
        let candidates: Vec<NrefId> = vc
            .chain()
            .filter(|&other| {
                let r = &self.v.nrefs[other];
                r.node_type == NodeType::Dirent && r.is_obsolete() && r.lnr != victim
            })
            .collect();
        candidates.into_iter().any(|other| match self.read_node(other) {
            Ok(Node::Dirent(d)) => d.name == name && d.version < version,
            Ok(_) => false,
            Err(e) => {
                debug!(?other, "skipping unreadable obsolete dirent: {e}");
                false
            }
        })
    }

    fn gc_close_out(&mut self, victim: Lnr) -> Result<()> {
        if self.m.gcblock != Some(victim) {
            // an obsoletion already queued it for erase
            if self.m.blocks.queue_of(victim) == BlockQueue::ErasePending {
                self.remap_leb()?;
            }
            return Ok(());
        }
        let eb = self.fs.sizes.lock().block(victim);
        if u64::from(eb.dirty) + u64::from(eb.wasted) == u64::from(self.fs.eb_size) {
            self.m.gcblock = None;
            self.m.gc_cursor = 0;
            self.m.blocks.file(victim, BlockQueue::ErasePending);
            debug!(%victim, "GC victim fully reclaimed");
            self.remap_leb()?;
        } else if self.m.gc_cursor >= self.m.blocks.refs(victim).len() {
            // walked to the end with bytes still live; give it back
            self.m.gcblock = None;
            self.m.gc_cursor = 0;
            let target = self.fs.classify(eb.dirty);
            self.m.blocks.file(victim, target);
        }
        Ok(())
    }

    // unchecked space

    fn gc_check_unchecked(&mut self) -> Result<()> {
        loop {
            let vno = self.m.checked_vno.next();
            if vno > self.v.max_vno {
                // start over next time; a failed check leaves its vnode unchecked
                self.m.checked_vno = Vno::NONE;
                warn!(
                    max_vno = %self.v.max_vno,
                    "unchecked space left after a full sweep"
                );
                return Err(Error::NoSpace);
            }
            let pending = {
                let v = &*self.v;
                v.vnodes.get(&vno).and_then(|vc| {
                    vc.chain()
                        .any(|id| v.nrefs[id].state == NrefState::Unchecked)
                        .then_some(vc.state)
                })
            };
            match pending {
                None => self.m.checked_vno = vno,
                Some(VnodeState::Reading) => {
                    debug!(%vno, "vnode is being read in, backing off");
                    return Ok(());
                }
                Some(_) => {
                    self.m.checked_vno = vno;
                    return self.check_vnode(vno);
                }
            }
        }
    }

    /// Validate the unchecked records of a vnode and build its live view
    pub(crate) fn check_vnode(&mut self, vno: Vno) -> Result<()> {
        let ids: Vec<NrefId> = {
            let v = &*self.v;
            match v.vnodes.get(&vno) {
                Some(vc) => vc
                    .chain()
                    .filter(|&id| v.nrefs[id].state == NrefState::Unchecked)
                    .collect(),
                None => return Ok(()),
            }
        };
        self.v.get_or_insert(vno).state = VnodeState::Checking;

        // read everything first so a media error leaves the vnode untouched
        let mut read = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read_node(id) {
                Err(e) if !e.is_corruption() => {
                    self.v.get_or_insert(vno).state = VnodeState::Unchecked;
                    return Err(e);
                }
                res => read.push((id, res)),
            }
        }

        let mut valid = Vec::with_capacity(read.len());
        for (id, res) in read {
            let r = self.v.nrefs[id];
            match res {
                Ok(node) if node.owner() == Some(vno) && node.node_type() == r.node_type => {
                    self.fs
                        .sizes
                        .lock()
                        .transfer(r.lnr, Space::Unchecked, Space::Used, r.len);
                    self.v.nrefs[id].state = NrefState::Normal;
                    valid.push((id, node));
                }
                Ok(node) => {
                    warn!(%vno, lnr = %r.lnr, offset = r.offset, found = ?node.node_type(), "record does not match its reference");
                    self.mark_node_obsolete(id);
                }
                Err(e) => {
                    warn!(%vno, lnr = %r.lnr, offset = r.offset, "dropping corrupt record: {e}");
                    self.mark_node_obsolete(id);
                }
            }
        }

        valid.sort_by_key(|(_, node)| node.version());
        let count = valid.len();
        for (id, node) in valid {
            self.install_node(vno, id, node);
        }
        // a deletion record supersedes everything else the vnode owns
        if self.v.get_or_insert(vno).info.as_ref().is_some_and(VnodeInfo::is_deleted) {
            let v = &*self.v;
            let stale: Vec<NrefId> = v.vnodes.get(&vno).map_or_else(Vec::new, |vc| {
                vc.chain()
                    .filter(|&id| Some(id) != vc.info_ref && !v.nrefs[id].is_obsolete())
                    .collect()
            });
            for id in stale {
                self.forget_ref(id);
                self.mark_node_obsolete(id);
            }
        }
        // data past the size of the newest vnode record was truncated away
        let dead = {
            let vc = self.v.get_or_insert(vno);
            match vc.info.as_ref().map(|info| info.size) {
                Some(size) => vc.truncate_frags(size),
                None => Vec::new(),
            }
        };
        for id in dead {
            self.obsolete_if_live(id);
        }
        self.v.get_or_insert(vno).state = VnodeState::Present;
        debug!(%vno, records = count, "checked vnode");
        Ok(())
    }

    /// Make a validated record part of its vnode's live view
    fn install_node(&mut self, vno: Vno, id: NrefId, node: Node) {
        if let Node::Dirent(d) = &node {
            self.v.max_vno = self.v.max_vno.max(d.vno);
        }
        let vc = self.v.get_or_insert(vno);
        vc.note_version(node.version());
        let dead: Vec<NrefId> = match node {
            Node::Vnode(info) => {
                if vc.info.as_ref().is_none_or(|cur| info.version > cur.version) {
                    vc.info = Some(info);
                    vc.info_ref.replace(id).into_iter().collect()
                } else {
                    vec![id]
                }
            }
            Node::Data(d) => {
                let len = u32::try_from(d.data.len()).unwrap_or(u32::MAX);
                vc.insert_frag(d.offset, len, id, 0, d.version)
            }
            Node::Dirent(d) => {
                let stale = vc
                    .dirent(&d.name)
                    .is_some_and(|cur| cur.version > d.version);
                if stale {
                    vec![id]
                } else {
                    let entry = DirentEntry {
                        vno: d.vno,
                        version: d.version,
                        dtype: d.dtype,
                        nref: id,
                    };
                    vc.set_dirent(d.name, entry)
                        .map(|old| old.nref)
                        .into_iter()
                        .collect()
                }
            }
            Node::Padding { .. } => vec![id],
        };
        for id in dead {
            self.obsolete_if_live(id);
        }
    }

    /// Validate a vnode before it is used, if it still has unchecked records
    pub(crate) fn ensure_checked(&mut self, vno: Vno) -> Result<()> {
        let pending = self
            .v
            .vnodes
            .get(&vno)
            .is_some_and(|vc| vc.state == VnodeState::Unchecked);
        if pending {
            self.check_vnode(vno)?;
        }
        Ok(())
    }
}

pub(crate) fn spawn(inner: Arc<ChfsInner>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("chfs-gc".into())
        .spawn(move || run(&inner))?;
    Ok(handle)
}

fn run(inner: &ChfsInner) {
    let interval = inner.config.gc.interval();
    info!("GC thread started");

    while !inner.shutdown.load(Ordering::Relaxed) {
        let mut passes = 0;
        while passes < PASSES_PER_WAKE
            && !inner.shutdown.load(Ordering::Relaxed)
            && inner.gc_thread_should_wake()
        {
            passes += 1;
            let res = inner.begin().gc_pass();
            match res {
                Ok(()) => {}
                Err(Error::NoSpace) => {
                    debug!("GC pass found nothing to reclaim");
                    break;
                }
                Err(e) => {
                    error!("GC pass failed: {e}");
                    break;
                }
            }
        }

        match inner.gc_rx.recv_timeout(interval) {
            Ok(()) => debug!("GC thread woken"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("GC thread stopped");
}
