//! Vnode, data and directory-entry writers
//!
//! Every change is a new record with a higher version than anything its
//! vnode has seen; the records it supersedes are obsoleted once the new
//! one is on its way to flash.

use chfs_common::{AllocPriority, Error, Result, Vno};
use tracing::debug;

use crate::fs::{Alloc, Txn, now};
use crate::nodes::{NrefId, NrefState};
use crate::record::{DATA_NODE_FIXED, DataNode, DirentNode, MAX_NAME_LEN, Node, NodeType, VnodeInfo};
use crate::vnode::DirentEntry;

const NORMAL: Alloc = Alloc::Normal(AllocPriority::Normal);
const DELETION: Alloc = Alloc::Normal(AllocPriority::Deletion);

impl Txn<'_> {
    pub(crate) fn create_vnode(&mut self, mode: u32) -> Result<Vno> {
        let vno = self.v.allocate_vno();
        let t = now();
        let version = self.v.get_or_insert(vno).next_version();
        let info = VnodeInfo {
            vno,
            version,
            mode,
            nlink: 1,
            atime: t,
            mtime: t,
            ctime: t,
            ..Default::default()
        };
        if let Err(e) = self.install_vnode_info(vno, info, NORMAL) {
            self.v.vnodes.remove(&vno);
            return Err(e);
        }
        debug!(%vno, mode, "created vnode");
        Ok(vno)
    }

    /// Write a vnode-info record and make it the current one
    pub(crate) fn install_vnode_info(&mut self, vno: Vno, info: VnodeInfo, alloc: Alloc) -> Result<()> {
        let bytes = Node::Vnode(info.clone()).encode()?;
        let id = self.write_record(&bytes, vno, NodeType::Vnode, alloc, NrefState::Normal)?;
        let old = {
            let vc = self.v.get_or_insert(vno);
            vc.info = Some(info);
            vc.info_ref.replace(id)
        };
        if let Some(old) = old {
            self.obsolete_if_live(old);
        }
        Ok(())
    }

    fn info(&self, vno: Vno) -> Result<VnodeInfo> {
        self.v
            .vnodes
            .get(&vno)
            .and_then(|vc| vc.current_info().cloned())
            .ok_or(Error::VnodeNotFound(vno))
    }

    fn touch(&mut self, vno: Vno, size: u64, alloc: Alloc) -> Result<()> {
        let mut info = self.info(vno)?;
        let t = now();
        info.size = size;
        info.mtime = t;
        info.ctime = t;
        info.version = self.v.get_or_insert(vno).next_version();
        self.install_vnode_info(vno, info, alloc)
    }

    pub(crate) fn write_data(&mut self, vno: Vno, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_checked(vno)?;
        let size = self.info(vno)?.size;
        if data.is_empty() {
            return Ok(());
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| Error::invalid_argument("write past the largest file offset"))?;

        if offset > size {
            self.fill_hole(vno, size, offset)?;
        }
        let mut pos = offset;
        for piece in data.chunks(self.data_chunk()) {
            self.write_data_node(vno, pos, piece.to_vec(), NORMAL)?;
            pos += piece.len() as u64;
        }
        self.touch(vno, size.max(end), NORMAL)
    }

    /// Largest payload of one data record
    fn data_chunk(&self) -> usize {
        let limit = self.fs.config.wbuf.max_data_node_size as usize;
        limit.min(self.fs.eb_size as usize - DATA_NODE_FIXED)
    }

    /// Cover `[from, to)` with zero-filled records
    ///
    /// Records cut off by an earlier truncation are still on flash and come
    /// back at the next mount unless something newer covers their range.
    fn fill_hole(&mut self, vno: Vno, from: u64, to: u64) -> Result<()> {
        let chunk = self.data_chunk() as u64;
        let mut pos = from;
        while pos < to {
            let len = chunk.min(to - pos);
            self.write_data_node(vno, pos, vec![0; len as usize], NORMAL)?;
            pos += len;
        }
        Ok(())
    }

    /// Write one data record and fold it into the fragment map
    pub(crate) fn write_data_node(&mut self, vno: Vno, offset: u64, data: Vec<u8>, alloc: Alloc) -> Result<NrefId> {
        let version = self.v.get_or_insert(vno).next_version();
        let len = u32::try_from(data.len())
            .map_err(|_| Error::invalid_argument("data record too large"))?;
        let bytes = Node::Data(DataNode {
            vno,
            version,
            offset,
            data,
        })
        .encode()?;
        let id = self.write_record(&bytes, vno, NodeType::Data, alloc, NrefState::Normal)?;
        let dead = self.v.get_or_insert(vno).insert_frag(offset, len, id, 0, version);
        for id in dead {
            self.obsolete_if_live(id);
        }
        Ok(id)
    }

    pub(crate) fn truncate(&mut self, vno: Vno, size: u64) -> Result<()> {
        self.ensure_checked(vno)?;
        let old = self.info(vno)?.size;
        // shrinking frees space, so it may dip into the deletion reserve
        let alloc = if size < old { DELETION } else { NORMAL };
        if size > old {
            self.fill_hole(vno, old, size)?;
        }
        self.touch(vno, size, alloc)?;
        let dead = self.v.get_or_insert(vno).truncate_frags(size);
        for id in dead {
            self.obsolete_if_live(id);
        }
        debug!(%vno, from = old, to = size, "truncated");
        Ok(())
    }

    pub(crate) fn link(&mut self, parent: Vno, name: &[u8], child: Vno, dtype: u8) -> Result<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(Error::invalid_argument(format!(
                "name length {} out of range",
                name.len()
            )));
        }
        if child.is_none() {
            return Err(Error::invalid_argument("cannot link the null vnode"));
        }
        self.ensure_checked(parent)?;
        self.ensure_checked(child)?;
        self.info(child)?;
        let exists = self
            .v
            .vnodes
            .get(&parent)
            .and_then(|vc| vc.dirent(name))
            .is_some_and(|e| !e.is_deletion());
        if exists {
            return Err(Error::invalid_argument(format!(
                "{} already exists in {parent}",
                String::from_utf8_lossy(name)
            )));
        }
        self.write_dirent(parent, name.to_vec(), child, dtype, NORMAL)
    }

    pub(crate) fn unlink(&mut self, parent: Vno, name: &[u8]) -> Result<()> {
        self.ensure_checked(parent)?;
        let found = self
            .v
            .vnodes
            .get(&parent)
            .and_then(|vc| vc.dirent(name))
            .is_some_and(|e| !e.is_deletion());
        if !found {
            return Err(Error::not_found(format!(
                "{} in {parent}",
                String::from_utf8_lossy(name)
            )));
        }
        self.write_dirent(parent, name.to_vec(), Vno::NONE, 0, DELETION)
    }

    /// Write a dirent record and bind its name; `Vno::NONE` writes a deletion
    pub(crate) fn write_dirent(&mut self, parent: Vno, name: Vec<u8>, vno: Vno, dtype: u8, alloc: Alloc) -> Result<()> {
        let version = self.v.get_or_insert(parent).next_version();
        let bytes = Node::Dirent(DirentNode {
            pvno: parent,
            vno,
            version,
            mctime: now(),
            dtype,
            name: name.clone(),
        })
        .encode()?;
        let id = self.write_record(&bytes, parent, NodeType::Dirent, alloc, NrefState::Normal)?;
        let entry = DirentEntry {
            vno,
            version,
            dtype,
            nref: id,
        };
        let old = self.v.get_or_insert(parent).set_dirent(name, entry);
        if let Some(old) = old {
            self.obsolete_if_live(old.nref);
        }
        Ok(())
    }

    /// Delete a vnode and everything it owns
    ///
    /// A vnode record with no links and no size goes to flash first, so the
    /// older records stay dead after a remount. The GC keeps that record
    /// until none of the records it supersedes remain on flash.
    pub(crate) fn delete_vnode(&mut self, vno: Vno) -> Result<()> {
        self.ensure_checked(vno)?;
        let mut info = self.info(vno)?;
        let live: Vec<NrefId> = {
            let v = &*self.v;
            v.vnodes
                .get(&vno)
                .map(|vc| vc.chain().filter(|&id| !v.nrefs[id].is_obsolete()).collect())
                .unwrap_or_default()
        };

        info.nlink = 0;
        info.size = 0;
        info.ctime = now();
        info.version = self.v.get_or_insert(vno).next_version();
        self.install_vnode_info(vno, info, DELETION)?;

        let mut count = 0;
        for id in live {
            if self.v.nrefs[id].is_obsolete() {
                continue;
            }
            self.forget_ref(id);
            self.mark_node_obsolete(id);
            count += 1;
        }
        debug!(%vno, records = count, "deleted vnode");
        Ok(())
    }
}
