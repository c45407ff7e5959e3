//! Handing scanned blocks to a freshly opened engine
//!
//! The build step that runs at mount time walks each mapped LEB and
//! reports the records it found. Adopted records start out unchecked (the
//! GC validates them later) or pristine (carried along verbatim). Mapped
//! LEBs nobody adopted are treated as garbage once the mount is started.

use chfs_common::{Error, Lnr, Result, Vno};
use tracing::{debug, info, warn};

use crate::ebh::Ebh;
use crate::fs::Txn;
use crate::ledger::Space;
use crate::nodes::{BlockQueue, NrefState};
use crate::record::{NODE_ALIGN, NODE_HDR_SIZE, NodeType, RecordScanner, ScanItem};
use crate::vnode::VnodeState;

/// One record found on a mapped LEB
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedNode {
    pub offset: u32,
    pub len: u32,
    pub node_type: NodeType,
    /// Vnode whose chain the record joins (the parent, for dirents)
    pub owner: Vno,
    pub version: u64,
    /// Copy verbatim instead of validating
    pub pristine: bool,
}

/// Scan a mapped LEB for records to adopt
///
/// Padding and unreadable regions are left out; their bytes end up dirty.
pub fn scan_leb(ebh: &Ebh, lnr: Lnr) -> Result<Vec<ScannedNode>> {
    let mut buf = vec![0u8; ebh.eb_size() as usize];
    ebh.read_leb(lnr, 0, &mut buf)?;

    let mut nodes = Vec::new();
    for item in RecordScanner::new(&buf) {
        match item {
            ScanItem::Node {
                offset,
                length,
                node,
            } => {
                let Some(owner) = node.owner() else {
                    continue;
                };
                nodes.push(ScannedNode {
                    offset,
                    len: length,
                    node_type: node.node_type(),
                    owner,
                    version: node.version(),
                    pristine: false,
                });
            }
            ScanItem::Corrupt {
                offset,
                length,
                reason,
            } => {
                warn!(%lnr, offset, length, "skipping unreadable region: {reason}");
            }
        }
    }
    debug!(%lnr, records = nodes.len(), "scanned LEB");
    Ok(nodes)
}

fn validate(eb_size: u32, lnr: Lnr, nodes: &[ScannedNode]) -> Result<()> {
    let mut end = 0u32;
    for n in nodes {
        let bad = |reason: &str| Err(Error::corrupt(lnr, n.offset, reason));
        if n.offset < end {
            return bad("records overlap or are out of order");
        }
        if n.offset as usize % NODE_ALIGN != 0 || (n.len as usize) < NODE_HDR_SIZE {
            return bad("misaligned or short record");
        }
        if n.owner.is_none() || n.node_type == NodeType::Padding {
            return bad("record has no owner");
        }
        end = match n.offset.checked_add(n.len) {
            Some(e) if e <= eb_size => e,
            _ => return bad("record runs past the end of the block"),
        };
    }
    Ok(())
}

impl Txn<'_> {
    pub(crate) fn adopt_block(&mut self, lnr: Lnr, nodes: &[ScannedNode]) -> Result<()> {
        if lnr.get() >= self.fs.ebh.leb_count() {
            return Err(Error::invalid_argument(format!("{lnr} out of range")));
        }
        let queue = self.m.blocks.queue_of(lnr);
        if queue != BlockQueue::Unscanned {
            return Err(Error::invalid_argument(format!(
                "{lnr} is {queue:?}, not waiting to be adopted"
            )));
        }
        validate(self.fs.eb_size, lnr, nodes)?;

        let mut pos = 0u32;
        let mut unchecked = 0usize;
        for n in nodes {
            if n.offset > pos {
                self.update_eb_dirty(lnr, n.offset - pos);
            }
            let (space, state) = if n.pristine {
                (Space::Used, NrefState::Pristine)
            } else {
                unchecked += 1;
                (Space::Unchecked, NrefState::Unchecked)
            };
            self.fs
                .sizes
                .lock()
                .transfer(lnr, Space::Free, space, n.len);
            let id = self.alloc_node_ref(lnr, n.offset, n.len, n.node_type, n.owner, state);
            {
                let vc = self.v.get_or_insert(n.owner);
                vc.note_version(n.version);
                if !n.pristine {
                    vc.state = VnodeState::Unchecked;
                }
            }
            self.add_node_to_list(n.owner, id);
            pos = n.offset + n.len;
        }
        self.close_eraseblock(lnr);
        self.m.checked_vno = Vno::NONE;

        info!(
            %lnr,
            records = nodes.len(),
            unchecked,
            queue = ?self.m.blocks.queue_of(lnr),
            "adopted block"
        );
        Ok(())
    }

    /// Blocks still unscanned when the mount starts hold nothing we know of
    pub(crate) fn discard_unscanned(&mut self) {
        for lnr in self.m.blocks.members(BlockQueue::Unscanned) {
            let free = self.fs.sizes.lock().block(lnr).free;
            self.update_eb_dirty(lnr, free);
            self.m.blocks.seal(lnr);
            self.m.blocks.file(lnr, BlockQueue::ErasePending);
            warn!(%lnr, "mapped block was never adopted, queued for erase");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(offset: u32, len: u32) -> ScannedNode {
        ScannedNode {
            offset,
            len,
            node_type: NodeType::Data,
            owner: Vno::new(2),
            version: 1,
            pristine: false,
        }
    }

    #[test]
    fn test_validate_accepts_gaps() {
        validate(4096, Lnr::new(0), &[node(0, 64), node(128, 64)]).unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let lnr = Lnr::new(3);
        assert!(validate(4096, lnr, &[node(0, 64), node(32, 64)]).is_err());
        assert!(validate(4096, lnr, &[node(2, 64)]).is_err());
        assert!(validate(4096, lnr, &[node(0, 8)]).is_err());
        assert!(validate(4096, lnr, &[node(4064, 64)]).is_err());

        let mut orphan = node(0, 64);
        orphan.owner = Vno::NONE;
        assert!(validate(4096, lnr, &[orphan]).is_err());
    }
}
