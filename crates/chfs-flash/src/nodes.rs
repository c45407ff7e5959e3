//! Node references and block lists
//!
//! A [`NodeRef`] names one record on flash. References live in an
//! [`NrefArena`] owned by the mount and are addressed by [`NrefId`]; the
//! per-LEB lists in [`BlockLists`] keep them in physical order, which is
//! the order the garbage collector walks a victim in.

use chfs_common::{Lnr, Vno};
use std::collections::VecDeque;
use std::ops::{Index, IndexMut};

use crate::record::NodeType;

/// Handle of a node reference in the arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NrefId(u32);

/// Lifecycle of a node reference
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NrefState {
    /// Live and validated
    Normal,
    /// Found by a scan; CRCs not yet checked
    Unchecked,
    /// Superseded; its bytes are dirty
    Obsolete,
    /// Validated and opaque to the object model; moved verbatim
    Pristine,
}

/// Location and state of one record on flash
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeRef {
    pub lnr: Lnr,
    pub offset: u32,
    /// Length on flash, alignment included
    pub len: u32,
    pub state: NrefState,
    pub node_type: NodeType,
    /// Vnode whose chain holds the reference (the parent, for dirents)
    pub owner: Vno,
}

impl NodeRef {
    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.state == NrefState::Obsolete
    }

    /// Bytes past the end of the record
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.offset + self.len
    }
}

/// Slab of node references with slot reuse
#[derive(Debug, Default)]
pub struct NrefArena {
    slots: Vec<Option<NodeRef>>,
    vacant: Vec<u32>,
    live: usize,
}

impl NrefArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, nref: NodeRef) -> NrefId {
        self.live += 1;
        if let Some(slot) = self.vacant.pop() {
            self.slots[slot as usize] = Some(nref);
            return NrefId(slot);
        }
        let slot = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Some(nref));
        NrefId(slot)
    }

    /// Return a slot to the arena
    pub fn free(&mut self, id: NrefId) -> Option<NodeRef> {
        let old = self.slots.get_mut(id.0 as usize)?.take()?;
        self.vacant.push(id.0);
        self.live -= 1;
        Some(old)
    }

    #[must_use]
    pub fn get(&self, id: NrefId) -> Option<&NodeRef> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.live
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.live == 0
    }
}

impl Index<NrefId> for NrefArena {
    type Output = NodeRef;

    fn index(&self, id: NrefId) -> &NodeRef {
        match self.slots.get(id.0 as usize) {
            Some(Some(nref)) => nref,
            _ => panic!("stale node reference {id:?}"),
        }
    }
}

impl IndexMut<NrefId> for NrefArena {
    fn index_mut(&mut self, id: NrefId) -> &mut NodeRef {
        match self.slots.get_mut(id.0 as usize) {
            Some(Some(nref)) => nref,
            _ => panic!("stale node reference {id:?}"),
        }
    }
}

/// Which queue a LEB is on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockQueue {
    /// Unmapped, entirely free
    Free,
    Clean,
    Dirty,
    VeryDirty,
    /// Nothing live left; waiting to be handed back to the EBH
    ErasePending,
    /// The open block new records go to
    Next,
    /// The current GC victim
    Gc,
    /// Mapped at mount and not yet adopted by a scan
    Unscanned,
}

impl BlockQueue {
    /// Queue a closed block belongs on given its dirty byte count
    #[must_use]
    pub const fn classify(dirty: u32, eb_size: u32, clean_threshold: u32) -> Self {
        if dirty >= eb_size / 2 {
            Self::VeryDirty
        } else if dirty < clean_threshold {
            Self::Clean
        } else {
            Self::Dirty
        }
    }
}

#[derive(Debug)]
struct BlockInfo {
    queue: BlockQueue,
    refs: Vec<NrefId>,
    /// The reference list covers the whole block
    sealed: bool,
}

/// Queue membership and reference lists of every LEB
#[derive(Debug)]
pub struct BlockLists {
    blocks: Vec<BlockInfo>,
    free: VecDeque<Lnr>,
    clean: VecDeque<Lnr>,
    dirty: VecDeque<Lnr>,
    very_dirty: VecDeque<Lnr>,
    erase_pending: VecDeque<Lnr>,
}

impl BlockLists {
    /// Every block starts on the free queue
    #[must_use]
    pub fn new(leb_count: u32) -> Self {
        Self {
            blocks: (0..leb_count)
                .map(|_| BlockInfo {
                    queue: BlockQueue::Free,
                    refs: Vec::new(),
                    sealed: false,
                })
                .collect(),
            free: (0..leb_count).map(Lnr::new).collect(),
            clean: VecDeque::new(),
            dirty: VecDeque::new(),
            very_dirty: VecDeque::new(),
            erase_pending: VecDeque::new(),
        }
    }

    fn list_mut(&mut self, queue: BlockQueue) -> Option<&mut VecDeque<Lnr>> {
        match queue {
            BlockQueue::Free => Some(&mut self.free),
            BlockQueue::Clean => Some(&mut self.clean),
            BlockQueue::Dirty => Some(&mut self.dirty),
            BlockQueue::VeryDirty => Some(&mut self.very_dirty),
            BlockQueue::ErasePending => Some(&mut self.erase_pending),
            BlockQueue::Next | BlockQueue::Gc | BlockQueue::Unscanned => None,
        }
    }

    fn list(&self, queue: BlockQueue) -> Option<&VecDeque<Lnr>> {
        match queue {
            BlockQueue::Free => Some(&self.free),
            BlockQueue::Clean => Some(&self.clean),
            BlockQueue::Dirty => Some(&self.dirty),
            BlockQueue::VeryDirty => Some(&self.very_dirty),
            BlockQueue::ErasePending => Some(&self.erase_pending),
            BlockQueue::Next | BlockQueue::Gc | BlockQueue::Unscanned => None,
        }
    }

    #[must_use]
    pub fn leb_count(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn queue_of(&self, lnr: Lnr) -> BlockQueue {
        self.blocks[lnr.index()].queue
    }

    /// Move `lnr` onto `queue`, leaving whatever queue it was on
    pub fn file(&mut self, lnr: Lnr, queue: BlockQueue) {
        let old = self.blocks[lnr.index()].queue;
        if old == queue {
            return;
        }
        if let Some(list) = self.list_mut(old) {
            list.retain(|&l| l != lnr);
        }
        if let Some(list) = self.list_mut(queue) {
            list.push_back(lnr);
        }
        self.blocks[lnr.index()].queue = queue;
    }

    #[must_use]
    pub fn len(&self, queue: BlockQueue) -> usize {
        match self.list(queue) {
            Some(list) => list.len(),
            None => self.blocks.iter().filter(|b| b.queue == queue).count(),
        }
    }

    /// First block of a list queue, without removing it
    #[must_use]
    pub fn front(&self, queue: BlockQueue) -> Option<Lnr> {
        self.list(queue)?.front().copied()
    }

    /// Blocks on a queue, in queue order for list queues
    #[must_use]
    pub fn members(&self, queue: BlockQueue) -> Vec<Lnr> {
        match self.list(queue) {
            Some(list) => list.iter().copied().collect(),
            None => self
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| b.queue == queue)
                .filter_map(|(i, _)| u32::try_from(i).ok().map(Lnr::new))
                .collect(),
        }
    }

    #[must_use]
    pub fn refs(&self, lnr: Lnr) -> &[NrefId] {
        &self.blocks[lnr.index()].refs
    }

    pub fn push_ref(&mut self, lnr: Lnr, id: NrefId) {
        self.blocks[lnr.index()].refs.push(id);
    }

    /// Detach the reference list of a block being recycled
    pub fn take_refs(&mut self, lnr: Lnr) -> Vec<NrefId> {
        let info = &mut self.blocks[lnr.index()];
        info.sealed = false;
        std::mem::take(&mut info.refs)
    }

    pub fn seal(&mut self, lnr: Lnr) {
        self.blocks[lnr.index()].sealed = true;
    }

    #[must_use]
    pub fn is_sealed(&self, lnr: Lnr) -> bool {
        self.blocks[lnr.index()].sealed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nref(lnr: u32, offset: u32) -> NodeRef {
        NodeRef {
            lnr: Lnr::new(lnr),
            offset,
            len: 80,
            state: NrefState::Normal,
            node_type: NodeType::Vnode,
            owner: Vno::new(2),
        }
    }

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = NrefArena::new();
        let a = arena.alloc(nref(0, 0));
        let b = arena.alloc(nref(0, 80));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena[b].end(), 160);

        assert_eq!(arena.free(a).map(|r| r.offset), Some(0));
        assert!(arena.get(a).is_none());
        assert!(arena.free(a).is_none());

        let c = arena.alloc(nref(1, 0));
        assert_eq!(c, a);
        assert_eq!(arena[c].lnr, Lnr::new(1));
        assert_eq!(arena.len(), 2);

        arena[c].state = NrefState::Obsolete;
        assert!(arena[c].is_obsolete());
    }

    #[test]
    #[should_panic(expected = "stale node reference")]
    fn test_stale_index_panics() {
        let mut arena = NrefArena::new();
        let a = arena.alloc(nref(0, 0));
        arena.free(a);
        let _nref = arena[a];
    }

    #[test]
    fn test_classify() {
        assert_eq!(BlockQueue::classify(0, 1000, 255), BlockQueue::Clean);
        assert_eq!(BlockQueue::classify(254, 1000, 255), BlockQueue::Clean);
        assert_eq!(BlockQueue::classify(255, 1000, 255), BlockQueue::Dirty);
        assert_eq!(BlockQueue::classify(500, 1000, 255), BlockQueue::VeryDirty);
    }

    #[test]
    fn test_queue_moves() {
        let mut lists = BlockLists::new(4);
        assert_eq!(lists.len(BlockQueue::Free), 4);
        assert_eq!(lists.front(BlockQueue::Free), Some(Lnr::new(0)));

        lists.file(Lnr::new(0), BlockQueue::Next);
        lists.file(Lnr::new(2), BlockQueue::Dirty);
        lists.file(Lnr::new(1), BlockQueue::Dirty);
        assert_eq!(lists.len(BlockQueue::Free), 1);
        assert_eq!(lists.len(BlockQueue::Next), 1);
        assert_eq!(
            lists.members(BlockQueue::Dirty),
            vec![Lnr::new(2), Lnr::new(1)]
        );

        lists.file(Lnr::new(2), BlockQueue::ErasePending);
        assert_eq!(lists.queue_of(Lnr::new(2)), BlockQueue::ErasePending);
        assert_eq!(lists.members(BlockQueue::Dirty), vec![Lnr::new(1)]);
    }

    #[test]
    fn test_ref_lists() {
        let mut arena = NrefArena::new();
        let mut lists = BlockLists::new(2);
        let lnr = Lnr::new(1);
        let a = arena.alloc(nref(1, 0));
        let b = arena.alloc(nref(1, 80));
        lists.push_ref(lnr, a);
        lists.push_ref(lnr, b);
        lists.seal(lnr);
        assert_eq!(lists.refs(lnr), &[a, b]);
        assert!(lists.is_sealed(lnr));

        assert_eq!(lists.take_refs(lnr), vec![a, b]);
        assert!(lists.refs(lnr).is_empty());
        assert!(!lists.is_sealed(lnr));
    }
}
