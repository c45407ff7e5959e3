//! In-memory vnode caches
//!
//! Each vnode keeps the chain of every record that belongs to it, keyed by
//! physical position, plus the live view built from those records: the
//! current vnode information, a fragment map for file data and a name map
//! for directory entries. Fragments and dirents point back into the chain
//! by [`NrefId`], so relocating a record is one repoint.

use chfs_common::{Lnr, Vno};
use std::collections::{BTreeMap, HashMap};

use crate::nodes::{NrefArena, NrefId};
use crate::record::VnodeInfo;

/// State of a vnode cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VnodeState {
    /// Has records that were adopted but not yet validated
    Unchecked,
    /// Being validated by the GC
    Checking,
    Present,
    /// A reader is building the vnode; the GC backs off
    Reading,
}

/// Piece of file data served by one data record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Frag {
    pub len: u32,
    pub nref: NrefId,
    /// Offset of the piece inside the record payload
    pub node_ofs: u32,
    pub version: u64,
}

/// Current binding of one directory entry name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirentEntry {
    /// `Vno::NONE` for a deletion
    pub vno: Vno,
    pub version: u64,
    pub dtype: u8,
    pub nref: NrefId,
}

impl DirentEntry {
    #[must_use]
    pub const fn is_deletion(&self) -> bool {
        self.vno.is_none()
    }
}

/// Cached state of one vnode
#[derive(Debug)]
pub struct VnodeCache {
    pub vno: Vno,
    pub state: VnodeState,
    pub info: Option<VnodeInfo>,
    pub info_ref: Option<NrefId>,
    chain: BTreeMap<(Lnr, u32), NrefId>,
    frags: BTreeMap<u64, Frag>,
    frag_counts: HashMap<NrefId, u32>,
    dirents: BTreeMap<Vec<u8>, DirentEntry>,
    highest_version: u64,
}

impl VnodeCache {
    #[must_use]
    pub fn new(vno: Vno) -> Self {
        Self {
            vno,
            state: VnodeState::Present,
            info: None,
            info_ref: None,
            chain: BTreeMap::new(),
            frags: BTreeMap::new(),
            frag_counts: HashMap::new(),
            dirents: BTreeMap::new(),
            highest_version: 0,
        }
    }

    /// Version for the next record written for this vnode
    pub fn next_version(&mut self) -> u64 {
        self.highest_version += 1;
        self.highest_version
    }

    pub fn note_version(&mut self, version: u64) {
        self.highest_version = self.highest_version.max(version);
    }

    #[must_use]
    pub const fn highest_version(&self) -> u64 {
        self.highest_version
    }

    // chain

    /// Link a reference into the chain
    ///
    /// Returns the reference previously linked at the same position, if it
    /// was a different one.
    pub fn link(&mut self, lnr: Lnr, offset: u32, id: NrefId) -> Option<NrefId> {
        self.chain.insert((lnr, offset), id).filter(|&old| old != id)
    }

    /// Unlink `id` from its position, if it is still the one linked there
    pub fn unlink(&mut self, lnr: Lnr, offset: u32, id: NrefId) {
        if self.chain.get(&(lnr, offset)) == Some(&id) {
            self.chain.remove(&(lnr, offset));
        }
    }

    /// Chain references in physical order
    pub fn chain(&self) -> impl Iterator<Item = NrefId> + '_ {
        self.chain.values().copied()
    }

    #[must_use]
    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    // fragments

    fn overlapping(&self, start: u64, end: u64) -> Vec<(u64, Frag)> {
        // fragments never overlap, so at most one starts before `start`
        // and reaches into the range
        let before = self
            .frags
            .range(..start)
            .next_back()
            .filter(|&(s, f)| *s + u64::from(f.len) > start);
        before
            .into_iter()
            .chain(self.frags.range(start..end))
            .map(|(s, f)| (*s, *f))
            .collect()
    }

    fn add_frag(&mut self, start: u64, frag: Frag) {
        self.frags.insert(start, frag);
        *self.frag_counts.entry(frag.nref).or_insert(0) += 1;
    }

    fn release_frag(&mut self, nref: NrefId, dead: &mut Vec<NrefId>) {
        if let Some(count) = self.frag_counts.get_mut(&nref) {
            *count -= 1;
            if *count == 0 {
                self.frag_counts.remove(&nref);
                dead.push(nref);
            }
        }
    }

    fn place(&mut self, start: u64, frag: Frag, dead: &mut Vec<NrefId>) {
        let end = start + u64::from(frag.len);
        for (s, old) in self.overlapping(start, end) {
            self.frags.remove(&s);
            let old_end = s + u64::from(old.len);
            if s < start {
                self.add_frag(
                    s,
                    Frag {
                        len: (start - s) as u32,
                        ..old
                    },
                );
            }
            if old_end > end {
                self.add_frag(
                    end,
                    Frag {
                        len: (old_end - end) as u32,
                        node_ofs: old.node_ofs + (end - s) as u32,
                        ..old
                    },
                );
            }
            self.release_frag(old.nref, dead);
        }
        self.add_frag(start, frag);
    }

    /// Insert a data record covering `len` bytes at file `offset`
    ///
    /// Parts already covered by a newer version are left alone. Returns the
    /// references left without any fragment, `nref` included when it was
    /// entirely superseded.
    pub fn insert_frag(
        &mut self,
        offset: u64,
        len: u32,
        nref: NrefId,
        node_ofs: u32,
        version: u64,
    ) -> Vec<NrefId> {
        let end = offset + u64::from(len);
        let mut pieces = Vec::new();
        let mut cursor = offset;
        for (s, f) in self.overlapping(offset, end) {
            if f.version <= version {
                continue;
            }
            let (s, e) = (s.max(offset), (s + u64::from(f.len)).min(end));
            if s > cursor {
                pieces.push((cursor, s));
            }
            cursor = cursor.max(e);
        }
        if cursor < end {
            pieces.push((cursor, end));
        }

        let mut dead = Vec::new();
        for (s, e) in pieces {
            let frag = Frag {
                len: (e - s) as u32,
                nref,
                node_ofs: node_ofs + (s - offset) as u32,
                version,
            };
            self.place(s, frag, &mut dead);
        }
        if !self.frag_counts.contains_key(&nref) {
            dead.push(nref);
        }
        dead
    }

    /// Cut the data map at `size`, returning references left unused
    pub fn truncate_frags(&mut self, size: u64) -> Vec<NrefId> {
        let mut dead = Vec::new();
        for (s, f) in self.overlapping(size, u64::MAX) {
            self.frags.remove(&s);
            if s < size {
                self.add_frag(
                    s,
                    Frag {
                        len: (size - s) as u32,
                        ..f
                    },
                );
            }
            self.release_frag(f.nref, &mut dead);
        }
        dead
    }

    /// Fragments overlapping `[offset, offset + len)`, in file order
    #[must_use]
    pub fn extents(&self, offset: u64, len: u64) -> Vec<(u64, Frag)> {
        self.overlapping(offset, offset.saturating_add(len))
    }

    /// Fragments served by one record
    #[must_use]
    pub fn frags_of(&self, nref: NrefId) -> Vec<(u64, Frag)> {
        if !self.frag_counts.contains_key(&nref) {
            return Vec::new();
        }
        self.frags
            .iter()
            .filter(|(_, f)| f.nref == nref)
            .map(|(s, f)| (*s, *f))
            .collect()
    }

    /// Forget every fragment of a record that can no longer be read
    pub fn drop_frags_of(&mut self, nref: NrefId) {
        self.frags.retain(|_, f| f.nref != nref);
        self.frag_counts.remove(&nref);
    }

    #[must_use]
    pub fn frag_count(&self) -> usize {
        self.frags.len()
    }

    // directory entries

    #[must_use]
    pub fn dirent(&self, name: &[u8]) -> Option<&DirentEntry> {
        self.dirents.get(name)
    }

    /// Bind a name, returning the previous binding
    pub fn set_dirent(&mut self, name: Vec<u8>, entry: DirentEntry) -> Option<DirentEntry> {
        self.dirents.insert(name, entry)
    }

    pub fn remove_dirent(&mut self, name: &[u8]) -> Option<DirentEntry> {
        self.dirents.remove(name)
    }

    /// Name and binding of the entry a record provides
    #[must_use]
    pub fn dirent_by_ref(&self, nref: NrefId) -> Option<(Vec<u8>, DirentEntry)> {
        self.dirents
            .iter()
            .find(|(_, e)| e.nref == nref)
            .map(|(n, e)| (n.clone(), *e))
    }

    /// Names bound to a vnode, deletions excluded
    pub fn live_dirents(&self) -> impl Iterator<Item = (&[u8], &DirentEntry)> + '_ {
        self.dirents
            .iter()
            .filter(|(_, e)| !e.is_deletion())
            .map(|(n, e)| (n.as_slice(), e))
    }

    /// Point everything that used `old` at `new`
    pub fn repoint(&mut self, old: NrefId, new: NrefId) {
        if self.info_ref == Some(old) {
            self.info_ref = Some(new);
        }
        if let Some(count) = self.frag_counts.remove(&old) {
            for frag in self.frags.values_mut().filter(|f| f.nref == old) {
                frag.nref = new;
            }
            self.frag_counts.insert(new, count);
        }
        for entry in self.dirents.values_mut().filter(|e| e.nref == old) {
            entry.nref = new;
        }
    }

    /// Whether any live structure still uses `nref`
    #[must_use]
    pub fn uses(&self, nref: NrefId) -> bool {
        self.info_ref == Some(nref)
            || self.frag_counts.contains_key(&nref)
            || self.dirents.values().any(|e| e.nref == nref)
    }

    /// The vnode's attributes, unless its newest record deletes it
    #[must_use]
    pub fn current_info(&self) -> Option<&VnodeInfo> {
        self.info.as_ref().filter(|info| !info.is_deleted())
    }
}

/// All vnode caches of a mount plus the reference arena they point into
#[derive(Debug)]
pub struct VnodeTable {
    pub nrefs: NrefArena,
    pub vnodes: BTreeMap<Vno, VnodeCache>,
    /// Highest vnode number seen
    pub max_vno: Vno,
}

impl Default for VnodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VnodeTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nrefs: NrefArena::new(),
            vnodes: BTreeMap::new(),
            max_vno: Vno::ROOT,
        }
    }

    pub fn get_or_insert(&mut self, vno: Vno) -> &mut VnodeCache {
        self.max_vno = self.max_vno.max(vno);
        self.vnodes.entry(vno).or_insert_with(|| VnodeCache::new(vno))
    }

    /// Next unused vnode number
    pub fn allocate_vno(&mut self) -> Vno {
        self.max_vno = self.max_vno.next();
        self.max_vno
    }
}
