//! Mounted CHFS instance
//!
//! [`Chfs`] ties the eraseblock handler, the write buffer, the node log,
//! the space ledger and the garbage collector together. Mutable state is
//! split over four ordered locks (see [`crate::lock`]); every operation
//! that writes records runs inside a [`Txn`], which holds the mount and
//! vnode locks for its whole duration.

use chfs_common::{AllocPriority, Config, Error, Lnr, ReserveThresholds, Result, Vno};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info, warn};

use crate::adopt::{self, ScannedNode};
use crate::ebh::Ebh;
use crate::flash::FlashDevice;
use crate::gc;
use crate::ledger::{EbSizes, FsSizes, Ledger};
use crate::lock::{LockLevel, OrderedGuard, OrderedMutex, OrderedRwLock};
use crate::nodes::{BlockLists, BlockQueue, NodeRef, NrefId, NrefState};
use crate::record::{Node, VnodeInfo};
use crate::vnode::{VnodeState, VnodeTable};
use crate::wbuf::WriteBuffer;

/// Engine statistics
#[derive(Debug, Default)]
pub struct ChfsStats {
    pub gc_passes: AtomicU64,
    pub nodes_written: AtomicU64,
    pub nodes_relocated: AtomicU64,
    pub nodes_obsoleted: AtomicU64,
    pub blocks_closed: AtomicU64,
    pub blocks_recycled: AtomicU64,
    pub write_failures: AtomicU64,
}

/// Where a record write gets its space from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Alloc {
    /// Ordinary writers, which may drive the GC
    Normal(AllocPriority),
    /// The GC itself, which never re-enters the GC
    Gc,
}

/// Filesystem-wide metadata behind the mount lock
pub(crate) struct MountState {
    pub blocks: BlockLists,
    /// The block open for writing
    pub nextblock: Option<Lnr>,
    /// The current GC victim
    pub gcblock: Option<Lnr>,
    /// Index into the victim's reference list where the walk resumes
    pub gc_cursor: usize,
    /// Last vnode the unchecked-space pass got through
    pub checked_vno: Vno,
    pub rng: StdRng,
}

pub(crate) struct ChfsInner {
    pub ebh: Ebh,
    pub config: Config,
    pub thresholds: ReserveThresholds,
    pub eb_size: u32,
    pub mount: OrderedMutex<MountState>,
    pub vnodes: OrderedMutex<VnodeTable>,
    pub sizes: OrderedMutex<Ledger>,
    pub wbuf: OrderedRwLock<WriteBuffer>,
    pub gc_tx: Sender<()>,
    pub gc_rx: Receiver<()>,
    pub shutdown: AtomicBool,
    pub stats: ChfsStats,
}

/// Mount and vnode locks held together for one operation
pub(crate) struct Txn<'a> {
    pub fs: &'a ChfsInner,
    pub m: OrderedGuard<'a, MountState>,
    pub v: OrderedGuard<'a, VnodeTable>,
}

pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

impl ChfsInner {
    pub fn begin(&self) -> Txn<'_> {
        let m = self.mount.lock();
        let v = self.vnodes.lock();
        Txn { fs: self, m, v }
    }

    /// Read `len` bytes of a LEB as writers see them, buffered bytes included
    pub fn read_record(&self, lnr: Lnr, offset: u32, len: u32) -> Result<Vec<u8>> {
        // holding the buffer keeps a concurrent flush from slipping
        // between the flash read and the overlay
        let wbuf = self.wbuf.read();
        let mut buf = vec![0u8; len as usize];
        self.ebh.read_leb(lnr, offset, &mut buf)?;
        wbuf.overlay(lnr, offset, &mut buf);
        Ok(buf)
    }

    pub fn classify(&self, dirty: u32) -> BlockQueue {
        BlockQueue::classify(dirty, self.eb_size, self.config.gc.clean_threshold)
    }

    pub fn gc_thread_should_wake(&self) -> bool {
        let m = self.mount.lock();
        let nr_free = m.blocks.len(BlockQueue::Free) as u64;
        let nr_erasable = m.blocks.len(BlockQueue::ErasePending) as u64;
        let nr_very_dirty = m.blocks.len(BlockQueue::VeryDirty) as u64;
        if nr_erasable > 0 {
            return true;
        }

        let totals = self.sizes.lock().totals();
        if totals.unchecked > 0 {
            return true;
        }
        let t = &self.thresholds;
        let dirty = totals
            .dirty
            .saturating_sub(nr_erasable * u64::from(self.eb_size));
        if nr_free + nr_erasable < u64::from(t.gc_trigger_blocks)
            && dirty > u64::from(t.nospc_dirty)
        {
            return true;
        }
        nr_very_dirty > u64::from(t.very_dirty_trigger)
    }

    pub fn gc_trigger(&self) {
        if self.gc_thread_should_wake() {
            // a full channel already holds a pending wake
            let _ = self.gc_tx.try_send(());
        }
    }
}

/// A mounted CHFS instance
pub struct Chfs {
    inner: Arc<ChfsInner>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Chfs {
    /// Open the engine without touching mapped LEBs
    ///
    /// Mapped LEBs stay unscanned until the build step hands their records
    /// over with [`Chfs::adopt_block`]; [`Chfs::start`] then discards
    /// whatever was not adopted and starts the GC thread.
    pub fn open(flash: Arc<dyn FlashDevice>, config: Config) -> Result<Self> {
        config.validate()?;
        let ebh = Ebh::open(flash, &config.ebh)?;
        let eb_size = ebh.eb_size();
        let leb_count = ebh.leb_count();
        let thresholds = config.reserve.resolve(eb_size, leb_count);

        let mut blocks = BlockLists::new(leb_count);
        let mut unscanned = 0;
        for n in 0..leb_count {
            let lnr = Lnr::new(n);
            if ebh.is_mapped(lnr) {
                blocks.file(lnr, BlockQueue::Unscanned);
                unscanned += 1;
            }
        }

        let rng = match config.gc.victim_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let wbuf = WriteBuffer::new(ebh.page_size(), eb_size);
        let (gc_tx, gc_rx) = bounded(1);

        info!(
            eb_size,
            lebs = leb_count,
            unscanned,
            ?thresholds,
            "opened chfs"
        );

        let inner = ChfsInner {
            ebh,
            thresholds,
            eb_size,
            mount: OrderedMutex::new(
                LockLevel::Mount,
                MountState {
                    blocks,
                    nextblock: None,
                    gcblock: None,
                    gc_cursor: 0,
                    checked_vno: Vno::NONE,
                    rng,
                },
            ),
            vnodes: OrderedMutex::new(LockLevel::Vnodes, VnodeTable::new()),
            sizes: OrderedMutex::new(LockLevel::Sizes, Ledger::new(eb_size, leb_count)),
            wbuf: OrderedRwLock::new(LockLevel::Wbuf, wbuf),
            gc_tx,
            gc_rx,
            shutdown: AtomicBool::new(false),
            stats: ChfsStats::default(),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
            gc_thread: Mutex::new(None),
        })
    }

    /// Open, adopt every mapped LEB from a record scan and start
    pub fn mount(flash: Arc<dyn FlashDevice>, config: Config) -> Result<Self> {
        let fs = Self::open(flash, config)?;
        fs.adopt_scanned()?;
        fs.start()?;
        Ok(fs)
    }

    /// Hand the records found on a mapped LEB to the engine
    ///
    /// Unchecked records are validated later by the GC (or on first use of
    /// their vnode); pristine ones are carried along verbatim.
    pub fn adopt_block(&self, lnr: Lnr, nodes: &[ScannedNode]) -> Result<()> {
        self.inner.begin().adopt_block(lnr, nodes)
    }

    /// Scan every unscanned LEB and adopt its records as unchecked
    pub fn adopt_scanned(&self) -> Result<usize> {
        let lebs = self.inner.mount.lock().blocks.members(BlockQueue::Unscanned);
        for &lnr in &lebs {
            let nodes = adopt::scan_leb(&self.inner.ebh, lnr)?;
            self.adopt_block(lnr, &nodes)?;
        }
        Ok(lebs.len())
    }

    /// Finish mounting: drop unadopted blocks and start the GC thread
    pub fn start(&self) -> Result<()> {
        self.inner.begin().discard_unscanned();
        if self.inner.config.gc.background {
            let mut slot = self.gc_thread.lock();
            if slot.is_none() {
                *slot = Some(gc::spawn(Arc::clone(&self.inner))?);
            }
        }
        Ok(())
    }

    // object operations

    /// Create a vnode, returning its number
    pub fn create_vnode(&self, mode: u32) -> Result<Vno> {
        let vno = self.inner.begin().create_vnode(mode)?;
        self.inner.gc_trigger();
        Ok(vno)
    }

    /// Write file data at `offset`
    pub fn write(&self, vno: Vno, offset: u64, data: &[u8]) -> Result<()> {
        let res = self.inner.begin().write_data(vno, offset, data);
        self.inner.gc_trigger();
        res
    }

    /// Read up to `len` bytes at `offset`; holes read as zeros
    pub fn read(&self, vno: Vno, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.ensure_checked(vno)?;
        let v = self.inner.vnodes.lock();
        let vc = v.vnodes.get(&vno).ok_or(Error::VnodeNotFound(vno))?;
        let info = vc.current_info().ok_or(Error::VnodeNotFound(vno))?;
        if offset >= info.size {
            return Ok(Vec::new());
        }
        let len = (len as u64).min(info.size - offset);
        let mut out = vec![0u8; len as usize];

        let mut payloads: HashMap<NrefId, Vec<u8>> = HashMap::new();
        for (start, frag) in vc.extents(offset, len) {
            let payload = match payloads.entry(frag.nref) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => {
                    let r = v.nrefs[frag.nref];
                    let bytes = self.inner.read_record(r.lnr, r.offset, r.len)?;
                    match Node::decode(&bytes) {
                        Ok(Node::Data(d)) => e.insert(d.data),
                        Ok(_) => {
                            return Err(Error::corrupt(r.lnr, r.offset, "not a data record"));
                        }
                        Err(err) => return Err(Error::corrupt(r.lnr, r.offset, err.to_string())),
                    }
                }
            };
            let from = start.max(offset);
            let to = (start + u64::from(frag.len)).min(offset + len);
            let src = frag.node_ofs as usize + (from - start) as usize;
            let n = (to - from) as usize;
            let dst = (from - offset) as usize;
            let bytes = payload
                .get(src..src + n)
                .ok_or_else(|| Error::internal(format!("fragment past the end of {:?}", frag.nref)))?;
            out[dst..dst + n].copy_from_slice(bytes);
        }
        Ok(out)
    }

    /// Set the file size, dropping data past it
    pub fn truncate(&self, vno: Vno, size: u64) -> Result<()> {
        let res = self.inner.begin().truncate(vno, size);
        self.inner.gc_trigger();
        res
    }

    /// Bind `name` in directory `parent` to `child`
    pub fn link(&self, parent: Vno, name: &[u8], child: Vno, dtype: u8) -> Result<()> {
        let res = self.inner.begin().link(parent, name, child, dtype);
        self.inner.gc_trigger();
        res
    }

    /// Remove `name` from `parent` by writing a deletion entry
    pub fn unlink(&self, parent: Vno, name: &[u8]) -> Result<()> {
        let res = self.inner.begin().unlink(parent, name);
        self.inner.gc_trigger();
        res
    }

    /// Drop every record of a vnode
    pub fn delete_vnode(&self, vno: Vno) -> Result<()> {
        let res = self.inner.begin().delete_vnode(vno);
        self.inner.gc_trigger();
        res
    }

    pub fn lookup(&self, parent: Vno, name: &[u8]) -> Result<Option<Vno>> {
        self.ensure_checked(parent)?;
        let v = self.inner.vnodes.lock();
        Ok(v.vnodes
            .get(&parent)
            .and_then(|vc| vc.dirent(name))
            .filter(|e| !e.is_deletion())
            .map(|e| e.vno))
    }

    pub fn readdir(&self, parent: Vno) -> Result<Vec<(Vec<u8>, Vno)>> {
        self.ensure_checked(parent)?;
        let v = self.inner.vnodes.lock();
        Ok(v.vnodes
            .get(&parent)
            .map(|vc| {
                vc.live_dirents()
                    .map(|(name, e)| (name.to_vec(), e.vno))
                    .collect()
            })
            .unwrap_or_default())
    }

    pub fn stat(&self, vno: Vno) -> Result<VnodeInfo> {
        self.ensure_checked(vno)?;
        let v = self.inner.vnodes.lock();
        v.vnodes
            .get(&vno)
            .and_then(|vc| vc.current_info().cloned())
            .ok_or(Error::VnodeNotFound(vno))
    }

    /// Vnodes with a cache entry, in number order
    pub fn vnodes(&self) -> Vec<Vno> {
        self.inner.vnodes.lock().vnodes.keys().copied().collect()
    }

    /// Mark a vnode as being read in, so the GC leaves it alone
    pub fn set_reading(&self, vno: Vno, reading: bool) {
        let mut v = self.inner.vnodes.lock();
        let v = &mut *v;
        let Some(vc) = v.vnodes.get_mut(&vno) else {
            return;
        };
        vc.state = if reading {
            VnodeState::Reading
        } else if vc.chain().any(|id| v.nrefs[id].state == NrefState::Unchecked) {
            VnodeState::Unchecked
        } else {
            VnodeState::Present
        };
    }

    fn ensure_checked(&self, vno: Vno) -> Result<()> {
        let pending = self
            .inner
            .vnodes
            .lock()
            .vnodes
            .get(&vno)
            .is_some_and(|vc| vc.state == VnodeState::Unchecked);
        if pending {
            self.inner.begin().ensure_checked(vno)?;
        }
        Ok(())
    }

    // node log

    /// Pad and write out the write buffer
    pub fn sync(&self) -> Result<()> {
        self.inner.begin().sync()
    }

    /// References on a vnode's chain, in physical order
    pub fn node_refs(&self, vno: Vno) -> Vec<(NrefId, NodeRef)> {
        let v = self.inner.vnodes.lock();
        v.vnodes
            .get(&vno)
            .map(|vc| vc.chain().map(|id| (id, v.nrefs[id])).collect())
            .unwrap_or_default()
    }

    /// References on a block, in physical order
    pub fn block_refs(&self, lnr: Lnr) -> Vec<(NrefId, NodeRef)> {
        let txn = self.inner.begin();
        txn.m
            .blocks
            .refs(lnr)
            .iter()
            .map(|&id| (id, txn.v.nrefs[id]))
            .collect()
    }

    /// Retire one record, dropping it from its vnode's live view
    ///
    /// # Panics
    ///
    /// Panics if the reference is already obsolete.
    pub fn mark_node_obsolete(&self, id: NrefId) {
        let mut txn = self.inner.begin();
        txn.forget_ref(id);
        txn.mark_node_obsolete(id);
        drop(txn);
        self.inner.gc_trigger();
    }

    // reservation

    /// Make room for a record of `size` bytes in the open block
    pub fn reserve_space(&self, size: u32) -> Result<()> {
        self.inner.begin().reserve_space(size)
    }

    /// Reserve as an ordinary writer, driving the GC when space is short
    pub fn reserve_space_normal(&self, size: u32, prio: AllocPriority) -> Result<()> {
        self.inner.begin().reserve_space_normal(size, prio)
    }

    /// Reserve as the GC: no GC passes, only erase-pending recycling
    pub fn reserve_space_gc(&self, size: u32) -> Result<()> {
        self.inner.begin().reserve_space_gc(size)
    }

    // garbage collection

    /// Run one GC pass in the calling thread
    pub fn gc_pass(&self) -> Result<()> {
        self.inner.begin().gc_pass()
    }

    /// Wake the GC thread if there is work for it
    pub fn gc_trigger(&self) {
        self.inner.gc_trigger();
    }

    #[must_use]
    pub fn gc_thread_should_wake(&self) -> bool {
        self.inner.gc_thread_should_wake()
    }

    // introspection

    #[must_use]
    pub fn ebh(&self) -> &Ebh {
        &self.inner.ebh
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn thresholds(&self) -> ReserveThresholds {
        self.inner.thresholds
    }

    #[must_use]
    pub fn stats(&self) -> &ChfsStats {
        &self.inner.stats
    }

    #[must_use]
    pub fn eb_size(&self) -> u32 {
        self.inner.eb_size
    }

    /// Filesystem-wide byte totals
    #[must_use]
    pub fn sizes(&self) -> FsSizes {
        self.inner.sizes.lock().totals()
    }

    #[must_use]
    pub fn eb_sizes(&self, lnr: Lnr) -> EbSizes {
        self.inner.sizes.lock().block(lnr)
    }

    #[must_use]
    pub fn block_queue(&self, lnr: Lnr) -> BlockQueue {
        self.inner.mount.lock().blocks.queue_of(lnr)
    }

    #[must_use]
    pub fn queue_len(&self, queue: BlockQueue) -> usize {
        self.inner.mount.lock().blocks.len(queue)
    }

    #[must_use]
    pub fn queue_members(&self, queue: BlockQueue) -> Vec<Lnr> {
        self.inner.mount.lock().blocks.members(queue)
    }

    #[must_use]
    pub fn nextblock(&self) -> Option<Lnr> {
        self.inner.mount.lock().nextblock
    }

    #[must_use]
    pub fn gcblock(&self) -> Option<Lnr> {
        self.inner.mount.lock().gcblock
    }

    /// Verify the ledger against itself and against the node references
    ///
    /// # Panics
    ///
    /// Panics on any inconsistency.
    pub fn check_consistency(&self) {
        self.inner.begin().check_consistency();
    }

    /// Stop the GC thread, flush the write buffer and close the EBH
    pub fn close(&self) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let _ = self.inner.gc_tx.try_send(());
        if let Some(handle) = self.gc_thread.lock().take() {
            if handle.join().is_err() {
                error!("GC thread panicked");
            }
        }
        let res = self.inner.begin().sync();
        self.inner.ebh.close();
        info!(sizes = %self.sizes(), "closed chfs");
        res
    }
}

impl Drop for Chfs {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("flush on close failed: {e}");
        }
    }
}
