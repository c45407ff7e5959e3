//! Eraseblock handler
//!
//! Presents the flash as a set of logical eraseblocks (LEBs) that can be
//! read, written, erased and atomically replaced, while physical blocks
//! (PEBs) underneath are allocated least-worn-first and erased in the
//! background.
//!
//! Locking, outermost first: the per-LEB lock from the [`LockTree`], the
//! allocation mutex, the PEB pool mutex. The LEB map itself is an array of
//! atomics; an entry is only changed while its LEB is write-locked.

mod ltree;
mod pool;
mod scan;
mod worker;

pub use ltree::{LebReadGuard, LebWriteGuard, LockTree};
pub use pool::{Peb, PoolSnapshot};
pub use scan::TieBreak;

use crate::flash::FlashDevice;
use crate::layout::{EcHeader, Geometry, LebHeader, NOR_INVALIDATE_SIZE, nor_dirty_lid};
use chfs_common::config::EbhConfig;
use chfs_common::{Error, Lnr, MediaKind, Pebnr, Result};
use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use pool::{EraseWork, PebPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

const UNMAPPED: u32 = u32::MAX;

/// Eraseblock handler statistics
#[derive(Debug, Default)]
pub struct EbhStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub erases: AtomicU64,
    pub erase_failures: AtomicU64,
    pub header_writes: AtomicU64,
    pub peb_allocs: AtomicU64,
    pub bad_blocks: AtomicU64,
}

/// State shared between the handler and its erase worker
pub(crate) struct EbhCore {
    flash: Arc<dyn FlashDevice>,
    geo: Geometry,
    leb_count: u32,
    /// Good PEBs; shrinks when a block goes bad
    peb_count: AtomicU32,
    lmap: Vec<AtomicU32>,
    ltree: LockTree,
    pool: Mutex<PebPool>,
    alloc_lock: Mutex<()>,
    max_serial: AtomicU64,
    max_retries: u32,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    shutdown: AtomicBool,
    stats: EbhStats,
}

impl EbhCore {
    fn lookup(&self, lnr: Lnr) -> Option<Pebnr> {
        match self.lmap[lnr.index()].load(Ordering::Acquire) {
            UNMAPPED => None,
            n => Some(Pebnr::new(n)),
        }
    }

    fn set_map(&self, lnr: Lnr, peb: Option<Pebnr>) {
        let raw = peb.map_or(UNMAPPED, Pebnr::get);
        self.lmap[lnr.index()].store(raw, Ordering::Release);
    }

    fn check_leb(&self, lnr: Lnr) -> Result<()> {
        if lnr.get() >= self.leb_count {
            return Err(Error::invalid_argument(format!(
                "{lnr} is beyond the {} LEBs of the device",
                self.leb_count
            )));
        }
        Ok(())
    }

    fn check_io(&self, lnr: Lnr, offset: u32, len: usize) -> Result<()> {
        self.check_leb(lnr)?;
        if u64::from(offset) + len as u64 > u64::from(self.geo.eb_size()) {
            return Err(Error::invalid_argument(format!(
                "I/O of {len} bytes at {lnr}:{offset} exceeds the LEB size {}",
                self.geo.eb_size()
            )));
        }
        Ok(())
    }

    fn wake(&self) {
        // a full channel already holds a pending wake
        let _ = self.wake_tx.try_send(());
    }

    fn write_raw(&self, offset: u64, data: &[u8]) -> Result<()> {
        let written = self.flash.write(offset, data)?;
        if written != data.len() {
            return Err(Error::device(format!(
                "short write at {offset}: {written} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    fn write_ec_header(&self, peb: Peb) -> Result<()> {
        let hdr = EcHeader {
            erase_cnt: peb.erase_cnt,
        };
        self.write_raw(self.geo.peb_offset(peb.pebnr), &hdr.to_bytes())?;
        self.stats.header_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_leb_header(&self, pebnr: Pebnr, lnr: Lnr) -> Result<()> {
        let hdr = match self.geo.kind {
            MediaKind::Nor => LebHeader::nor(lnr),
            MediaKind::Nand => {
                let serial = self.max_serial.fetch_add(1, Ordering::Relaxed) + 1;
                LebHeader::nand(lnr, serial)
            }
        };
        let offset = self.geo.peb_offset(pebnr) + u64::from(self.geo.leb_hdr_offset());
        self.write_raw(offset, &hdr.to_bytes())?;
        self.stats.header_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_data(&self, lnr: Lnr, pebnr: Pebnr, offset: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.write_raw(self.geo.data_offset(pebnr, offset), data)
            .map_err(|e| Error::flash(lnr, offset, e.to_string()))?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Hand a PEB back for erasure and wake the worker
    fn release_peb(&self, pebnr: Pebnr) {
        let released = self.pool.lock().release(pebnr);
        if released.is_none() {
            error!(%pebnr, "released a PEB that was not in use");
        }
        self.wake();
    }

    /// Allocate the least worn free PEB, erasing synchronously if needed
    fn get_peb(&self) -> Result<Peb> {
        // every good PEB gets a few chances to come out of the erase queues
        let mut budget = self.leb_count.saturating_mul(self.max_retries + 2);
        loop {
            {
                let mut pool = self.pool.lock();
                if let Some(peb) = pool.take_free() {
                    self.stats.peb_allocs.fetch_add(1, Ordering::Relaxed);
                    debug!(pebnr = %peb.pebnr, ec = peb.erase_cnt, "allocated PEB");
                    return Ok(peb);
                }
                if !pool.has_work() {
                    return Err(Error::NoSpace);
                }
            }
            if budget == 0 {
                error!("erase queues keep failing, no PEB available");
                return Err(Error::NoSpace);
            }
            budget -= 1;
            match self.free_peb() {
                Ok(_) | Err(Error::EraseFailed { .. } | Error::BadBlock { .. }) => {}
                Err(e) => warn!("synchronous erase failed: {e}"),
            }
        }
    }

    /// Bind a fresh PEB with a LEB header to `lnr`, then write `data`
    ///
    /// Caller holds the LEB write lock and the allocation mutex. A failed
    /// header or data write sends the PEB to the erase queue and retries
    /// with another one.
    fn map_fresh(&self, lnr: Lnr, offset: u32, data: &[u8]) -> Result<Pebnr> {
        let mut retries = 0;
        loop {
            let peb = self.get_peb()?;
            let res = self
                .write_leb_header(peb.pebnr, lnr)
                .and_then(|()| self.write_data(lnr, peb.pebnr, offset, data));
            match res {
                Ok(()) => {
                    self.set_map(lnr, Some(peb.pebnr));
                    return Ok(peb.pebnr);
                }
                Err(e) => {
                    self.release_peb(peb.pebnr);
                    retries += 1;
                    if retries > self.max_retries {
                        error!(%lnr, "giving up mapping after {retries} attempts: {e}");
                        return Err(e);
                    }
                    warn!(%lnr, pebnr = %peb.pebnr, "write failed, retrying on a fresh PEB: {e}");
                }
            }
        }
    }

    /// Run one unit of erase work; returns whether there was any
    pub(crate) fn free_peb(&self) -> Result<bool> {
        let Some(work) = self.pool.lock().pop_work() else {
            return Ok(false);
        };

        match work {
            EraseWork::WriteHeader(peb) => {
                if let Err(e) = self.write_ec_header(peb) {
                    warn!(pebnr = %peb.pebnr, "EC header write failed, queueing erase: {e}");
                    self.pool.lock().add_to_erase(peb);
                    return Err(e);
                }
                self.pool.lock().add_free(peb);
            }
            EraseWork::Erase(peb) => self.erase_peb(peb)?,
        }
        Ok(true)
    }

    fn erase_peb(&self, mut peb: Peb) -> Result<()> {
        let mut failures = 0;
        loop {
            match self.flash.erase(peb.pebnr) {
                Ok(()) => break,
                Err(e) => {
                    self.stats.erase_failures.fetch_add(1, Ordering::Relaxed);
                    failures += 1;
                    let hopeless = matches!(e, Error::BadBlock { .. });
                    if hopeless || failures > self.max_retries {
                        self.retire_peb(peb.pebnr);
                        return Err(Error::EraseFailed { peb: peb.pebnr });
                    }
                    warn!(pebnr = %peb.pebnr, "erase failed, retrying: {e}");
                }
            }
        }
        self.stats.erases.fetch_add(1, Ordering::Relaxed);

        peb.erase_cnt += 1;
        if let Err(e) = self.write_ec_header(peb) {
            warn!(pebnr = %peb.pebnr, "EC header write after erase failed: {e}");
            self.pool.lock().add_to_erase(peb);
            return Err(e);
        }
        debug!(pebnr = %peb.pebnr, ec = peb.erase_cnt, "erased PEB");
        self.pool.lock().add_free(peb);
        Ok(())
    }

    fn retire_peb(&self, pebnr: Pebnr) {
        error!(%pebnr, "erase keeps failing, marking block bad");
        if let Err(e) = self.flash.mark_bad(pebnr) {
            error!(%pebnr, "failed to mark block bad: {e}");
        }
        self.peb_count.fetch_sub(1, Ordering::Relaxed);
        self.stats.bad_blocks.fetch_add(1, Ordering::Relaxed);
    }
}

/// The eraseblock handler
pub struct Ebh {
    core: Arc<EbhCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Ebh {
    /// Scan the device, rebuild the LEB map and start the erase worker
    pub fn open(flash: Arc<dyn FlashDevice>, config: &EbhConfig) -> Result<Self> {
        let geo = Geometry::new(flash.kind(), flash.erase_size(), flash.page_size());
        if geo.erase_size <= geo.data_start() || flash.peb_count() == 0 {
            return Err(Error::Configuration(format!(
                "eraseblock of {} bytes cannot hold headers and data",
                geo.erase_size
            )));
        }
        let leb_count = flash.peb_count();

        let result = scan::scan_media(flash.as_ref(), &geo, leb_count)?;
        let avg_ec = result.avg_ec();

        let mut pool = PebPool::default();
        let lmap: Vec<AtomicU32> = (0..leb_count).map(|_| AtomicU32::new(UNMAPPED)).collect();
        for (lnr, claim) in &result.used {
            lmap[lnr.index()].store(claim.pebnr.get(), Ordering::Relaxed);
            pool.add_in_use(Peb::new(claim.pebnr, claim.erase_cnt));
        }
        for &(pebnr, ec) in &result.free {
            pool.add_free(Peb::new(pebnr, ec));
        }
        for &pebnr in &result.erased {
            pool.add_fully_erased(Peb::new(pebnr, avg_ec));
        }
        for &pebnr in result.to_erase.iter().chain(&result.corrupted) {
            pool.add_to_erase(Peb::new(pebnr, avg_ec));
        }

        info!(
            kind = %geo.kind,
            pebs = leb_count,
            used = result.used.len(),
            free = result.free.len(),
            erased = result.erased.len(),
            to_erase = result.to_erase.len() + result.corrupted.len(),
            bad = result.bad,
            avg_ec,
            "eraseblock handler opened"
        );

        let (wake_tx, wake_rx) = bounded(1);
        let core = Arc::new(EbhCore {
            flash,
            geo,
            leb_count,
            peb_count: AtomicU32::new(leb_count - result.bad),
            lmap,
            ltree: LockTree::new(),
            pool: Mutex::new(pool),
            alloc_lock: Mutex::new(()),
            max_serial: AtomicU64::new(result.max_serial),
            max_retries: config.max_peb_retries,
            wake_tx,
            wake_rx,
            shutdown: AtomicBool::new(false),
            stats: EbhStats::default(),
        });
        core.stats
            .bad_blocks
            .store(u64::from(result.bad), Ordering::Relaxed);

        let ebh = Self {
            core,
            worker: Mutex::new(None),
        };
        if config.background_erase {
            let handle = worker::spawn(Arc::clone(&ebh.core), config.erase_interval())?;
            *ebh.worker.lock() = Some(handle);
        }
        Ok(ebh)
    }

    /// Media geometry
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.core.geo
    }

    /// Usable bytes per LEB
    #[must_use]
    pub fn eb_size(&self) -> u32 {
        self.core.geo.eb_size()
    }

    /// Number of LEBs
    #[must_use]
    pub fn leb_count(&self) -> u32 {
        self.core.leb_count
    }

    /// Number of good PEBs
    #[must_use]
    pub fn peb_count(&self) -> u32 {
        self.core.peb_count.load(Ordering::Relaxed)
    }

    /// Device size in bytes
    #[must_use]
    pub fn flash_size(&self) -> u64 {
        self.core.flash.size()
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.core.geo.page_size
    }

    #[must_use]
    pub fn stats(&self) -> &EbhStats {
        &self.core.stats
    }

    /// Is `lnr` bound to a PEB?
    #[must_use]
    pub fn is_mapped(&self, lnr: Lnr) -> bool {
        lnr.get() < self.core.leb_count && self.core.lookup(lnr).is_some()
    }

    /// PEB currently holding `lnr`
    #[must_use]
    pub fn peb_of(&self, lnr: Lnr) -> Option<Pebnr> {
        if lnr.get() >= self.core.leb_count {
            return None;
        }
        self.core.lookup(lnr)
    }

    /// Erase counter of a good PEB
    #[must_use]
    pub fn erase_cnt(&self, pebnr: Pebnr) -> Option<u32> {
        self.core.pool.lock().erase_cnt(pebnr)
    }

    /// Copy of the PEB pool state
    #[must_use]
    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.core.pool.lock().snapshot()
    }

    /// Number of LEBs with a live lock-tree entry
    #[must_use]
    pub fn locked_lebs(&self) -> usize {
        self.core.ltree.len()
    }

    /// Read from a LEB; an unmapped LEB reads as erased bytes
    pub fn read_leb(&self, lnr: Lnr, offset: u32, buf: &mut [u8]) -> Result<()> {
        let core = &self.core;
        core.check_io(lnr, offset, buf.len())?;
        let _lock = core.ltree.read(lnr);

        let Some(pebnr) = core.lookup(lnr) else {
            buf.fill(0xFF);
            return Ok(());
        };
        let read = core
            .flash
            .read(core.geo.data_offset(pebnr, offset), buf)
            .map_err(|e| Error::flash(lnr, offset, e.to_string()))?;
        if read != buf.len() {
            return Err(Error::flash(
                lnr,
                offset,
                format!("short read: {read} of {} bytes", buf.len()),
            ));
        }
        core.stats.reads.fetch_add(1, Ordering::Relaxed);
        core.stats
            .bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Write to a LEB, binding a fresh PEB first if it is unmapped
    pub fn write_leb(&self, lnr: Lnr, offset: u32, data: &[u8]) -> Result<()> {
        let core = &self.core;
        core.check_io(lnr, offset, data.len())?;
        let _lock = core.ltree.write(lnr);

        if let Some(pebnr) = core.lookup(lnr) {
            return core.write_data(lnr, pebnr, offset, data);
        }

        let _alloc = core.alloc_lock.lock();
        let pebnr = core.map_fresh(lnr, offset, data)?;
        debug!(%lnr, %pebnr, "mapped LEB on write");
        Ok(())
    }

    /// Bind a fresh PEB to an unmapped LEB without writing data
    pub fn map_leb(&self, lnr: Lnr) -> Result<()> {
        let core = &self.core;
        core.check_leb(lnr)?;
        let _lock = core.ltree.write(lnr);
        if core.lookup(lnr).is_some() {
            return Err(Error::LebMapped(lnr));
        }
        let _alloc = core.alloc_lock.lock();
        core.map_fresh(lnr, 0, &[])?;
        Ok(())
    }

    /// Drop the LEB binding; the PEB is queued for erasure
    pub fn erase_leb(&self, lnr: Lnr) -> Result<()> {
        let core = &self.core;
        core.check_leb(lnr)?;
        let _lock = core.ltree.write(lnr);
        let pebnr = core.lookup(lnr).ok_or(Error::LebUnmapped(lnr))?;
        core.set_map(lnr, None);
        core.release_peb(pebnr);
        debug!(%lnr, %pebnr, "erased LEB");
        Ok(())
    }

    /// Like [`Ebh::erase_leb`] but a no-op for an unmapped LEB
    pub fn unmap_leb(&self, lnr: Lnr) -> Result<()> {
        match self.erase_leb(lnr) {
            Err(Error::LebUnmapped(_)) => Ok(()),
            other => other,
        }
    }

    /// Atomically replace the contents of a mapped LEB
    ///
    /// The new contents go to a fresh PEB; the LEB map switches only after
    /// they are on flash. On NOR the old header is flagged dirty before and
    /// invalidated after the switch so a scan after a crash picks the
    /// right copy.
    pub fn change_leb(&self, lnr: Lnr, data: &[u8]) -> Result<()> {
        let core = &self.core;
        core.check_io(lnr, 0, data.len())?;

        if data.is_empty() {
            if !self.is_mapped(lnr) {
                return Err(Error::LebUnmapped(lnr));
            }
            self.unmap_leb(lnr)?;
            return self.map_leb(lnr);
        }

        let _lock = core.ltree.write(lnr);
        let old = core.lookup(lnr).ok_or(Error::LebUnmapped(lnr))?;
        let _alloc = core.alloc_lock.lock();

        let hdr_offset = core.geo.peb_offset(old) + u64::from(core.geo.leb_hdr_offset());
        if core.geo.kind == MediaKind::Nor {
            core.write_raw(hdr_offset + 4, &nor_dirty_lid(lnr))
                .map_err(|e| Error::flash(lnr, 0, format!("marking old header dirty: {e}")))?;
        }

        let new = core.map_fresh(lnr, 0, data)?;

        if core.geo.kind == MediaKind::Nor {
            if let Err(e) = core.write_raw(hdr_offset, &[0u8; NOR_INVALIDATE_SIZE]) {
                warn!(%lnr, pebnr = %old, "failed to invalidate old header: {e}");
            }
        }
        core.release_peb(old);
        debug!(%lnr, old = %old, new = %new, "changed LEB");
        Ok(())
    }

    /// Run one unit of erase work in the calling thread
    pub fn erase_step(&self) -> Result<bool> {
        self.core.free_peb()
    }

    /// Drain all queued erase work in the calling thread
    pub fn flush_erase_queue(&self) -> Result<()> {
        loop {
            match self.core.free_peb() {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                // the block was retired, keep draining
                Err(Error::EraseFailed { .. }) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop the erase worker; idempotent
    pub fn close(&self) {
        self.core.shutdown.store(true, Ordering::Relaxed);
        self.core.wake();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("erase worker panicked");
            }
            info!("eraseblock handler closed");
        }
    }
}

impl Drop for Ebh {
    fn drop(&mut self) {
        self.close();
    }
}
