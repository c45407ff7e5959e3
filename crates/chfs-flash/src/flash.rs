//! Flash driver abstraction
//!
//! The eraseblock handler talks to the media only through [`FlashDevice`].
//! Two implementations ship with the crate: [`MemFlash`], an in-memory
//! simulator with fault injection, and [`crate::FileFlash`], a flash image
//! kept in a regular file.
//!
//! Both follow flash programming rules: erase sets every byte of a block
//! to `0xFF`, and programming can only clear bits (new = old & data).

use chfs_common::config::FlashConfig;
use chfs_common::{Error, MediaKind, Pebnr, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

/// Raw flash operations needed by the eraseblock handler
pub trait FlashDevice: Send + Sync {
    /// Media kind, decides header layout and scan tie-break
    fn kind(&self) -> MediaKind;

    /// Physical eraseblock size in bytes
    fn erase_size(&self) -> u32;

    /// Program page size in bytes
    fn page_size(&self) -> u32;

    /// Number of physical eraseblocks
    fn peb_count(&self) -> u32;

    /// Device size in bytes
    fn size(&self) -> u64 {
        u64::from(self.erase_size()) * u64::from(self.peb_count())
    }

    /// Read into `buf` at absolute `offset`, returning the bytes read
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Program `data` at absolute `offset`, returning the bytes written
    fn write(&self, offset: u64, data: &[u8]) -> Result<usize>;

    /// Erase one physical block
    fn erase(&self, peb: Pebnr) -> Result<()>;

    /// Check the factory/runtime bad-block mark
    fn block_is_bad(&self, peb: Pebnr) -> Result<bool>;

    /// Mark a block bad so it is never used again
    fn mark_bad(&self, peb: Pebnr) -> Result<()>;
}

/// Check that an I/O range stays inside one eraseblock of the device
pub(crate) fn check_range(
    erase_size: u32,
    peb_count: u32,
    offset: u64,
    len: usize,
) -> Result<Pebnr> {
    let erase_size = u64::from(erase_size);
    let peb = offset / erase_size;
    if peb >= u64::from(peb_count) {
        return Err(Error::invalid_argument(format!(
            "offset {offset} is beyond the device"
        )));
    }
    let end = offset + len as u64;
    if end > (peb + 1) * erase_size {
        return Err(Error::invalid_argument(format!(
            "I/O at {offset} of {len} bytes crosses an eraseblock boundary"
        )));
    }
    // peb < peb_count, so it fits in u32
    Ok(Pebnr::new(peb as u32))
}

#[derive(Debug, Default)]
struct Faults {
    bad: BTreeSet<Pebnr>,
    failing_writes: HashMap<Pebnr, u32>,
    failing_erases: HashMap<Pebnr, u32>,
}

impl Faults {
    fn take(map: &mut HashMap<Pebnr, u32>, peb: Pebnr) -> bool {
        match map.get_mut(&peb) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// In-memory flash simulator
///
/// Used by the test-suite and the `exercise` command. Faults can be
/// injected per physical block: failing writes, failing erases and bad
/// block marks.
pub struct MemFlash {
    kind: MediaKind,
    erase_size: u32,
    page_size: u32,
    peb_count: u32,
    data: RwLock<Vec<u8>>,
    faults: Mutex<Faults>,
    /// Physical erase operations per block (successful ones)
    erases: Vec<AtomicU32>,
}

impl MemFlash {
    /// Create a fully erased device
    #[must_use]
    pub fn new(kind: MediaKind, erase_size: u32, page_size: u32, peb_count: u32) -> Self {
        let size = erase_size as usize * peb_count as usize;
        Self {
            kind,
            erase_size,
            page_size,
            peb_count,
            data: RwLock::new(vec![0xFF; size]),
            faults: Mutex::new(Faults::default()),
            erases: (0..peb_count).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Create a device from a geometry configuration
    pub fn from_config(cfg: &FlashConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::new(cfg.kind, cfg.erase_size, cfg.page_size, cfg.peb_count))
    }

    /// Make the next `n` writes into `peb` fail
    pub fn fail_writes(&self, peb: Pebnr, n: u32) {
        self.faults.lock().failing_writes.insert(peb, n);
    }

    /// Make the next `n` erases of `peb` fail
    pub fn fail_erases(&self, peb: Pebnr, n: u32) {
        self.faults.lock().failing_erases.insert(peb, n);
    }

    /// Set a bad-block mark, as if the factory had set it
    pub fn set_bad(&self, peb: Pebnr) {
        self.faults.lock().bad.insert(peb);
    }

    /// Number of successful erases of `peb` performed on this device
    #[must_use]
    pub fn erase_ops(&self, peb: Pebnr) -> u32 {
        self.erases
            .get(peb.index())
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Copy of the raw bytes of one physical block
    #[must_use]
    pub fn peb_bytes(&self, peb: Pebnr) -> Vec<u8> {
        let start = peb.index() * self.erase_size as usize;
        let data = self.data.read();
        data[start..start + self.erase_size as usize].to_vec()
    }

    /// Overwrite raw bytes, ignoring programming rules (corruption injection)
    pub fn poke(&self, offset: u64, bytes: &[u8]) {
        let start = offset as usize;
        let mut data = self.data.write();
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl FlashDevice for MemFlash {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn erase_size(&self) -> u32 {
        self.erase_size
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn peb_count(&self) -> u32 {
        self.peb_count
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        check_range(self.erase_size, self.peb_count, offset, buf.len())?;
        let start = offset as usize;
        let data = self.data.read();
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(buf.len())
    }

    fn write(&self, offset: u64, src: &[u8]) -> Result<usize> {
        let peb = check_range(self.erase_size, self.peb_count, offset, src.len())?;
        {
            let mut faults = self.faults.lock();
            if faults.bad.contains(&peb) {
                return Err(Error::BadBlock { peb });
            }
            if Faults::take(&mut faults.failing_writes, peb) {
                return Err(Error::device(format!("program failure on {peb}")));
            }
        }
        let start = offset as usize;
        let mut data = self.data.write();
        for (dst, byte) in data[start..start + src.len()].iter_mut().zip(src) {
            *dst &= *byte;
        }
        Ok(src.len())
    }

    fn erase(&self, peb: Pebnr) -> Result<()> {
        if peb.get() >= self.peb_count {
            return Err(Error::invalid_argument(format!("{peb} is beyond the device")));
        }
        {
            let mut faults = self.faults.lock();
            if faults.bad.contains(&peb) {
                return Err(Error::BadBlock { peb });
            }
            if Faults::take(&mut faults.failing_erases, peb) {
                return Err(Error::EraseFailed { peb });
            }
        }
        let start = peb.index() * self.erase_size as usize;
        let mut data = self.data.write();
        data[start..start + self.erase_size as usize].fill(0xFF);
        self.erases[peb.index()].fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn block_is_bad(&self, peb: Pebnr) -> Result<bool> {
        Ok(self.faults.lock().bad.contains(&peb))
    }

    fn mark_bad(&self, peb: Pebnr) -> Result<()> {
        self.faults.lock().bad.insert(peb);
        Ok(())
    }
}
