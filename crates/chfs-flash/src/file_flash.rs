//! File-backed flash image
//!
//! Lets the tools run the engine against a persistent image without real
//! flash hardware. The image is a plain file of `erase_size * peb_count`
//! bytes; erasing fills a block with `0xFF` and programming ANDs the new
//! bytes into the old ones, so an image behaves like the real media.

use crate::flash::{FlashDevice, check_range};
use chfs_common::config::FlashConfig;
use chfs_common::{Error, MediaKind, Pebnr, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, warn};

/// Chunk used when filling a fresh image with erased bytes
const FILL_CHUNK: usize = 64 * 1024;

/// Flash image stored in a regular file
pub struct FileFlash {
    file: File,
    path: String,
    kind: MediaKind,
    erase_size: u32,
    page_size: u32,
    peb_count: u32,
    read_only: bool,
    /// Bad marks set during this session; images carry no OOB area
    bad: Mutex<BTreeSet<Pebnr>>,
    /// Serializes read-modify-write programming
    program_lock: Mutex<()>,
}

impl FileFlash {
    /// Create a new, fully erased image with the given geometry
    pub fn create(path: impl AsRef<Path>, geometry: &FlashConfig) -> Result<Self> {
        geometry.validate()?;
        let path_str = path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::device(format!("failed to create {path_str}: {e}")))?;

        let size = geometry.size();
        file.set_len(size)
            .map_err(|e| Error::device(format!("failed to set size for {path_str}: {e}")))?;

        let erased = vec![0xFFu8; FILL_CHUNK];
        let mut offset = 0u64;
        while offset < size {
            let n = (size - offset).min(FILL_CHUNK as u64) as usize;
            file.write_all_at(&erased[..n], offset)?;
            offset += n as u64;
        }
        file.sync_all()?;
        debug!(path = %path_str, size, "created flash image");

        Ok(Self::with_file(file, path_str, geometry, false))
    }

    /// Open an existing image, checking its size against the geometry
    pub fn open(path: impl AsRef<Path>, geometry: &FlashConfig, read_only: bool) -> Result<Self> {
        geometry.validate()?;
        let path_str = path.as_ref().to_string_lossy().to_string();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .map_err(|e| Error::device(format!("failed to open {path_str}: {e}")))?;

        let len = file
            .metadata()
            .map_err(|e| Error::device(format!("failed to get metadata for {path_str}: {e}")))?
            .len();
        if len != geometry.size() {
            return Err(Error::Configuration(format!(
                "{path_str} is {len} bytes but the geometry describes {} bytes",
                geometry.size()
            )));
        }

        Ok(Self::with_file(file, path_str, geometry, read_only))
    }

    fn with_file(file: File, path: String, geometry: &FlashConfig, read_only: bool) -> Self {
        Self {
            file,
            path,
            kind: geometry.kind,
            erase_size: geometry.erase_size,
            page_size: geometry.page_size,
            peb_count: geometry.peb_count,
            read_only,
            bad: Mutex::new(BTreeSet::new()),
            program_lock: Mutex::new(()),
        }
    }

    /// Get the image path
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Flush the image to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::device(format!("sync failed on {}: {e}", self.path)))
    }

    fn check_writable(&self, peb: Pebnr) -> Result<()> {
        if self.read_only {
            return Err(Error::device(format!("{} is read-only", self.path)));
        }
        if self.bad.lock().contains(&peb) {
            return Err(Error::BadBlock { peb });
        }
        Ok(())
    }
}

impl FlashDevice for FileFlash {
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
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::device(format!("read failed on {}: {e}", self.path)))?;
        Ok(buf.len())
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let peb = check_range(self.erase_size, self.peb_count, offset, data.len())?;
        self.check_writable(peb)?;

        let _guard = self.program_lock.lock();
        let mut cells = vec![0u8; data.len()];
        self.file
            .read_exact_at(&mut cells, offset)
            .map_err(|e| Error::device(format!("read failed on {}: {e}", self.path)))?;
        for (cell, byte) in cells.iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.file
            .write_all_at(&cells, offset)
            .map_err(|e| Error::device(format!("write failed on {}: {e}", self.path)))?;
        Ok(data.len())
    }

    fn erase(&self, peb: Pebnr) -> Result<()> {
        if peb.get() >= self.peb_count {
            return Err(Error::invalid_argument(format!("{peb} is beyond the device")));
        }
        self.check_writable(peb)?;

        let _guard = self.program_lock.lock();
        let erased = vec![0xFFu8; self.erase_size as usize];
        let offset = u64::from(peb.get()) * u64::from(self.erase_size);
        self.file
            .write_all_at(&erased, offset)
            .map_err(|_| Error::EraseFailed { peb })
    }

    fn block_is_bad(&self, peb: Pebnr) -> Result<bool> {
        Ok(self.bad.lock().contains(&peb))
    }

    fn mark_bad(&self, peb: Pebnr) -> Result<()> {
        warn!(path = %self.path, %peb, "marking block bad for this session");
        self.bad.lock().insert(peb);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn geometry() -> FlashConfig {
        FlashConfig {
            kind: MediaKind::Nand,
            erase_size: 16 * 1024,
            page_size: 512,
            peb_count: 8,
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");

        {
            let flash = FileFlash::create(&path, &geometry()).unwrap();
            assert_eq!(flash.size(), 16 * 1024 * 8);
            flash.write(100, b"chfs").unwrap();
            flash.sync().unwrap();
        }

        let flash = FileFlash::open(&path, &geometry(), true).unwrap();
        let mut buf = [0u8; 6];
        flash.read(99, &mut buf).unwrap();
        assert_eq!(&buf, b"\xFFchfs\xFF");
        assert!(flash.write(0, b"x").is_err());
    }

    #[test]
    fn test_geometry_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("flash.img");
        FileFlash::create(&path, &geometry()).unwrap();

        let mut other = geometry();
        other.peb_count = 16;
        assert!(matches!(
            FileFlash::open(&path, &other, false),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_erase_and_program_rules() {
        let dir = tempdir().unwrap();
        let flash = FileFlash::create(dir.path().join("f.img"), &geometry()).unwrap();
        let peb_start = 16 * 1024;

        flash.write(peb_start, &[0b1010_1010]).unwrap();
        flash.write(peb_start, &[0b1111_0000]).unwrap();
        let mut b = [0u8; 1];
        flash.read(peb_start, &mut b).unwrap();
        assert_eq!(b[0], 0b1010_0000);

        flash.erase(Pebnr::new(1)).unwrap();
        flash.read(peb_start, &mut b).unwrap();
        assert_eq!(b[0], 0xFF);

        flash.mark_bad(Pebnr::new(1)).unwrap();
        assert!(flash.erase(Pebnr::new(1)).is_err());
    }
}
