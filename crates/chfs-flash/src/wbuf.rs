//! Page write buffer
//!
//! Records are appended to the open block through a one-page buffer so
//! that flash is only ever programmed a whole page at a time. Whole pages
//! in the middle of a large record go straight to the media. The last
//! page of a LEB may be shorter than a full page when the eraseblock size
//! is not a page multiple.

use chfs_common::{Error, Lnr, Result};
use tracing::{debug, warn};

use crate::ebh::Ebh;
use crate::record::padding_bytes;

/// Contents of a page that failed to reach flash
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingPage {
    pub lnr: Lnr,
    /// LEB offset of the first buffered byte
    pub offset: u32,
    pub bytes: Vec<u8>,
}

/// One-page write buffer in front of the open block
#[derive(Debug)]
pub struct WriteBuffer {
    page_size: u32,
    eb_size: u32,
    buf: Vec<u8>,
    lnr: Option<Lnr>,
    /// Page-aligned LEB offset the buffer starts at
    ofs: u32,
    len: u32,
}

impl WriteBuffer {
    #[must_use]
    pub fn new(page_size: u32, eb_size: u32) -> Self {
        Self {
            page_size,
            eb_size,
            buf: vec![0xFF; page_size as usize],
            lnr: None,
            ofs: 0,
            len: 0,
        }
    }

    /// LEB the buffered bytes belong to
    #[must_use]
    pub const fn lnr(&self) -> Option<Lnr> {
        if self.len == 0 { None } else { self.lnr }
    }

    #[must_use]
    pub const fn pending_len(&self) -> u32 {
        self.len
    }

    fn page_end(&self) -> u32 {
        (self.ofs + self.page_size).min(self.eb_size)
    }

    fn reset(&mut self) {
        self.buf.fill(0xFF);
        self.len = 0;
        self.lnr = None;
    }

    fn flush_page(&mut self, ebh: &Ebh) -> Result<()> {
        let Some(lnr) = self.lnr else {
            return Ok(());
        };
        let end = self.page_end();
        let n = (end - self.ofs) as usize;
        ebh.write_leb(lnr, self.ofs, &self.buf[..n])?;
        self.buf.fill(0xFF);
        self.ofs = end;
        self.len = 0;
        Ok(())
    }

    /// Append `data` at `offset` of `lnr`
    ///
    /// The offset must continue the buffered bytes, or be page aligned
    /// when the buffer is empty. Bytes still buffered for another LEB are
    /// flushed with padding first; that LEB and the pad length are
    /// returned so the caller can account the pad.
    ///
    /// On error the buffer keeps whatever could not be written; see
    /// [`WriteBuffer::take_pending`].
    pub fn write(&mut self, ebh: &Ebh, lnr: Lnr, offset: u32, data: &[u8]) -> Result<Option<(Lnr, u32)>> {
        let mut padded = None;
        if self.len > 0 && self.lnr != Some(lnr) {
            let old = self.lnr;
            let pad = self.flush(ebh)?;
            padded = old.map(|l| (l, pad));
        }

        if self.len == 0 {
            if offset % self.page_size != 0 && offset != self.eb_size {
                return Err(Error::invalid_argument(format!(
                    "buffered write to {lnr} at unaligned offset {offset}"
                )));
            }
            self.lnr = Some(lnr);
            self.ofs = offset;
        } else if offset != self.ofs + self.len {
            return Err(Error::invalid_argument(format!(
                "buffered write to {lnr} at {offset}, expected {}",
                self.ofs + self.len
            )));
        }
        if u64::from(offset) + data.len() as u64 > u64::from(self.eb_size) {
            return Err(Error::invalid_argument(format!(
                "write of {} bytes at {offset} overruns {lnr}",
                data.len()
            )));
        }

        let mut rest = data;
        while !rest.is_empty() {
            if self.len == 0 {
                let room = (self.eb_size - self.ofs) as usize;
                let whole = (rest.len().min(room) / self.page_size as usize) * self.page_size as usize;
                if whole > 0 {
                    ebh.write_leb(lnr, self.ofs, &rest[..whole])?;
                    self.ofs += whole as u32;
                    rest = &rest[whole..];
                    continue;
                }
            }
            let room = (self.page_end() - self.ofs - self.len) as usize;
            let n = room.min(rest.len());
            let at = self.len as usize;
            self.buf[at..at + n].copy_from_slice(&rest[..n]);
            self.len += n as u32;
            rest = &rest[n..];
            if self.ofs + self.len == self.page_end() {
                self.flush_page(ebh)?;
            }
        }
        Ok(padded)
    }

    /// Pad the buffered page and write it out
    ///
    /// Returns the number of pad bytes added; zero when nothing was
    /// buffered.
    pub fn flush(&mut self, ebh: &Ebh) -> Result<u32> {
        if self.len == 0 {
            return Ok(0);
        }
        let gap = self.page_end() - self.ofs - self.len;
        if gap > 0 {
            let at = self.len as usize;
            self.buf[at..at + gap as usize].copy_from_slice(&padding_bytes(gap as usize));
            self.len += gap;
        }
        match self.flush_page(ebh) {
            Ok(()) => {
                debug!(pad = gap, "flushed write buffer");
                self.lnr = None;
                Ok(gap)
            }
            Err(e) => {
                warn!(lnr = ?self.lnr, offset = self.ofs, error = %e, "write buffer flush failed");
                Err(e)
            }
        }
    }

    /// Hand over the bytes that never reached flash and empty the buffer
    pub fn take_pending(&mut self) -> Option<PendingPage> {
        let pending = match self.lnr {
            Some(lnr) if self.len > 0 => Some(PendingPage {
                lnr,
                offset: self.ofs,
                bytes: self.buf[..self.len as usize].to_vec(),
            }),
            _ => None,
        };
        self.reset();
        pending
    }

    /// Copy buffered bytes of `lnr` over a buffer read from flash
    pub fn overlay(&self, lnr: Lnr, offset: u32, buf: &mut [u8]) {
        if self.len == 0 || self.lnr != Some(lnr) {
            return;
        }
        let start = u64::from(offset).max(u64::from(self.ofs));
        let end = (u64::from(offset) + buf.len() as u64).min(u64::from(self.ofs + self.len));
        if start >= end {
            return;
        }
        let src = (start - u64::from(self.ofs)) as usize;
        let dst = (start - u64::from(offset)) as usize;
        let n = (end - start) as usize;
        buf[dst..dst + n].copy_from_slice(&self.buf[src..src + n]);
    }
}
