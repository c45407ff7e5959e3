//! Eraseblock header layout
//!
//! Every physical eraseblock starts with an erase-counter header followed
//! by a media specific header naming the LEB it holds:
//!
//! ```text
//! NOR                                   NAND
//! +-------------------+ 0               +-------------------+ page 0
//! | magic  crc  ec    | 12B             | magic  crc  ec    | 12B
//! +-------------------+ 12              +-------------------+ page 1
//! | crc  lid          | 8B              | crc  lid  serial  | 16B
//! +-------------------+ 20              +-------------------+ page 2
//! | data ...          |                 | data ...          |
//! ```
//!
//! NOR uses bit 31 of `lid` as a "not dirty" flag which can be cleared in
//! place when a LEB is being moved, and zeroes `crc`/`lid` to invalidate
//! the old copy afterwards. NAND cannot rewrite in place, so every header
//! carries a serial number and the newest serial wins.
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, BytesMut};
use chfs_common::{Lnr, MediaKind, Pebnr, crc32};

/// Magic of the erase-counter header
pub const EC_MAGIC: u32 = 0x5345_4452;

/// Erase-counter header size
pub const EC_HDR_SIZE: usize = 12;

/// NOR LEB header size
pub const NOR_HDR_SIZE: usize = 8;

/// NAND LEB header size
pub const NAND_HDR_SIZE: usize = 16;

/// Set while a NOR header is current
pub const LID_NOT_DIRTY_BIT: u32 = 0x8000_0000;

/// Mask extracting the LEB number from a NOR `lid`
pub const LID_DIRTY_BIT_MASK: u32 = 0x7fff_ffff;

/// Bytes zeroed to invalidate a NOR header
pub const NOR_INVALIDATE_SIZE: usize = NOR_HDR_SIZE;

/// Geometry of one flash device as seen by the eraseblock handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub kind: MediaKind,
    pub erase_size: u32,
    pub page_size: u32,
}

impl Geometry {
    #[must_use]
    pub const fn new(kind: MediaKind, erase_size: u32, page_size: u32) -> Self {
        Self {
            kind,
            erase_size,
            page_size,
        }
    }

    /// Offset of the LEB header inside a PEB
    #[must_use]
    pub const fn leb_hdr_offset(&self) -> u32 {
        match self.kind {
            MediaKind::Nor => EC_HDR_SIZE as u32,
            MediaKind::Nand => self.page_size,
        }
    }

    /// Size of the LEB header
    #[must_use]
    pub const fn leb_hdr_size(&self) -> usize {
        match self.kind {
            MediaKind::Nor => NOR_HDR_SIZE,
            MediaKind::Nand => NAND_HDR_SIZE,
        }
    }

    /// Offset of LEB data inside a PEB
    #[must_use]
    pub const fn data_start(&self) -> u32 {
        match self.kind {
            MediaKind::Nor => (EC_HDR_SIZE + NOR_HDR_SIZE) as u32,
            MediaKind::Nand => 2 * self.page_size,
        }
    }

    /// Usable bytes per LEB
    #[must_use]
    pub const fn eb_size(&self) -> u32 {
        self.erase_size - self.data_start()
    }

    /// Absolute device offset of a PEB
    #[must_use]
    pub const fn peb_offset(&self, peb: Pebnr) -> u64 {
        peb.get() as u64 * self.erase_size as u64
    }

    /// Absolute device offset of a byte of LEB data held by `peb`
    #[must_use]
    pub const fn data_offset(&self, peb: Pebnr, offset: u32) -> u64 {
        self.peb_offset(peb) + self.data_start() as u64 + offset as u64
    }
}

/// Erase-counter header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EcHeader {
    pub erase_cnt: u32,
}

impl EcHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; EC_HDR_SIZE] {
        let ec = self.erase_cnt.to_le_bytes();
        let mut buf = BytesMut::with_capacity(EC_HDR_SIZE);
        buf.put_u32_le(EC_MAGIC);
        buf.put_u32_le(crc32(&ec));
        buf.put_slice(&ec);

        let mut out = [0u8; EC_HDR_SIZE];
        out.copy_from_slice(&buf);
        out
    }
}

/// LEB header, media specific
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LebHeader {
    /// `lid` carries the not-dirty flag in bit 31
    Nor { lid: u32 },
    Nand { lid: u32, serial: u64 },
}

impl LebHeader {
    /// Fresh NOR header for `lnr` (not-dirty bit set)
    #[must_use]
    pub const fn nor(lnr: Lnr) -> Self {
        Self::Nor {
            lid: lnr.get() | LID_NOT_DIRTY_BIT,
        }
    }

    #[must_use]
    pub const fn nand(lnr: Lnr, serial: u64) -> Self {
        Self::Nand {
            lid: lnr.get(),
            serial,
        }
    }

    /// LEB number with flag bits stripped
    #[must_use]
    pub const fn lnr(&self) -> Lnr {
        match *self {
            Self::Nor { lid } => Lnr::new(lid & LID_DIRTY_BIT_MASK),
            Self::Nand { lid, .. } => Lnr::new(lid),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match *self {
            Self::Nor { lid } => {
                let mut buf = BytesMut::with_capacity(NOR_HDR_SIZE);
                buf.put_u32_le(crc32(&(lid | LID_NOT_DIRTY_BIT).to_le_bytes()));
                buf.put_u32_le(lid);
                buf.to_vec()
            }
            Self::Nand { lid, serial } => {
                let mut body = BytesMut::with_capacity(12);
                body.put_u32_le(lid);
                body.put_u64_le(serial);
                let mut buf = BytesMut::with_capacity(NAND_HDR_SIZE);
                buf.put_u32_le(crc32(&body));
                buf.put_slice(&body);
                buf.to_vec()
            }
        }
    }
}

/// The 4-byte `lid` field of a NOR header with the not-dirty bit cleared
///
/// Written at `leb_hdr_offset + 4`; programming only clears bits, so the
/// rest of the header is untouched.
#[must_use]
pub const fn nor_dirty_lid(lnr: Lnr) -> [u8; 4] {
    (lnr.get() & LID_DIRTY_BIT_MASK).to_le_bytes()
}

/// Classification of a PEB found while scanning the media
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderStatus {
    /// Nothing written since the last erase
    NoHeader,
    /// Erase-counter header has the wrong magic
    BadMagic,
    /// Some header failed its CRC
    BadCrc,
    /// Valid erase counter, no LEB assigned
    Free,
    /// NOR header zeroed after a move
    Invalidated,
    /// NOR header whose not-dirty bit was cleared by an interrupted move
    Dirty,
    /// Valid LEB header
    Ok,
}

/// Result of reading both headers of one PEB
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScannedHeader {
    pub status: HeaderStatus,
    pub erase_cnt: u32,
    pub leb: Option<LebHeader>,
}

impl ScannedHeader {
    const fn bare(status: HeaderStatus) -> Self {
        Self {
            status,
            erase_cnt: 0,
            leb: None,
        }
    }
}

fn all_erased(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0xFF)
}

/// Classify a PEB from the raw bytes of its two headers
#[must_use]
pub fn check_headers(kind: MediaKind, ec_raw: &[u8], leb_raw: &[u8]) -> ScannedHeader {
    if ec_raw.len() < EC_HDR_SIZE {
        return ScannedHeader::bare(HeaderStatus::BadMagic);
    }
    if all_erased(&ec_raw[..EC_HDR_SIZE]) {
        return ScannedHeader::bare(HeaderStatus::NoHeader);
    }

    let mut ec = &ec_raw[..EC_HDR_SIZE];
    let magic = ec.get_u32_le();
    let crc = ec.get_u32_le();
    if magic != EC_MAGIC {
        return ScannedHeader::bare(HeaderStatus::BadMagic);
    }
    if crc32(&ec_raw[8..EC_HDR_SIZE]) != crc {
        return ScannedHeader::bare(HeaderStatus::BadCrc);
    }
    let erase_cnt = ec.get_u32_le();
    let with = |status, leb| ScannedHeader {
        status,
        erase_cnt,
        leb,
    };

    match kind {
        MediaKind::Nor => {
            if leb_raw.len() < NOR_HDR_SIZE {
                return with(HeaderStatus::BadCrc, None);
            }
            let mut h = &leb_raw[..NOR_HDR_SIZE];
            let crc = h.get_u32_le();
            let lid = h.get_u32_le();
            if crc == u32::MAX && lid == u32::MAX {
                return with(HeaderStatus::Free, None);
            }
            if crc == 0 && lid == 0 {
                return with(HeaderStatus::Invalidated, None);
            }
            if crc32(&(lid | LID_NOT_DIRTY_BIT).to_le_bytes()) != crc {
                return with(HeaderStatus::BadCrc, None);
            }
            let status = if lid & LID_NOT_DIRTY_BIT == 0 {
                HeaderStatus::Dirty
            } else {
                HeaderStatus::Ok
            };
            with(status, Some(LebHeader::Nor { lid }))
        }
        MediaKind::Nand => {
            if leb_raw.len() < NAND_HDR_SIZE {
                return with(HeaderStatus::BadCrc, None);
            }
            if all_erased(&leb_raw[..NAND_HDR_SIZE]) {
                return with(HeaderStatus::Free, None);
            }
            let mut h = &leb_raw[..NAND_HDR_SIZE];
            let crc = h.get_u32_le();
            if crc32(&leb_raw[4..NAND_HDR_SIZE]) != crc {
                return with(HeaderStatus::BadCrc, None);
            }
            let lid = h.get_u32_le();
            let serial = h.get_u64_le();
            with(HeaderStatus::Ok, Some(LebHeader::Nand { lid, serial }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_offsets() {
        let nor = Geometry::new(MediaKind::Nor, 65536, 1);
        assert_eq!(nor.data_start(), 20);
        assert_eq!(nor.eb_size(), 65516);
        assert_eq!(nor.data_offset(Pebnr::new(2), 4), 2 * 65536 + 24);

        let nand = Geometry::new(MediaKind::Nand, 128 * 1024, 2048);
        assert_eq!(nand.leb_hdr_offset(), 2048);
        assert_eq!(nand.data_start(), 4096);
        assert_eq!(nand.eb_size(), 128 * 1024 - 4096);
    }

    #[test]
    fn test_erased_block_has_no_header() {
        let s = check_headers(MediaKind::Nor, &[0xFF; 12], &[0xFF; 8]);
        assert_eq!(s.status, HeaderStatus::NoHeader);
    }

    #[test]
    fn test_free_and_ok_nor() {
        let ec = EcHeader { erase_cnt: 7 }.to_bytes();
        let s = check_headers(MediaKind::Nor, &ec, &[0xFF; 8]);
        assert_eq!(s.status, HeaderStatus::Free);
        assert_eq!(s.erase_cnt, 7);

        let leb = LebHeader::nor(Lnr::new(42)).to_bytes();
        let s = check_headers(MediaKind::Nor, &ec, &leb);
        assert_eq!(s.status, HeaderStatus::Ok);
        assert_eq!(s.leb.unwrap().lnr(), Lnr::new(42));
    }

    #[test]
    fn test_nor_dirty_and_invalidated() {
        let ec = EcHeader { erase_cnt: 1 }.to_bytes();
        let mut leb = LebHeader::nor(Lnr::new(3)).to_bytes();
        // program the dirty lid over the current one
        for (cell, b) in leb[4..8].iter_mut().zip(nor_dirty_lid(Lnr::new(3))) {
            *cell &= b;
        }
        let s = check_headers(MediaKind::Nor, &ec, &leb);
        assert_eq!(s.status, HeaderStatus::Dirty);
        assert_eq!(s.leb.unwrap().lnr(), Lnr::new(3));

        let s = check_headers(MediaKind::Nor, &ec, &[0u8; 8]);
        assert_eq!(s.status, HeaderStatus::Invalidated);
    }

    #[test]
    fn test_corruption_detected() {
        let mut ec = EcHeader { erase_cnt: 5 }.to_bytes();
        ec[0] ^= 0x01;
        let s = check_headers(MediaKind::Nand, &ec, &[0xFF; 16]);
        assert_eq!(s.status, HeaderStatus::BadMagic);

        let mut ec = EcHeader { erase_cnt: 5 }.to_bytes();
        ec[9] ^= 0x80;
        let s = check_headers(MediaKind::Nand, &ec, &[0xFF; 16]);
        assert_eq!(s.status, HeaderStatus::BadCrc);

        let ec = EcHeader { erase_cnt: 5 }.to_bytes();
        let mut leb = LebHeader::nand(Lnr::new(1), 99).to_bytes();
        leb[10] ^= 0x04;
        let s = check_headers(MediaKind::Nand, &ec, &leb);
        assert_eq!(s.status, HeaderStatus::BadCrc);
    }

    #[test]
    fn test_nand_serial_preserved() {
        let ec = EcHeader { erase_cnt: 0 }.to_bytes();
        let leb = LebHeader::nand(Lnr::new(8), 1234).to_bytes();
        let s = check_headers(MediaKind::Nand, &ec, &leb);
        assert_eq!(s.status, HeaderStatus::Ok);
        assert_eq!(
            s.leb,
            Some(LebHeader::Nand {
                lid: 8,
                serial: 1234
            })
        );
    }
}
