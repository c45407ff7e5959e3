//! Media scan at open time
//!
//! Reads both headers of every PEB, sorts the PEBs into the pool queues
//! and rebuilds the LEB map. When two PEBs claim the same LEB the media
//! specific [`TieBreak`] decides which one survives; the loser is queued
//! for erasure.

use crate::flash::FlashDevice;
use crate::layout::{EC_HDR_SIZE, Geometry, HeaderStatus, LebHeader, check_headers};
use chfs_common::{Lnr, MediaKind, Pebnr, Result};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// How duplicate LEB claims are resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieBreak {
    /// NOR: a claim whose not-dirty bit was cleared loses to a clean one;
    /// otherwise the later scanned claim wins
    DirtyFlag,
    /// NAND: the higher write serial wins
    Serial,
}

impl TieBreak {
    #[must_use]
    pub const fn for_media(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Nor => Self::DirtyFlag,
            MediaKind::Nand => Self::Serial,
        }
    }

    /// Should `new` replace `old` as the owner of their LEB?
    pub(crate) fn new_wins(self, old: &Claim, new: &Claim) -> bool {
        match self {
            Self::DirtyFlag => {
                !(new.status == HeaderStatus::Dirty && old.status == HeaderStatus::Ok)
            }
            Self::Serial => new.serial >= old.serial,
        }
    }
}

/// One PEB claiming a LEB
#[derive(Clone, Copy, Debug)]
pub(crate) struct Claim {
    pub pebnr: Pebnr,
    pub erase_cnt: u32,
    pub status: HeaderStatus,
    pub serial: u64,
}

/// Sorted result of a media scan
#[derive(Debug, Default)]
pub(crate) struct ScanResult {
    pub used: BTreeMap<Lnr, Claim>,
    pub free: Vec<(Pebnr, u32)>,
    /// Erased PEBs without an EC header
    pub erased: Vec<Pebnr>,
    /// Invalidated PEBs and tie-break losers
    pub to_erase: Vec<Pebnr>,
    /// PEBs whose headers failed validation
    pub corrupted: Vec<Pebnr>,
    pub bad: u32,
    pub max_serial: u64,
    sum_ec: u64,
    num_ec: u64,
}

impl ScanResult {
    /// Mean erase count of the PEBs that had a valid EC header
    pub(crate) fn avg_ec(&self) -> u32 {
        if self.num_ec == 0 {
            0
        } else {
            u32::try_from(self.sum_ec / self.num_ec).unwrap_or(u32::MAX)
        }
    }

    fn count_ec(&mut self, ec: u32) {
        self.sum_ec += u64::from(ec);
        self.num_ec += 1;
    }
}

pub(crate) fn scan_media(
    flash: &dyn FlashDevice,
    geo: &Geometry,
    leb_count: u32,
) -> Result<ScanResult> {
    let tie_break = TieBreak::for_media(geo.kind);
    let mut result = ScanResult::default();
    let mut ec_raw = [0u8; EC_HDR_SIZE];
    let mut leb_raw = vec![0u8; geo.leb_hdr_size()];

    for n in 0..flash.peb_count() {
        let pebnr = Pebnr::new(n);
        if geo.kind == MediaKind::Nand && flash.block_is_bad(pebnr)? {
            debug!(%pebnr, "skipping bad block");
            result.bad += 1;
            continue;
        }

        let base = geo.peb_offset(pebnr);
        flash.read(base, &mut ec_raw)?;
        flash.read(base + u64::from(geo.leb_hdr_offset()), &mut leb_raw)?;
        let hdr = check_headers(geo.kind, &ec_raw, &leb_raw);

        match hdr.status {
            HeaderStatus::NoHeader => result.erased.push(pebnr),
            HeaderStatus::BadMagic | HeaderStatus::BadCrc => {
                warn!(%pebnr, status = ?hdr.status, "corrupted eraseblock header");
                result.corrupted.push(pebnr);
            }
            HeaderStatus::Free => {
                result.count_ec(hdr.erase_cnt);
                result.free.push((pebnr, hdr.erase_cnt));
            }
            HeaderStatus::Invalidated => {
                result.count_ec(hdr.erase_cnt);
                result.to_erase.push(pebnr);
            }
            HeaderStatus::Dirty | HeaderStatus::Ok => {
                result.count_ec(hdr.erase_cnt);
                let Some(leb) = hdr.leb else {
                    result.corrupted.push(pebnr);
                    continue;
                };
                let lnr = leb.lnr();
                if lnr.get() >= leb_count {
                    warn!(%pebnr, %lnr, "header names a LEB beyond the device");
                    result.corrupted.push(pebnr);
                    continue;
                }
                let serial = match leb {
                    LebHeader::Nand { serial, .. } => serial,
                    LebHeader::Nor { .. } => 0,
                };
                result.max_serial = result.max_serial.max(serial);

                let claim = Claim {
                    pebnr,
                    erase_cnt: hdr.erase_cnt,
                    status: hdr.status,
                    serial,
                };
                match result.used.get(&lnr).copied() {
                    None => {
                        result.used.insert(lnr, claim);
                    }
                    Some(old) if tie_break.new_wins(&old, &claim) => {
                        debug!(%lnr, loser = %old.pebnr, winner = %pebnr, "duplicate LEB claim");
                        result.to_erase.push(old.pebnr);
                        result.used.insert(lnr, claim);
                    }
                    Some(old) => {
                        debug!(%lnr, loser = %pebnr, winner = %old.pebnr, "duplicate LEB claim");
                        result.to_erase.push(pebnr);
                    }
                }
            }
        }
    }

    Ok(result)
}
