//! Physical eraseblock pool
//!
//! Every good PEB is in exactly one of four places: the free set, the
//! in-use map, the to-erase queue or the fully-erased queue. The free set
//! is ordered by `(erase_cnt, pebnr)` so allocation always hands out the
//! least worn block.

use chfs_common::Pebnr;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A physical eraseblock and its erase counter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Peb {
    pub pebnr: Pebnr,
    pub erase_cnt: u32,
}

impl Peb {
    #[must_use]
    pub const fn new(pebnr: Pebnr, erase_cnt: u32) -> Self {
        Self { pebnr, erase_cnt }
    }
}

/// Next unit of work for the erase worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EraseWork {
    /// Already erased, only the EC header is missing
    WriteHeader(Peb),
    /// Needs a physical erase first
    Erase(Peb),
}

#[derive(Debug, Default)]
pub(crate) struct PebPool {
    free: BTreeSet<(u32, Pebnr)>,
    in_use: BTreeMap<Pebnr, u32>,
    to_erase: VecDeque<Peb>,
    fully_erased: VecDeque<Peb>,
}

impl PebPool {
    pub(crate) fn add_free(&mut self, peb: Peb) {
        self.free.insert((peb.erase_cnt, peb.pebnr));
    }

    pub(crate) fn add_in_use(&mut self, peb: Peb) {
        self.in_use.insert(peb.pebnr, peb.erase_cnt);
    }

    pub(crate) fn add_to_erase(&mut self, peb: Peb) {
        self.to_erase.push_back(peb);
    }

    pub(crate) fn add_fully_erased(&mut self, peb: Peb) {
        self.fully_erased.push_back(peb);
    }

    /// Take the least worn free PEB and account it as in use
    pub(crate) fn take_free(&mut self) -> Option<Peb> {
        let (erase_cnt, pebnr) = self.free.pop_first()?;
        self.in_use.insert(pebnr, erase_cnt);
        Some(Peb { pebnr, erase_cnt })
    }

    /// Move an in-use PEB to the to-erase queue
    pub(crate) fn release(&mut self, pebnr: Pebnr) -> Option<Peb> {
        let erase_cnt = self.in_use.remove(&pebnr)?;
        let peb = Peb { pebnr, erase_cnt };
        self.to_erase.push_back(peb);
        Some(peb)
    }

    /// Pop the next erase job; header-only work first
    pub(crate) fn pop_work(&mut self) -> Option<EraseWork> {
        if let Some(peb) = self.fully_erased.pop_front() {
            return Some(EraseWork::WriteHeader(peb));
        }
        self.to_erase.pop_front().map(EraseWork::Erase)
    }

    pub(crate) fn has_work(&self) -> bool {
        !self.fully_erased.is_empty() || !self.to_erase.is_empty()
    }

    pub(crate) fn erase_cnt(&self, pebnr: Pebnr) -> Option<u32> {
        if let Some(&ec) = self.in_use.get(&pebnr) {
            return Some(ec);
        }
        self.free
            .iter()
            .find(|(_, p)| *p == pebnr)
            .map(|(ec, _)| *ec)
            .or_else(|| {
                self.to_erase
                    .iter()
                    .chain(self.fully_erased.iter())
                    .find(|p| p.pebnr == pebnr)
                    .map(|p| p.erase_cnt)
            })
    }

    pub(crate) fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            free: self
                .free
                .iter()
                .map(|&(erase_cnt, pebnr)| Peb { pebnr, erase_cnt })
                .collect(),
            in_use: self
                .in_use
                .iter()
                .map(|(&pebnr, &erase_cnt)| Peb { pebnr, erase_cnt })
                .collect(),
            to_erase: self.to_erase.iter().copied().collect(),
            fully_erased: self.fully_erased.iter().copied().collect(),
        }
    }
}

/// Point-in-time copy of the PEB pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Free PEBs, least worn first
    pub free: Vec<Peb>,
    pub in_use: Vec<Peb>,
    pub to_erase: Vec<Peb>,
    pub fully_erased: Vec<Peb>,
}

impl PoolSnapshot {
    /// Total good PEBs accounted for
    #[must_use]
    pub fn total(&self) -> usize {
        self.free.len() + self.in_use.len() + self.to_erase.len() + self.fully_erased.len()
    }

    /// Highest minus lowest erase count over all good PEBs
    #[must_use]
    pub fn erase_spread(&self) -> u32 {
        let counts = self
            .free
            .iter()
            .chain(&self.in_use)
            .chain(&self.to_erase)
            .chain(&self.fully_erased)
            .map(|p| p.erase_cnt);
        let (min, max) = counts.fold((u32::MAX, 0), |(lo, hi), ec| (lo.min(ec), hi.max(ec)));
        max.saturating_sub(min)
    }
}
