//! Space ledger
//!
//! Every byte of every LEB is in exactly one bucket: free, used, dirty,
//! unchecked or wasted. The per-block buckets always add up to the
//! eraseblock size, and the filesystem totals are the sums of the
//! per-block buckets. Each transfer moves bytes between two buckets of one
//! block and its totals in one step, then re-checks the block.

use chfs_common::Lnr;
use std::fmt;

/// Space bucket
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Space {
    Free,
    Used,
    Dirty,
    Unchecked,
    Wasted,
}

/// Byte accounting for one LEB
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EbSizes {
    pub free: u32,
    pub used: u32,
    pub dirty: u32,
    pub unchecked: u32,
    pub wasted: u32,
}

impl EbSizes {
    const fn fresh(eb_size: u32) -> Self {
        Self {
            free: eb_size,
            used: 0,
            dirty: 0,
            unchecked: 0,
            wasted: 0,
        }
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.free as u64
            + self.used as u64
            + self.dirty as u64
            + self.unchecked as u64
            + self.wasted as u64
    }

    /// Nothing live left: the block may be erased
    #[must_use]
    pub const fn is_reclaimable(&self) -> bool {
        self.used == 0 && self.unchecked == 0
    }

    fn bucket(&mut self, space: Space) -> &mut u32 {
        match space {
            Space::Free => &mut self.free,
            Space::Used => &mut self.used,
            Space::Dirty => &mut self.dirty,
            Space::Unchecked => &mut self.unchecked,
            Space::Wasted => &mut self.wasted,
        }
    }
}

/// Filesystem-wide byte totals
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FsSizes {
    pub free: u64,
    pub used: u64,
    pub dirty: u64,
    pub unchecked: u64,
    pub wasted: u64,
}

impl FsSizes {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.free + self.used + self.dirty + self.unchecked + self.wasted
    }

    fn bucket(&mut self, space: Space) -> &mut u64 {
        match space {
            Space::Free => &mut self.free,
            Space::Used => &mut self.used,
            Space::Dirty => &mut self.dirty,
            Space::Unchecked => &mut self.unchecked,
            Space::Wasted => &mut self.wasted,
        }
    }
}

impl fmt::Display for FsSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free={} used={} dirty={} unchecked={} wasted={}",
            self.free, self.used, self.dirty, self.unchecked, self.wasted
        )
    }
}

/// Per-LEB and filesystem-wide byte accounting
pub struct Ledger {
    eb_size: u32,
    blocks: Vec<EbSizes>,
    totals: FsSizes,
}

impl Ledger {
    /// All blocks start out entirely free
    #[must_use]
    pub fn new(eb_size: u32, leb_count: u32) -> Self {
        let totals = FsSizes {
            free: u64::from(eb_size) * u64::from(leb_count),
            ..FsSizes::default()
        };
        Self {
            eb_size,
            blocks: vec![EbSizes::fresh(eb_size); leb_count as usize],
            totals,
        }
    }

    #[must_use]
    pub const fn eb_size(&self) -> u32 {
        self.eb_size
    }

    #[must_use]
    pub fn block(&self, lnr: Lnr) -> EbSizes {
        self.blocks[lnr.index()]
    }

    #[must_use]
    pub const fn totals(&self) -> FsSizes {
        self.totals
    }

    /// Offset of the first unwritten byte of a block
    #[must_use]
    pub fn write_offset(&self, lnr: Lnr) -> u32 {
        self.eb_size - self.blocks[lnr.index()].free
    }

    /// Move `len` bytes of `lnr` from one bucket to another
    ///
    /// # Panics
    ///
    /// Panics if the source bucket holds fewer than `len` bytes; that is
    /// an accounting bug and continuing would corrupt the ledger.
    pub fn transfer(&mut self, lnr: Lnr, from: Space, to: Space, len: u32) {
        if len == 0 || from == to {
            return;
        }
        let eb = &mut self.blocks[lnr.index()];
        let src = eb.bucket(from);
        assert!(
            *src >= len,
            "{lnr}: moving {len} bytes {from:?} -> {to:?} but only {} available",
            *src
        );
        *src -= len;
        *eb.bucket(to) += len;
        *self.totals.bucket(from) -= u64::from(len);
        *self.totals.bucket(to) += u64::from(len);
        self.check(lnr);
    }

    /// Everything of `lnr` back to free, after the block has been recycled
    pub fn reset(&mut self, lnr: Lnr) {
        let old = self.blocks[lnr.index()];
        self.totals.free += u64::from(old.used + old.dirty + old.unchecked + old.wasted);
        self.totals.used -= u64::from(old.used);
        self.totals.dirty -= u64::from(old.dirty);
        self.totals.unchecked -= u64::from(old.unchecked);
        self.totals.wasted -= u64::from(old.wasted);
        self.blocks[lnr.index()] = EbSizes::fresh(self.eb_size);
    }

    /// # Panics
    ///
    /// Panics if the buckets of `lnr` do not add up to the block size.
    pub fn check(&self, lnr: Lnr) {
        let eb = self.blocks[lnr.index()];
        assert_eq!(
            eb.total(),
            u64::from(self.eb_size),
            "{lnr}: space accounting broken: {eb:?}"
        );
    }

    /// Verify every block and that the totals are the per-block sums
    ///
    /// # Panics
    ///
    /// Panics on any mismatch.
    pub fn check_all(&self) {
        let mut sum = FsSizes::default();
        for (i, eb) in self.blocks.iter().enumerate() {
            assert_eq!(
                eb.total(),
                u64::from(self.eb_size),
                "leb{i}: space accounting broken: {eb:?}"
            );
            sum.free += u64::from(eb.free);
            sum.used += u64::from(eb.used);
            sum.dirty += u64::from(eb.dirty);
            sum.unchecked += u64::from(eb.unchecked);
            sum.wasted += u64::from(eb.wasted);
        }
        assert_eq!(sum, self.totals, "filesystem totals drifted from blocks");
    }
}
