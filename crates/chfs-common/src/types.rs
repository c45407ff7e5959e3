//! Core identifiers for CHFS
//!
//! Logical and physical eraseblock numbers, vnode numbers and the
//! flash media kind. All of them are small `Copy` newtypes so that an
//! LEB number can never be passed where a PEB number is expected.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical eraseblock number
///
/// Stable identifier used by everything above the eraseblock handler.
/// A LEB keeps its number across remaps to different physical blocks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct Lnr(u32);

impl Lnr {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Index into per-LEB tables
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Lnr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lnr({})", self.0)
    }
}

impl fmt::Display for Lnr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "leb{}", self.0)
    }
}

/// Physical eraseblock number
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct Pebnr(u32);

impl Pebnr {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Pebnr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pebnr({})", self.0)
    }
}

impl fmt::Display for Pebnr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peb{}", self.0)
    }
}

/// Vnode number
///
/// Zero is reserved: a directory entry naming vnode 0 is a deletion
/// tombstone.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct Vno(u64);

impl Vno {
    /// The "no vnode" marker carried by deletion dirents
    pub const NONE: Self = Self(0);

    /// Root directory
    pub const ROOT: Self = Self(1);

    #[must_use]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for Vno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vno({})", self.0)
    }
}

impl fmt::Display for Vno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flash media kind
///
/// Decides the eraseblock header layout and how duplicate LEB claims are
/// resolved when the media is scanned.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Byte-programmable NOR flash
    #[default]
    Nor,
    /// Page-programmable NAND flash
    Nand,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nor => write!(f, "nor"),
            Self::Nand => write!(f, "nand"),
        }
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nor" => Ok(Self::Nor),
            "nand" => Ok(Self::Nand),
            other => Err(format!("unknown media kind: {other}")),
        }
    }
}

/// Priority of a space reservation
///
/// Deletions only need to stay above a smaller block reserve than
/// ordinary writes, so that a full filesystem can still be emptied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocPriority {
    #[default]
    Normal,
    Deletion,
}
