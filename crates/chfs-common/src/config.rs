//! Configuration types for CHFS
//!
//! The defaults reproduce the tuning of the in-kernel filesystem. Block
//! reserve thresholds are derived from the device geometry unless they
//! are overridden explicitly.

use crate::error::{Error, Result};
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for a CHFS mount
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Flash geometry (used when creating images and simulators)
    pub flash: FlashConfig,
    /// Eraseblock handler tuning
    pub ebh: EbhConfig,
    /// Write path tuning
    pub wbuf: WbufConfig,
    /// Garbage collector tuning
    pub gc: GcConfig,
    /// Space reservation thresholds
    pub reserve: ReserveConfig,
    /// Log filter for binaries embedding the engine
    pub logging: LoggingConfig,
}

impl Config {
    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        self.flash.validate()?;
        self.gc.validate()?;
        if self.wbuf.max_data_node_size == 0 {
            return Err(Error::Configuration(
                "wbuf.max_data_node_size must be non-zero".into(),
            ));
        }
        if self.ebh.erase_interval_ms == 0 || self.gc.interval_ms == 0 {
            return Err(Error::Configuration(
                "worker intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Flash geometry
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    /// NOR or NAND
    pub kind: MediaKind,
    /// Physical eraseblock size in bytes
    pub erase_size: u32,
    /// Program page size in bytes (NOR typically uses a small page)
    pub page_size: u32,
    /// Number of physical eraseblocks
    pub peb_count: u32,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            kind: MediaKind::Nor,
            erase_size: 64 * 1024,
            page_size: 256,
            peb_count: 64,
        }
    }
}

impl FlashConfig {
    /// Total device size in bytes
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.erase_size as u64 * self.peb_count as u64
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(Error::Configuration(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if self.erase_size == 0 || self.erase_size % self.page_size != 0 {
            return Err(Error::Configuration(format!(
                "erase size {} is not a multiple of page size {}",
                self.erase_size, self.page_size
            )));
        }
        if self.erase_size / self.page_size < 4 {
            return Err(Error::Configuration(
                "an eraseblock must hold at least four pages".into(),
            ));
        }
        if self.peb_count < 4 {
            return Err(Error::Configuration(format!(
                "at least 4 eraseblocks are required, got {}",
                self.peb_count
            )));
        }
        Ok(())
    }
}

/// Eraseblock handler tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EbhConfig {
    /// Erase worker self-wake period in milliseconds
    pub erase_interval_ms: u64,
    /// Retries with a fresh PEB after a failed header or data write
    pub max_peb_retries: u32,
    /// Run the background erase worker (tests drive erasure by hand)
    pub background_erase: bool,
}

impl Default for EbhConfig {
    fn default() -> Self {
        Self {
            erase_interval_ms: 100,
            max_peb_retries: 2,
            background_erase: true,
        }
    }
}

impl EbhConfig {
    #[must_use]
    pub const fn erase_interval(&self) -> Duration {
        Duration::from_millis(self.erase_interval_ms)
    }
}

/// Write path tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WbufConfig {
    /// Largest payload carried by a single data node
    pub max_data_node_size: u32,
}

impl Default for WbufConfig {
    fn default() -> Self {
        Self {
            max_data_node_size: 4096,
        }
    }
}

/// Cumulative weights for GC victim selection, out of `total`
///
/// A random draw below `erase_pending` picks an erase-pending block,
/// below `very_dirty` a very dirty block, below `dirty` a dirty block,
/// anything else a clean block. Empty queues fall through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VictimWeights {
    pub erase_pending: u32,
    pub very_dirty: u32,
    pub dirty: u32,
    pub total: u32,
}

impl Default for VictimWeights {
    fn default() -> Self {
        Self {
            erase_pending: 50,
            very_dirty: 110,
            dirty: 126,
            total: 128,
        }
    }
}

/// Garbage collector tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Run the background GC thread
    pub background: bool,
    /// GC thread self-wake period in milliseconds
    pub interval_ms: u64,
    /// Victim selection weights
    pub weights: VictimWeights,
    /// A block with fewer dirty bytes than this is clean
    pub clean_threshold: u32,
    /// Upper bound on GC passes a single reservation may drive
    pub max_passes_per_reservation: u32,
    /// Seed for victim selection; random when unset
    pub victim_seed: Option<u64>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            background: true,
            interval_ms: 1000,
            weights: VictimWeights::default(),
            clean_threshold: 255,
            max_passes_per_reservation: 1024,
            victim_seed: None,
        }
    }
}

impl GcConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        if !(w.erase_pending <= w.very_dirty && w.very_dirty <= w.dirty && w.dirty <= w.total)
            || w.total == 0
        {
            return Err(Error::Configuration(format!(
                "victim weights must be cumulative and non-decreasing: {w:?}"
            )));
        }
        if self.max_passes_per_reservation == 0 {
            return Err(Error::Configuration(
                "gc.max_passes_per_reservation must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

/// Optional overrides for the reserve thresholds
///
/// Unset fields are derived from the geometry by
/// [`ReserveConfig::resolve`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReserveConfig {
    /// Free + erasable blocks a deletion must leave
    pub deletion_blocks: Option<u32>,
    /// Free + erasable blocks an ordinary write must leave
    pub write_blocks: Option<u32>,
    /// Below this many free + erasable blocks the GC thread wakes
    pub gc_trigger_blocks: Option<u32>,
    /// Blocks the GC keeps for merging
    pub gc_merge_blocks: Option<u32>,
    /// Reclaimable dirty bytes below which reservation gives up
    pub nospc_dirty: Option<u32>,
    /// Very dirty block count above which the GC thread wakes
    pub very_dirty_trigger: Option<u32>,
}

/// Reserve thresholds in effect for a mount
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReserveThresholds {
    pub deletion_blocks: u32,
    pub write_blocks: u32,
    pub gc_trigger_blocks: u32,
    pub gc_merge_blocks: u32,
    pub nospc_dirty: u32,
    pub very_dirty_trigger: u32,
}

impl ReserveConfig {
    /// Fill in unset thresholds from the eraseblock size and LEB count
    #[must_use]
    pub fn resolve(&self, eb_size: u32, leb_count: u32) -> ReserveThresholds {
        let deletion_blocks = self.deletion_blocks.unwrap_or(2);
        let write_blocks = self
            .write_blocks
            .unwrap_or(deletion_blocks + leb_count / 100);
        let gc_trigger_blocks = self.gc_trigger_blocks.unwrap_or(write_blocks + 1);
        let gc_merge_blocks = self.gc_merge_blocks.unwrap_or(deletion_blocks + 1);
        let flash_size = u64::from(eb_size) * u64::from(leb_count);
        let nospc_dirty = self.nospc_dirty.unwrap_or_else(|| {
            u32::try_from(u64::from(eb_size) + flash_size / 100).unwrap_or(u32::MAX)
        });
        let very_dirty_trigger = self
            .very_dirty_trigger
            .unwrap_or(gc_trigger_blocks * 10);

        ReserveThresholds {
            deletion_blocks,
            write_blocks,
            gc_trigger_blocks,
            gc_merge_blocks,
            nospc_dirty,
            very_dirty_trigger,
        }
    }
}
