//! CHFS flash engine
//!
//! This crate implements the storage half of CHFS:
//! - Eraseblock handler: LEB to PEB mapping, wear leveling, background erase
//! - Write buffer coalescing records into flash pages
//! - Node log: per-block record references and the space ledger
//! - Space reservation with a separate deletion reserve
//! - Incremental garbage collector
//!
//! Flash access goes through [`FlashDevice`]; [`MemFlash`] simulates NOR
//! and NAND parts in memory and [`FileFlash`] keeps an image in a file.

pub mod adopt;
pub mod ebh;
pub mod file_flash;
pub mod flash;
pub mod fs;
mod gc;
pub mod layout;
pub mod ledger;
pub mod lock;
mod nodeops;
pub mod nodes;
mod objects;
pub mod record;
mod reserve;
pub mod vnode;
pub mod wbuf;

// Re-exports
pub use adopt::{ScannedNode, scan_leb};
pub use ebh::{Ebh, EbhStats, PoolSnapshot, TieBreak};
pub use file_flash::FileFlash;
pub use flash::{FlashDevice, MemFlash};
pub use fs::{Chfs, ChfsStats};
pub use ledger::{EbSizes, FsSizes};
pub use nodes::{BlockQueue, NodeRef, NrefId, NrefState};
pub use record::{DataNode, DirentNode, Node, NodeType, RecordScanner, ScanItem, VnodeInfo};
pub use vnode::VnodeState;
