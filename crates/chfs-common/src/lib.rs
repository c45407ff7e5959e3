//! CHFS Common - Shared types and utilities
//!
//! This crate provides the identifiers, error type, configuration and
//! checksum helpers used by the flash engine and its tools.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{crc32, crc32_parts, verify_crc32};
pub use config::{Config, LoggingConfig, ReserveThresholds};
pub use error::{Error, Result};
pub use types::*;
