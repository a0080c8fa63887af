//! Write-Ahead Log (component B).
//!
//! Record framing on disk is `[u32 length][length bytes payload]`; no
//! magic, no checksum. Integrity comes from append-only filesystem
//! semantics. The module is split conceptually into entry framing and
//! manager lifecycle, with the reader, writer, and random-access
//! reader as separate types serving three distinct roles rather than
//! one do-everything manager.

mod manager;
mod reader;
mod writer;

pub use manager::WalManager;
pub use reader::{WalRandomReader, WalReader};
pub use writer::WalWriter;

use std::path::PathBuf;

/// Locates one record inside a WAL file. Valid only while the file at
/// `path` has not been truncated past `offset + length`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FileSegment {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

impl FileSegment {
    pub fn new(path: PathBuf, offset: u64, length: u64) -> Self {
        Self { path, offset, length }
    }
}
