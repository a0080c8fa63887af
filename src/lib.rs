// Streaming execution core: offsets, write-ahead log, block-backed
// datasets, session/state store, receiver tracker, progress tracker,
// and the streaming execution loop.

pub mod block;
pub mod error;
pub mod io;
pub mod offset;
pub mod progress;
pub mod receiver;
pub mod state;
pub mod streaming;
pub mod wal;

pub use error::{CoreError, Result};

use std::path::PathBuf;
use std::time::Duration;

/// Crate-wide configuration for the streaming execution core.
#[derive(Debug, Clone)]
pub struct Config {
    /// Enables receiver-block WAL and state checkpointing when set; if
    /// absent, both are in-memory only.
    pub checkpoint_dir: Option<PathBuf>,
    /// Wall-clock cadence target for the streaming execution loop.
    pub batch_interval: Duration,
    /// Floor between batches.
    pub min_batch_gap: Duration,
    /// Gates durable receiver block-metadata logging.
    pub receiver_wal_enabled: bool,
    /// Bound on retained batch-info entries kept for inspection.
    pub ui_max_batches: usize,
}

impl Config {
    /// Builds a config rooted at `checkpoint_dir`, enabling the
    /// receiver WAL by default: if a checkpoint directory is present,
    /// durable logging is the useful default.
    pub fn with_checkpoint_dir(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self { checkpoint_dir: Some(checkpoint_dir.into()), receiver_wal_enabled: true, ..Self::default() }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            checkpoint_dir: None,
            batch_interval: Duration::from_millis(1000),
            min_batch_gap: Duration::from_millis(10),
            receiver_wal_enabled: false,
            ui_max_batches: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_in_memory_only() {
        let config = Config::default();
        assert!(config.checkpoint_dir.is_none());
        assert!(!config.receiver_wal_enabled);
    }

    #[test]
    fn checkpoint_dir_config_enables_the_receiver_wal() {
        let config = Config::with_checkpoint_dir("/tmp/checkpoints");
        assert!(config.receiver_wal_enabled);
    }
}
