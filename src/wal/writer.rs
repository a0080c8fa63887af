use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;

use super::FileSegment;

/// Scoped over one open output file. Appends length-prefixed payloads
/// and returns a [`FileSegment`] for each accepted write. Single-writer
/// by contract: the [`super::WalManager`] enforces that only one
/// `WalWriter` is open at a time.
pub struct WalWriter {
    path: PathBuf,
    file: File,
    next_offset: u64,
    closed: bool,
}

impl WalWriter {
    /// Opens `path` for append, creating it if absent.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let next_offset = file.metadata()?.len();
        Ok(Self { path, file, next_offset, closed: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one length-prefixed payload and returns the segment that
    /// locates it. Exactly one `FileSegment` is produced per accepted
    /// write.
    pub fn write(&mut self, payload: &[u8]) -> Result<FileSegment> {
        let offset = self.next_offset;
        let len = payload.len() as u32;
        self.file.write_all(&len.to_be_bytes())?;
        self.file.write_all(payload)?;
        self.next_offset += 4 + payload.len() as u64;
        Ok(FileSegment::new(self.path.clone(), offset, payload.len() as u64))
    }

    /// Flushes and fsyncs. A failure here propagates to the caller and
    /// the writer is considered invalid afterwards.
    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        self.closed = true;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sync()
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.sync() {
                debug!(path = %self.path.display(), error = %e, "WAL writer drop sync failed");
            }
        }
    }
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("path", &self.path)
            .field("next_offset", &self.next_offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_returns_monotone_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log-0-1");
        let mut w = WalWriter::create(&path).unwrap();
        let s1 = w.write(b"hello").unwrap();
        let s2 = w.write(b"world!").unwrap();
        assert_eq!(s1.offset, 0);
        assert_eq!(s1.length, 5);
        assert_eq!(s2.offset, 4 + 5);
        assert_eq!(s2.length, 6);
        w.close().unwrap();
    }
}
