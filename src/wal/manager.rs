use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;

use super::{FileSegment, WalReader, WalWriter};

struct ActiveFile {
    writer: WalWriter,
    end_nanos: u128,
    bytes_written: u64,
}

/// Owns one WAL directory. Files are named `log-<startNanos>-<endNanos>`
/// and are immutable once closed.
///
/// Write path: at most one active writer at a time; a new file is
/// opened when the active one crosses `max_file_size` or when the
/// current time passes the active file's planned end time. Read path:
/// enumerate files in ascending start-time order and concatenate their
/// record streams lazily. Cleanup deletes files whose end time is
/// older than a threshold and tolerates files that vanish concurrently.
pub struct WalManager {
    dir: PathBuf,
    max_file_size: u64,
    rollover_interval: Duration,
    active: Mutex<Option<ActiveFile>>,
}

impl WalManager {
    pub fn new(dir: impl Into<PathBuf>, max_file_size: u64, rollover_interval: Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_file_size, rollover_interval, active: Mutex::new(None) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends `payload`, rotating the active file first if needed.
    pub fn write(&self, payload: &[u8]) -> Result<FileSegment> {
        let mut active = self.active.lock();
        let now = now_nanos();

        let needs_rotation = match &*active {
            None => true,
            Some(a) => now >= a.end_nanos || a.bytes_written >= self.max_file_size,
        };

        if needs_rotation {
            if let Some(a) = active.take() {
                a.writer.close()?;
            }
            let end = now + self.rollover_interval.as_nanos();
            let path = self.dir.join(format!("log-{now}-{end}"));
            info!(path = %path.display(), "rolling over WAL file");
            let writer = WalWriter::create(&path)?;
            *active = Some(ActiveFile { writer, end_nanos: end, bytes_written: 0 });
        }

        let a = active.as_mut().expect("just ensured a writer is active");
        let segment = a.writer.write(payload)?;
        a.bytes_written += 4 + payload.len() as u64;
        Ok(segment)
    }

    /// Forces the active file's buffered bytes to disk without closing it.
    pub fn flush(&self) -> Result<()> {
        if let Some(a) = self.active.lock().as_mut() {
            a.writer.flush()?;
        }
        Ok(())
    }

    /// Files in the directory, sorted by ascending start time. Ignores
    /// entries whose name doesn't match the `log-<start>-<end>` shape.
    fn sorted_log_files(&self) -> Result<Vec<(u128, u128, PathBuf)>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if let Some((start, end)) = parse_log_name(name) {
                    files.push((start, end, path));
                }
            }
        }
        files.sort_by_key(|(start, _, _)| *start);
        Ok(files)
    }

    /// Lazily concatenates every file's record stream in order. A file
    /// that disappears between listing and opening (concurrent
    /// cleanup) is skipped rather than treated as an error.
    pub fn read_from_log(&self) -> Result<impl Iterator<Item = Result<Vec<u8>>>> {
        let files = self.sorted_log_files()?;
        Ok(files.into_iter().filter_map(|(_, _, path)| match WalReader::open(&path) {
            Ok(reader) => Some(Box::new(reader) as Box<dyn Iterator<Item = Result<Vec<u8>>>>),
            Err(crate::error::CoreError::Io(e)) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => Some(Box::new(std::iter::once(Err(e))) as Box<dyn Iterator<Item = Result<Vec<u8>>>>),
        }).flatten())
    }

    /// Deletes any file whose end time is older than `threshold_nanos`.
    /// Idempotent: a file already removed by a concurrent call is not
    /// an error.
    pub fn clear_old_logs(&self, threshold_nanos: u128) -> Result<()> {
        for (_, end, path) in self.sorted_log_files()? {
            if end < threshold_nanos {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!(path = %path.display(), "cleared old WAL file"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}

fn now_nanos() -> u128 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_nanos()
}

fn parse_log_name(name: &str) -> Option<(u128, u128)> {
    let rest = name.strip_prefix("log-")?;
    let (start, end) = rest.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WalManager::new(dir.path(), 1024 * 1024, Duration::from_secs(3600)).unwrap();
        mgr.write(b"one").unwrap();
        mgr.write(b"two").unwrap();
        mgr.write(b"three").unwrap();

        let records: Vec<Vec<u8>> = mgr.read_from_log().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn empty_manager_yields_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WalManager::new(dir.path(), 1024, Duration::from_secs(3600)).unwrap();
        assert_eq!(mgr.read_from_log().unwrap().count(), 0);
    }

    #[test]
    fn size_threshold_triggers_rotation_into_a_second_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WalManager::new(dir.path(), 10, Duration::from_secs(3600)).unwrap();
        for _ in 0..5 {
            mgr.write(b"0123456789").unwrap();
        }
        let files = mgr.sorted_log_files().unwrap();
        assert!(files.len() > 1, "expected rotation to produce multiple files, got {}", files.len());
        let records: Vec<Vec<u8>> = mgr.read_from_log().unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 5);
    }

    #[test]
    fn clear_old_logs_is_idempotent_and_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WalManager::new(dir.path(), 1024, Duration::from_secs(0)).unwrap();
        mgr.write(b"stale").unwrap();
        mgr.flush().unwrap();

        let far_future = now_nanos() + Duration::from_secs(3600).as_nanos();
        mgr.clear_old_logs(far_future).unwrap();
        mgr.clear_old_logs(far_future).unwrap();
        assert_eq!(mgr.read_from_log().unwrap().count(), 0);
    }
}
