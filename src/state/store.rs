use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

type Key = Vec<u8>;
type Value = Vec<u8>;

/// Identifies one handle: operator, partition, and the version it was
/// opened at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateStoreId {
    pub operator_id: u64,
    pub partition_id: u64,
    pub version: u64,
}

fn cache() -> &'static DashMap<StateStoreId, HashMap<Key, Value>> {
    static CACHE: OnceLock<DashMap<StateStoreId, HashMap<Key, Value>>> = OnceLock::new();
    CACHE.get_or_init(DashMap::new)
}

/// A versioned key/value store for one `(operator, partition)` pair,
/// backed by snapshot + delta files under
/// `<base>/<operator_id>/<partition_id>/`.
///
/// A handle is owned by exactly one task at a time; `commit_updates`
/// and `abort_updates` both consume `self`, so the type system rules
/// out the "commit after commit" and "use after commit" programming
/// errors. There is no runtime check because there is no way to
/// construct the illegal state.
pub struct StateStore {
    id: StateStoreId,
    dir: PathBuf,
    committed: HashMap<Key, Value>,
    pending: HashMap<Key, Option<Value>>,
}

impl StateStore {
    /// Opens `(operator_id, partition_id)` as of `version`, replaying
    /// the newest snapshot `<= version` plus all deltas in
    /// `(snapshot, version]`.
    pub fn open(base_dir: &Path, operator_id: u64, partition_id: u64, version: u64) -> Result<Self> {
        let dir = base_dir.join(operator_id.to_string()).join(partition_id.to_string());
        std::fs::create_dir_all(&dir)?;
        let id = StateStoreId { operator_id, partition_id, version };

        let committed = if let Some(cached) = cache().get(&id) {
            cached.clone()
        } else {
            let loaded = Self::load_version(&dir, version)?;
            cache().insert(id, loaded.clone());
            loaded
        };

        Ok(Self { id, dir, committed, pending: HashMap::new() })
    }

    fn load_version(dir: &Path, version: u64) -> Result<HashMap<Key, Value>> {
        let snapshot_version = Self::latest_snapshot_at_or_below(dir, version)?;
        let mut data = match snapshot_version {
            Some(v) => Self::read_snapshot(dir, v)?,
            None => HashMap::new(),
        };

        let start = snapshot_version.map(|v| v + 1).unwrap_or(0);
        for v in start..=version {
            if let Some(delta) = Self::read_delta(dir, v)? {
                for (k, maybe_v) in delta {
                    match maybe_v {
                        Some(val) => {
                            data.insert(k, val);
                        }
                        None => {
                            data.remove(&k);
                        }
                    }
                }
            }
        }
        Ok(data)
    }

    fn latest_snapshot_at_or_below(dir: &Path, version: u64) -> Result<Option<u64>> {
        let mut best = None;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(v) = name.strip_suffix(".snapshot").and_then(|s| s.parse::<u64>().ok()) {
                    if v <= version && best.map(|b| v > b).unwrap_or(true) {
                        best = Some(v);
                    }
                }
            }
        }
        Ok(best)
    }

    fn read_snapshot(dir: &Path, version: u64) -> Result<HashMap<Key, Value>> {
        let path = dir.join(format!("{version}.snapshot"));
        let bytes = std::fs::read(path)?;
        let (map, _): (HashMap<Key, Value>, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(map)
    }

    fn read_delta(dir: &Path, version: u64) -> Result<Option<Vec<(Key, Option<Value>)>>> {
        let path = dir.join(format!("{version}.delta"));
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let (entries, _): (Vec<(Key, Option<Value>)>, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(Some(entries))
    }

    pub fn get(&self, key: &[u8]) -> Option<Value> {
        if let Some(pending) = self.pending.get(key) {
            return pending.clone();
        }
        self.committed.get(key).cloned()
    }

    pub fn put(&mut self, key: Key, value: Value) {
        self.pending.insert(key, Some(value));
    }

    pub fn remove(&mut self, key: Key) {
        self.pending.insert(key, None);
    }

    /// Full-range scan over the merged (committed + buffered) view.
    /// Spec.md §4.4 only requires the unbounded `getRange(None, None)`
    /// form.
    pub fn get_range(&self) -> Vec<(Key, Value)> {
        let mut merged = self.committed.clone();
        for (k, v) in &self.pending {
            match v {
                Some(val) => {
                    merged.insert(k.clone(), val.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Writes a delta file for `version + 1` and returns the new
    /// version. The on-disk store and the process-wide cache both
    /// observe the committed state immediately afterward.
    pub fn commit_updates(self) -> Result<u64> {
        let new_version = self.id.version + 1;
        let entries: Vec<(Key, Option<Value>)> = self.pending.into_iter().collect();
        let path = self.dir.join(format!("{new_version}.delta"));
        let bytes = bincode::serde::encode_to_vec(&entries, bincode::config::standard())?;
        std::fs::write(&path, bytes)?;
        info!(operator = self.id.operator_id, partition = self.id.partition_id, new_version, "committed state store delta");

        let mut next = self.committed;
        for (k, v) in entries {
            match v {
                Some(val) => {
                    next.insert(k, val);
                }
                None => {
                    next.remove(&k);
                }
            }
        }
        cache().insert(
            StateStoreId { operator_id: self.id.operator_id, partition_id: self.id.partition_id, version: new_version },
            next,
        );
        Ok(new_version)
    }

    /// Discards buffered mutations. The on-disk store is untouched.
    pub fn abort_updates(self) {
        debug!(operator = self.id.operator_id, partition = self.id.partition_id, version = self.id.version, "aborted state store delta");
    }

    /// Coalesces the current committed view into a snapshot file, so
    /// future opens don't need to replay every delta since genesis.
    /// Spec.md §4.4 allows this to happen asynchronously; callers
    /// decide when to invoke it.
    pub fn coalesce_snapshot(&self) -> Result<()> {
        let path = self.dir.join(format!("{}.snapshot", self.id.version));
        let bytes = bincode::serde::encode_to_vec(&self.committed, bincode::config::standard())?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Evicts the in-memory cache shared across all `StateStore`
    /// handles. Persistent files are left intact.
    pub fn clear_all() {
        cache().clear();
    }
}

/// `withStateStores`: opens `(operator_id, partition_id, new_version -
/// 1)`, runs `f` over the partition's input, and requires `f` to
/// commit before returning. Enforced by `f`'s own return type owning
/// the post-commit version, not by a runtime check.
pub fn with_state_store<F, R>(
    base_dir: &Path,
    operator_id: u64,
    partition_id: u64,
    new_version: u64,
    input: Vec<crate::block::Record>,
    f: F,
) -> Result<R>
where
    F: FnOnce(StateStore, Vec<crate::block::Record>) -> Result<(R, u64)>,
{
    if new_version == 0 {
        return Err(CoreError::Programming("withStateStores: new_version must be >= 1".into()));
    }
    let store = StateStore::open(base_dir, operator_id, partition_id, new_version - 1)?;
    let (result, committed_version) = f(store, input)?;
    if committed_version != new_version {
        return Err(CoreError::Programming(format!(
            "withStateStores: handler committed version {committed_version}, expected {new_version}"
        )));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_then_reopen_observes_written_state() {
        let dir = tempfile::tempdir().unwrap();
        StateStore::clear_all();
        let mut store = StateStore::open(dir.path(), 1, 0, 0).unwrap();
        store.put(b"a".to_vec(), b"1".to_vec());
        let v1 = store.commit_updates().unwrap();
        assert_eq!(v1, 1);

        let store = StateStore::open(dir.path(), 1, 0, 1).unwrap();
        assert_eq!(store.get(b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn abort_then_reopen_same_version_sees_prior_value() {
        let dir = tempfile::tempdir().unwrap();
        StateStore::clear_all();
        let mut store = StateStore::open(dir.path(), 2, 0, 0).unwrap();
        store.put(b"a".to_vec(), b"1".to_vec());
        store.commit_updates().unwrap();

        let mut v1 = StateStore::open(dir.path(), 2, 0, 1).unwrap();
        v1.put(b"a".to_vec(), b"2".to_vec());
        v1.abort_updates();

        let reopened = StateStore::open(dir.path(), 2, 0, 1).unwrap();
        assert_eq!(reopened.get(b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn recovery_replays_snapshot_then_deltas() {
        let dir = tempfile::tempdir().unwrap();
        StateStore::clear_all();
        let mut store = StateStore::open(dir.path(), 3, 0, 0).unwrap();
        store.put(b"k".to_vec(), b"v0".to_vec());
        store.commit_updates().unwrap();

        let store = StateStore::open(dir.path(), 3, 0, 1).unwrap();
        store.coalesce_snapshot().unwrap();
        StateStore::clear_all();

        let mut store = StateStore::open(dir.path(), 3, 0, 1).unwrap();
        store.put(b"k".to_vec(), b"v1".to_vec());
        store.commit_updates().unwrap();
        StateStore::clear_all();

        let store = StateStore::open(dir.path(), 3, 0, 2).unwrap();
        assert_eq!(store.get(b"k"), Some(b"v1".to_vec()));
    }

    #[test]
    fn with_state_store_requires_matching_commit_version() {
        let dir = tempfile::tempdir().unwrap();
        StateStore::clear_all();
        let result = with_state_store(dir.path(), 4, 0, 1, vec![], |store, _input| {
            let v = store.commit_updates()?;
            Ok(((), v))
        });
        assert!(result.is_ok());

        let result = with_state_store(dir.path(), 4, 0, 2, vec![], |store, _input| {
            store.commit_updates()?;
            Ok(((), 999)) // handler reports the wrong version
        });
        assert!(result.is_err());
    }
}
