//! Progress Tracker (component F).
//!
//! A monotone map from Source identity to [`Offset`], guarded by a
//! single lock. Sources are keyed by their stable `toString` identity;
//! a `BTreeMap` keeps that identity as the canonical ordering
//! `to_offset` needs, for free.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CoreError, Result};
use crate::offset::{self, CompositeOffset, Offset};

/// Tracks the most recently committed offset per source. Shared by the
/// streaming execution loop (writer) and `awaitOffset` callers
/// (readers); both go through the same lock.
pub struct StreamProgress {
    offsets: Mutex<BTreeMap<String, Arc<dyn Offset>>>,
}

impl StreamProgress {
    pub fn new() -> Self {
        Self { offsets: Mutex::new(BTreeMap::new()) }
    }

    /// Seeds the tracker from a previously committed `CompositeOffset`,
    /// pairing components with `source_ids` positionally. Used to
    /// replay `sink.currentOffset()` on construction.
    pub fn seed(source_ids: &[String], offset: &CompositeOffset) -> Result<Self> {
        if source_ids.len() != offset.len() {
            return Err(CoreError::Programming(format!(
                "cannot seed progress for {} sources from a composite offset of arity {}",
                source_ids.len(),
                offset.len()
            )));
        }
        let mut offsets = BTreeMap::new();
        for (id, slot) in source_ids.iter().zip(offset.components()) {
            if let Some(o) = slot {
                offsets.insert(id.clone(), o.clone());
            }
        }
        Ok(Self { offsets: Mutex::new(offsets) })
    }

    /// Records `new_offset` for `source_id`. Fails if a current offset
    /// is already recorded and `new_offset` does not strictly exceed
    /// it, enforcing the one monotonicity invariant progress updates
    /// require.
    pub fn update(&self, source_id: &str, new_offset: Arc<dyn Offset>) -> Result<()> {
        let mut offsets = self.offsets.lock();
        if let Some(current) = offsets.get(source_id) {
            match offset::compare(new_offset.as_ref(), current.as_ref())? {
                Ordering::Greater => {}
                _ => {
                    return Err(CoreError::Programming(format!(
                        "non-monotone progress update for source '{source_id}': {new_offset} is not greater than {current}"
                    )));
                }
            }
        }
        offsets.insert(source_id.to_string(), new_offset);
        Ok(())
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn Offset>> {
        self.offsets.lock().get(source_id).cloned()
    }

    /// Validates every update in `updates` against the monotonicity
    /// invariant, applies them all, then invokes `then` with the
    /// resulting `CompositeOffset`, all under the same lock
    /// acquisition, so a caller can commit a Sink batch atomically with
    /// respect to the progress it advances. Validation happens before
    /// any mutation so a rejected update never leaves a partial write
    /// behind.
    pub fn update_then<R>(
        &self,
        updates: Vec<(String, Arc<dyn Offset>)>,
        then: impl FnOnce(&CompositeOffset) -> Result<R>,
    ) -> Result<R> {
        let mut offsets = self.offsets.lock();
        for (id, new_offset) in &updates {
            if let Some(current) = offsets.get(id) {
                match offset::compare(new_offset.as_ref(), current.as_ref())? {
                    Ordering::Greater => {}
                    _ => {
                        return Err(CoreError::Programming(format!(
                            "non-monotone progress update for source '{id}': {new_offset} is not greater than {current}"
                        )));
                    }
                }
            }
        }
        for (id, new_offset) in updates {
            offsets.insert(id, new_offset);
        }
        let composite = CompositeOffset::new(offsets.values().cloned().map(Some).collect());
        then(&composite)
    }

    /// Every source identity currently tracked, in canonical (sorted)
    /// order.
    pub fn source_ids(&self) -> Vec<String> {
        self.offsets.lock().keys().cloned().collect()
    }

    /// The whole-query progress marker: one component per tracked
    /// source, in canonical order.
    pub fn to_offset(&self) -> CompositeOffset {
        let offsets = self.offsets.lock();
        CompositeOffset::new(offsets.values().cloned().map(Some).collect())
    }
}

impl Default for StreamProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for StreamProgress {
    /// Ignores insertion order (a `BTreeMap` has none to ignore) and
    /// compares offsets by their canonical `Display` form, since
    /// `Offset` does not require `PartialEq`.
    fn eq(&self, other: &Self) -> bool {
        let a = self.offsets.lock();
        let b = other.offsets.lock();
        a.len() == b.len() && a.iter().zip(b.iter()).all(|((k1, v1), (k2, v2))| k1 == k2 && v1.to_string() == v2.to_string())
    }
}

impl Eq for StreamProgress {}

impl Hash for StreamProgress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (k, v) in self.offsets.lock().iter() {
            k.hash(state);
            v.to_string().hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::LongOffset;

    fn long(v: i64) -> Arc<dyn Offset> {
        Arc::new(LongOffset(v))
    }

    #[test]
    fn repeated_equal_offset_is_rejected() {
        let progress = StreamProgress::new();
        progress.update("src", long(5)).unwrap();
        assert!(progress.update("src", long(5)).is_err());
    }

    #[test]
    fn strictly_increasing_offset_is_accepted() {
        let progress = StreamProgress::new();
        progress.update("src", long(5)).unwrap();
        progress.update("src", long(6)).unwrap();
        assert_eq!(progress.get("src").unwrap().to_string(), "6");
    }

    #[test]
    fn to_offset_orders_components_by_source_identity() {
        let progress = StreamProgress::new();
        progress.update("b", long(2)).unwrap();
        progress.update("a", long(1)).unwrap();
        let offset = progress.to_offset();
        assert_eq!(offset.to_string(), "[1, 2]");
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let first = StreamProgress::new();
        first.update("a", long(1)).unwrap();
        first.update("b", long(2)).unwrap();

        let second = StreamProgress::new();
        second.update("b", long(2)).unwrap();
        second.update("a", long(1)).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn seed_from_composite_offset_replays_prior_progress() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let offset = CompositeOffset::new(vec![Some(long(3)), Some(long(4))]);
        let progress = StreamProgress::seed(&ids, &offset).unwrap();
        assert_eq!(progress.get("a").unwrap().to_string(), "3");
        assert_eq!(progress.get("b").unwrap().to_string(), "4");
    }
}
