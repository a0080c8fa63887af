use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use super::SessionMap;

/// A persistent (copy-on-write) map used by driver-side keyed
/// aggregation helpers. `copy()` creates a child that shares the
/// parent by reference; mutating the child never affects the parent.
/// Not internally synchronized: a child may be handed to another
/// thread, but concurrent mutation of the *same* child is the caller's
/// responsibility to avoid. The parent chain is a reference-counted,
/// immutable-once-shared arena rather than cyclic parent/child
/// references.
pub struct SessionCopyMap<K, V> {
    parent: Option<Arc<SessionCopyMap<K, V>>>,
    /// The consolidated base, meaningful only when `parent` is `None`
    /// (i.e. this node is itself a consolidation point).
    base: HashMap<K, V>,
    /// Changes relative to `parent` (or to `base`, for a root) since
    /// the most recent consolidation point. `Some(v)` is an
    /// insert/update, `None` is a tombstone.
    delta: HashMap<K, Option<V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> SessionCopyMap<K, V> {
    pub fn new() -> Self {
        Self { parent: None, base: HashMap::new(), delta: HashMap::new() }
    }

    pub fn put(&mut self, key: K, value: V) {
        self.delta.insert(key, Some(value));
    }

    pub fn remove(&mut self, key: K) {
        self.delta.insert(key, None);
    }

    /// Creates a child of `parent`. The parent is frozen in the sense
    /// that later mutations of the child are invisible to it.
    pub fn copy(parent: &Arc<SessionCopyMap<K, V>>) -> Self {
        Self { parent: Some(parent.clone()), base: HashMap::new(), delta: HashMap::new() }
    }

    /// Entries changed since the most recent consolidation point,
    /// including tombstones (`None`).
    pub fn iterator_delta(&self) -> Vec<(K, Option<V>)> {
        self.delta.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// The merged view: child overrides parent (or base), tombstones
    /// suppress entries beneath them.
    pub fn iterator_all(&self) -> Vec<(K, V)> {
        let mut merged: HashMap<K, V> = match &self.parent {
            Some(p) => p.iterator_all().into_iter().collect(),
            None => self.base.clone(),
        };
        for (k, v) in &self.delta {
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

    /// `doCopy(consolidate)`. With `consolidate = false` this is
    /// equivalent to [`Self::copy`]. With `consolidate = true` it
    /// produces a new root (no parent) whose merged view equals
    /// `self`'s and whose delta is empty: the flattened view becomes
    /// the new consolidated base.
    pub fn do_copy(self: &Arc<SessionCopyMap<K, V>>, consolidate: bool) -> Self {
        if !consolidate {
            return Self::copy(self);
        }
        let base = self.iterator_all().into_iter().collect();
        Self { parent: None, base, delta: HashMap::new() }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for SessionCopyMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SessionMap<K, V> for SessionCopyMap<K, V> {
    fn get(&self, key: &K) -> Option<V> {
        if let Some(entry) = self.delta.get(key) {
            return entry.clone();
        }
        match &self.parent {
            Some(p) => p.get(key),
            None => self.base.get(key).cloned(),
        }
    }

    fn iter_all(&self) -> Vec<(K, V)> {
        self.iterator_all()
    }
}

/// Wraps any [`SessionMap`] implementation with a lock so it can be
/// shared across threads by composing in synchronization rather than
/// baking it into the map itself.
pub struct Synchronized<M> {
    inner: Mutex<M>,
}

impl<M> Synchronized<M> {
    pub fn new(inner: M) -> Self {
        Self { inner: Mutex::new(inner) }
    }

    pub fn with_lock<R>(&self, f: impl FnOnce(&mut M) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequences() -> Vec<Vec<(&'static str, Option<i32>)>> {
        vec![
            vec![("a", Some(1)), ("b", Some(2))],
            vec![("a", Some(3)), ("a", None), ("c", Some(9))],
            vec![],
            vec![("seed", None)],
        ]
    }

    fn apply(map: &mut SessionCopyMap<&'static str, i32>, ops: &[(&'static str, Option<i32>)]) {
        for (k, v) in ops {
            match v {
                Some(val) => map.put(k, *val),
                None => map.remove(k),
            }
        }
    }

    #[test]
    fn child_overrides_parent_and_tombstones_suppress() {
        let mut root = SessionCopyMap::new();
        root.put("a", 1);
        root.put("b", 2);
        let root = Arc::new(root);

        let mut child = SessionCopyMap::copy(&root);
        child.put("a", 10);
        child.remove("b");
        child.put("c", 3);

        let mut view: Vec<_> = child.iterator_all();
        view.sort();
        assert_eq!(view, vec![("a", 10), ("c", 3)]);
        // parent is untouched
        let mut parent_view: Vec<_> = root.iterator_all();
        parent_view.sort();
        assert_eq!(parent_view, vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn consolidation_preserves_merged_view_for_several_op_sequences() {
        for ops in sequences() {
            let mut child = SessionCopyMap::new();
            child.put("seed", 0);
            let child = Arc::new(child);
            let mut grandchild = SessionCopyMap::copy(&child);
            apply(&mut grandchild, &ops);
            let grandchild = Arc::new(grandchild);

            let before: std::collections::BTreeMap<_, _> = grandchild.iterator_all().into_iter().collect();
            let consolidated = Arc::new(grandchild.do_copy(true));
            let after: std::collections::BTreeMap<_, _> = consolidated.iterator_all().into_iter().collect();
            assert_eq!(before, after);
            assert!(consolidated.iterator_delta().is_empty());
        }
    }

    #[test]
    fn non_consolidating_do_copy_is_a_plain_child() {
        let mut root = SessionCopyMap::new();
        root.put("x", 1);
        let root = Arc::new(root);
        let child = root.do_copy(false);
        assert_eq!(child.get(&"x"), Some(1));
        assert!(child.iterator_delta().is_empty());
    }
}
