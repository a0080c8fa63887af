//! Offset algebra (component A).
//!
//! An [`Offset`] is an opaque, totally-ordered per-source progress
//! marker. Comparison is only defined between offsets of the same
//! underlying source kind; comparing across kinds is a programming
//! error. [`CompositeOffset`] aggregates one optional offset per
//! source into the progress marker of a whole query.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A single source's progress marker. Implementors must be cheap to
/// clone (offsets are passed around by value across threads) and must
/// only claim comparability with offsets of their own concrete type.
pub trait Offset: fmt::Debug + fmt::Display + Send + Sync {
    /// Type-erased equality/ordering hook. `other` is compared against
    /// `self`'s concrete type; a kind mismatch is reported by
    /// returning `None` rather than panicking.
    fn compare_same_kind(&self, other: &dyn Offset) -> Option<Ordering>;

    fn as_any(&self) -> &dyn Any;

    fn clone_box(&self) -> Arc<dyn Offset>;
}

/// Compares two offsets of possibly-unknown kind. Fails (as a
/// [`CoreError::Programming`] error) rather than silently returning
/// `Ordering::Equal` when the kinds differ.
pub fn compare(a: &dyn Offset, b: &dyn Offset) -> Result<Ordering> {
    a.compare_same_kind(b).ok_or_else(|| {
        CoreError::Programming(format!(
            "cannot compare offsets of different kinds: {a} vs {b}"
        ))
    })
}

/// A monotonic integer offset, the common case for log- or
/// sequence-number-based sources (Kafka-style, file line counters, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LongOffset(pub i64);

impl fmt::Display for LongOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Offset for LongOffset {
    fn compare_same_kind(&self, other: &dyn Offset) -> Option<Ordering> {
        other.as_any().downcast_ref::<LongOffset>().map(|o| self.0.cmp(&o.0))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Arc<dyn Offset> {
        Arc::new(*self)
    }
}

/// Ordered tuple of per-source offsets, representing the progress of
/// an entire query. An absent slot (`None`) compares as less than any
/// concrete offset of that slot; two absent slots compare equal.
#[derive(Clone)]
pub struct CompositeOffset {
    components: Vec<Option<Arc<dyn Offset>>>,
}

impl CompositeOffset {
    pub fn new(components: Vec<Option<Arc<dyn Offset>>>) -> Self {
        Self { components }
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Offset>> {
        self.components.get(index).and_then(|c| c.as_ref())
    }

    pub fn components(&self) -> &[Option<Arc<dyn Offset>>] {
        &self.components
    }

    /// Strict component-wise comparison: `self > other` requires every
    /// component `>=` and at least one strictly `>`; anything else
    /// (including a genuine kind mismatch on a shared slot) is
    /// incomparable and fails.
    pub fn compare(&self, other: &CompositeOffset) -> Result<Ordering> {
        if self.components.len() != other.components.len() {
            return Err(CoreError::Programming(format!(
                "composite offsets of different arity: {} vs {}",
                self.components.len(),
                other.components.len()
            )));
        }

        let mut any_greater = false;
        let mut any_less = false;

        for (a, b) in self.components.iter().zip(other.components.iter()) {
            let ord = match (a, b) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(a), Some(b)) => compare(a.as_ref(), b.as_ref())?,
            };
            match ord {
                Ordering::Less => any_less = true,
                Ordering::Greater => any_greater = true,
                Ordering::Equal => {}
            }
        }

        match (any_less, any_greater) {
            (false, false) => Ok(Ordering::Equal),
            (false, true) => Ok(Ordering::Greater),
            (true, false) => Ok(Ordering::Less),
            (true, true) => Err(CoreError::Programming(
                "composite offsets are incomparable: neither dominates the other".into(),
            )),
        }
    }
}

impl fmt::Debug for CompositeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CompositeOffset").field(&self.to_string()).finish()
    }
}

impl fmt::Display for CompositeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match c {
                Some(o) => write!(f, "{o}")?,
                None => write!(f, "-")?,
            }
        }
        write!(f, "]")
    }
}

impl Offset for CompositeOffset {
    fn compare_same_kind(&self, other: &dyn Offset) -> Option<Ordering> {
        let other = other.as_any().downcast_ref::<CompositeOffset>()?;
        self.compare(other).ok()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Arc<dyn Offset> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long(v: i64) -> Arc<dyn Offset> {
        Arc::new(LongOffset(v))
    }

    #[test]
    fn long_offset_orders_by_value() {
        assert_eq!(compare(&LongOffset(1), &LongOffset(2)).unwrap(), Ordering::Less);
        assert_eq!(compare(&LongOffset(5), &LongOffset(5)).unwrap(), Ordering::Equal);
        assert_eq!(compare(&LongOffset(9), &LongOffset(2)).unwrap(), Ordering::Greater);
    }

    #[test]
    fn incomparable_kinds_fail() {
        let a = CompositeOffset::new(vec![Some(long(1))]);
        let err = compare(&LongOffset(1), &a).unwrap_err();
        assert!(matches!(err, CoreError::Programming(_)));
    }

    #[test]
    fn missing_slot_is_less_than_concrete() {
        let a = CompositeOffset::new(vec![None]);
        let b = CompositeOffset::new(vec![Some(long(1))]);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
    }

    #[test]
    fn both_missing_slots_are_equal() {
        let a = CompositeOffset::new(vec![None, None]);
        let b = CompositeOffset::new(vec![None, None]);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Equal);
    }

    #[test]
    fn partial_progress_is_incomparable() {
        let a = CompositeOffset::new(vec![Some(long(5)), Some(long(1))]);
        let b = CompositeOffset::new(vec![Some(long(1)), Some(long(5))]);
        assert!(a.compare(&b).is_err());
    }

    #[test]
    fn strict_dominance_orders() {
        let a = CompositeOffset::new(vec![Some(long(1)), Some(long(1))]);
        let b = CompositeOffset::new(vec![Some(long(2)), Some(long(1))]);
        assert_eq!(a.compare(&b).unwrap(), Ordering::Less);
        assert_eq!(b.compare(&a).unwrap(), Ordering::Greater);
    }
}
