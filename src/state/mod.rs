//! Session / State Store (component D).
//!
//! Two nested layers serve two different access patterns: the
//! short-lived, purely in-memory [`session::SessionCopyMap`] used by
//! driver-side keyed-aggregation helpers, and the long-lived,
//! WAL-backed [`store::StateStore`] used by stateful operators. Both
//! implement [`SessionMap`], a shared trait standing in for a deep
//! map-class inheritance hierarchy.

mod session;
mod store;

pub use session::{SessionCopyMap, Synchronized};
pub use store::{with_state_store, StateStore, StateStoreId};

/// Common read surface shared by the in-memory session map and the
/// on-disk state store, so callers that only need to read don't care
/// which backing implementation they were handed.
pub trait SessionMap<K, V> {
    fn get(&self, key: &K) -> Option<V>;
    fn iter_all(&self) -> Vec<(K, V)>;
}
