//! Sources & Sinks API (component H).
//!
//! Plain, blocking traits rather than `async fn`: the suspension points
//! (`getNextBatch`, `addBatch`) are ordinary blocking calls made from
//! the streaming loop's dedicated worker thread, not futures polled by
//! a runtime.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::Record;
use crate::error::{CoreError, Result};
use crate::offset::{CompositeOffset, Offset};

/// Field names only. The relational type system and the query planner
/// that would consume it are out of scope here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema(pub Vec<String>);

/// One unit of work the streaming loop hands to the query engine: the
/// offset this batch advances its source to, and the new records
/// available as of that offset. A logical plan bound to data collapses
/// to the data itself here, since plan rewriting and execution are an
/// opaque black box this crate models as the [`QueryExecutor`]
/// collaborator rather than reimplementing.
#[derive(Debug, Clone)]
pub struct Batch {
    pub end_offset: Arc<dyn Offset>,
    pub data: Vec<Record>,
}

/// An input to the streaming execution loop. Implementors own their
/// own replay semantics up to `last_committed_offset`.
pub trait Source: Send + Sync {
    /// Returns a batch whose `end_offset` is strictly greater than
    /// `last_committed_offset`, or `None` if nothing new has arrived.
    fn get_next_batch(&self, last_committed_offset: Option<&dyn Offset>) -> Result<Option<Batch>>;

    fn schema(&self) -> Schema;

    /// Stable identity used as this source's key in [`crate::progress::StreamProgress`]
    /// and as its canonical ordering key in an assembled `CompositeOffset`.
    fn name(&self) -> &str;

    /// Optional: a slice of already-seen data between two offsets, for
    /// test sources that support replaying an exact range. Default is
    /// "not supported," not a panic.
    fn get_slice(&self, _start: Option<&dyn Offset>, _end: &dyn Offset) -> Result<Vec<Record>> {
        Err(CoreError::Source(format!("{} does not support get_slice", self.name())))
    }
}

/// The output of the streaming execution loop. `add_batch` must be
/// transactional: on success, `current_offset()` equals `end_offset`
/// and the data is durable; on failure, neither changes.
pub trait Sink: Send + Sync {
    fn current_offset(&self) -> Result<Option<CompositeOffset>>;

    fn add_batch(&self, end_offset: &CompositeOffset, data: &[Record]) -> Result<()>;
}

/// The query engine collaborator: given the batches produced this tick
/// (one per source that had new data, keyed by source name), produce
/// the records to hand the Sink. Plan rewriting, attribute remapping,
/// and execution all live on the other side of this trait, out of
/// scope here. This is the seam the streaming loop calls through, a
/// caller-supplied closure rather than an interpreter built into the
/// loop itself.
pub trait QueryExecutor: Send + Sync {
    fn execute(&self, batches: &[(String, Batch)]) -> Result<Vec<Record>>;
}

/// A `QueryExecutor` that concatenates every batch's records in source
/// order. Used by tests and the demo binary in place of a real query
/// engine.
pub struct PassthroughExecutor;

impl QueryExecutor for PassthroughExecutor {
    fn execute(&self, batches: &[(String, Batch)]) -> Result<Vec<Record>> {
        Ok(batches.iter().flat_map(|(_, b)| b.data.clone()).collect())
    }
}

/// An in-memory `Source` backed by a caller-fed queue of micro-batches,
/// used by tests and the demo binary in place of a real
/// Receiver-backed adapter.
pub struct InMemorySource {
    name: String,
    schema: Schema,
    pending: Mutex<Vec<(i64, Vec<Record>)>>,
}

impl InMemorySource {
    pub fn new(name: impl Into<String>, schema: Schema) -> Self {
        Self { name: name.into(), schema, pending: Mutex::new(Vec::new()) }
    }

    /// Appends one micro-batch's worth of records, available to the
    /// next `get_next_batch` call.
    pub fn push(&self, records: Vec<Record>) {
        let mut pending = self.pending.lock();
        let next_offset = pending.last().map(|(o, _)| o + 1).unwrap_or(0);
        pending.push((next_offset, records));
    }
}

impl Source for InMemorySource {
    fn get_next_batch(&self, last_committed_offset: Option<&dyn Offset>) -> Result<Option<Batch>> {
        use crate::offset::LongOffset;

        let last = match last_committed_offset {
            None => -1,
            Some(o) => {
                o.as_any()
                    .downcast_ref::<LongOffset>()
                    .ok_or_else(|| CoreError::Programming(format!("{}: expected a LongOffset", self.name)))?
                    .0
            }
        };

        let pending = self.pending.lock();
        let data: Vec<Record> = pending.iter().filter(|(offset, _)| *offset > last).flat_map(|(_, rs)| rs.clone()).collect();
        let highest = pending.iter().map(|(o, _)| *o).max();

        match highest {
            Some(h) if h > last => Ok(Some(Batch { end_offset: Arc::new(LongOffset(h)), data })),
            _ => Ok(None),
        }
    }

    fn schema(&self) -> Schema {
        self.schema.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// An in-memory `Sink` that appends every committed batch's data to a
/// growing log, used by tests and the demo binary.
pub struct InMemorySink {
    committed: Mutex<(Option<CompositeOffset>, Vec<Record>)>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self { committed: Mutex::new((None, Vec::new())) }
    }

    pub fn all_data(&self) -> Vec<Record> {
        self.committed.lock().1.clone()
    }
}

impl Default for InMemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for InMemorySink {
    fn current_offset(&self) -> Result<Option<CompositeOffset>> {
        Ok(self.committed.lock().0.clone())
    }

    fn add_batch(&self, end_offset: &CompositeOffset, data: &[Record]) -> Result<()> {
        let mut committed = self.committed.lock();
        committed.1.extend_from_slice(data);
        committed.0 = Some(end_offset.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::LongOffset;

    #[test]
    fn in_memory_source_returns_none_until_data_is_pushed() {
        let source = InMemorySource::new("s", Schema::default());
        assert!(source.get_next_batch(None).unwrap().is_none());

        source.push(vec![b"a".to_vec()]);
        let batch = source.get_next_batch(None).unwrap().unwrap();
        assert_eq!(batch.data, vec![b"a".to_vec()]);

        assert!(source.get_next_batch(Some(batch.end_offset.as_ref())).unwrap().is_none());
    }

    #[test]
    fn in_memory_sink_add_batch_is_transactional_on_the_happy_path() {
        let sink = InMemorySink::new();
        assert!(sink.current_offset().unwrap().is_none());

        let end = CompositeOffset::new(vec![Some(Arc::new(LongOffset(3)) as Arc<dyn Offset>)]);
        sink.add_batch(&end, &[b"x".to_vec()]).unwrap();

        assert_eq!(sink.current_offset().unwrap().unwrap().to_string(), end.to_string());
        assert_eq!(sink.all_data(), vec![b"x".to_vec()]);
    }
}
