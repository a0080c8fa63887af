//! Streaming Execution Loop (component G).
//!
//! One dedicated worker thread per query rather than a coroutine or
//! async control flow: a plain OS thread paired with condition
//! variables drives the loop. Plan rewrite and execution are genuinely
//! out of scope; this crate models that seam as the [`QueryExecutor`]
//! collaborator in [`crate::io`] rather than reimplementing a planner.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::error::{CoreError, Result};
use crate::io::{QueryExecutor, Sink, Source};
use crate::offset::{self, CompositeOffset};
use crate::progress::StreamProgress;

/// Captures an uncaught failure from the control loop.
/// `awaitTermination` re-raises this.
#[derive(Debug, Clone, thiserror::Error)]
#[error("streaming query failed: {message} (batch start={start_offset}, end={end_offset:?})")]
pub struct QueryException {
    pub message: String,
    pub cause: Option<String>,
    pub start_offset: CompositeOffset,
    pub end_offset: Option<CompositeOffset>,
}

/// How often `await_offset`/`await_termination` wake up to re-check
/// their condition.
const AWAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs one streaming query: repeatedly pulls new data from its
/// sources, hands it to a [`QueryExecutor`], and commits the result to
/// a [`Sink`] under the progress lock.
pub struct StreamingQuery {
    sources: Vec<Arc<dyn Source>>,
    sink: Arc<dyn Sink>,
    executor: Arc<dyn QueryExecutor>,
    progress: StreamProgress,
    min_batch_gap: Duration,
    active: AtomicBool,
    death_cause: Mutex<Option<QueryException>>,
    signal: Mutex<()>,
    condvar: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingQuery {
    /// Seeds progress from `sink.current_offset()` if present (replay
    /// of the last committed offsets), or starts fresh otherwise.
    pub fn new(
        sources: Vec<Arc<dyn Source>>,
        sink: Arc<dyn Sink>,
        executor: Arc<dyn QueryExecutor>,
        min_batch_gap: Duration,
    ) -> Result<Arc<Self>> {
        let mut names: Vec<String> = sources.iter().map(|s| s.name().to_string()).collect();
        names.sort();
        if names.iter().collect::<HashSet<_>>().len() != names.len() {
            return Err(CoreError::Programming("a streaming query's sources must have distinct names".into()));
        }

        let progress = match sink.current_offset()? {
            Some(offset) => StreamProgress::seed(&names, &offset)?,
            None => StreamProgress::new(),
        };

        Ok(Arc::new(Self {
            sources,
            sink,
            executor,
            progress,
            min_batch_gap,
            active: AtomicBool::new(false),
            death_cause: Mutex::new(None),
            signal: Mutex::new(()),
            condvar: Condvar::new(),
            worker: Mutex::new(None),
        }))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(AtomicOrdering::SeqCst)
    }

    pub fn exception(&self) -> Option<QueryException> {
        self.death_cause.lock().clone()
    }

    /// Spawns the dedicated worker thread. Fails if the query is
    /// already active.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.active.swap(true, AtomicOrdering::SeqCst) {
            return Err(CoreError::Programming("streaming query is already running".into()));
        }
        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("streaming-query".into())
            .spawn(move || this.run_loop())
            .map_err(|e| CoreError::Programming(format!("failed to spawn streaming query worker: {e}")))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn run_loop(self: Arc<Self>) {
        info!("streaming query worker started");
        while self.active.load(AtomicOrdering::SeqCst) {
            thread::sleep(self.min_batch_gap);
            if !self.active.load(AtomicOrdering::SeqCst) {
                break;
            }
            match self.run_one_batch() {
                Ok(true) => self.wake_waiters(),
                Ok(false) => {}
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        info!("streaming query worker exited");
    }

    /// One control-loop iteration. Returns `Ok(true)` if a batch was
    /// committed, `Ok(false)` if every source returned nothing new.
    fn run_one_batch(&self) -> Result<bool> {
        let mut batches = Vec::new();
        for source in &self.sources {
            let last = self.progress.get(source.name());
            if let Some(batch) = source.get_next_batch(last.as_deref())? {
                batches.push((source.name().to_string(), batch));
            }
        }

        if batches.is_empty() {
            return Ok(false);
        }

        let data = self.executor.execute(&batches)?;
        let updates: Vec<(String, Arc<dyn crate::offset::Offset>)> =
            batches.iter().map(|(name, batch)| (name.clone(), batch.end_offset.clone())).collect();

        // Updates StreamProgress then calls sink.add_batch under the
        // same progress lock. `update_then` holds the lock across both,
        // the same "lock, then run a closure" shape as
        // `state::Synchronized::with_lock`.
        self.progress.update_then(updates, |batch_offset| self.sink.add_batch(batch_offset, &data))?;
        Ok(true)
    }

    fn fail(&self, err: CoreError) {
        error!(error = %err, "streaming query failed");
        let exception = QueryException {
            message: err.to_string(),
            cause: None,
            start_offset: self.progress.to_offset(),
            end_offset: None,
        };
        *self.death_cause.lock() = Some(exception);
        self.active.store(false, AtomicOrdering::SeqCst);
        self.wake_waiters();
    }

    fn wake_waiters(&self) {
        let _guard = self.signal.lock();
        self.condvar.notify_all();
    }

    /// Blocks until `source_id`'s committed offset reaches or exceeds
    /// `target`, waking at least every 100 ms to re-check. Returns
    /// early with the captured failure if the loop has terminated with
    /// one.
    pub fn await_offset(&self, source_id: &str, target: &dyn crate::offset::Offset) -> Result<()> {
        loop {
            if let Some(exception) = self.death_cause.lock().clone() {
                return Err(CoreError::Query(Box::new(exception)));
            }
            if let Some(current) = self.progress.get(source_id) {
                if matches!(offset::compare(current.as_ref(), target)?, Ordering::Greater | Ordering::Equal) {
                    return Ok(());
                }
            }
            let mut guard = self.signal.lock();
            self.condvar.wait_for(&mut guard, AWAIT_POLL_INTERVAL);
        }
    }

    /// Blocks until the worker exits; re-raises any captured
    /// [`QueryException`].
    pub fn await_termination(&self) -> Result<()> {
        loop {
            if !self.active.load(AtomicOrdering::SeqCst) {
                break;
            }
            let mut guard = self.signal.lock();
            self.condvar.wait_for(&mut guard, AWAIT_POLL_INTERVAL);
        }
        match self.death_cause.lock().clone() {
            Some(exception) => Err(CoreError::Query(Box::new(exception))),
            None => Ok(()),
        }
    }

    /// Same as [`Self::await_termination`], but returns `!is_active()`
    /// once `timeout` elapses instead of blocking indefinitely. Does
    /// not re-raise a captured failure: callers check
    /// [`Self::exception`] themselves.
    pub fn await_termination_timeout(&self, timeout: Duration) -> Result<bool> {
        if timeout.is_zero() {
            return Err(CoreError::Programming("await_termination_timeout requires a positive timeout".into()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if !self.active.load(AtomicOrdering::SeqCst) {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let mut guard = self.signal.lock();
            self.condvar.wait_for(&mut guard, remaining.min(AWAIT_POLL_INTERVAL));
        }
        Ok(!self.active.load(AtomicOrdering::SeqCst))
    }

    /// Idempotent: sets `active = false`, wakes the worker (which
    /// re-checks the flag after at most one `min_batch_gap` sleep), and
    /// joins it.
    pub fn stop(&self) -> Result<()> {
        if !self.active.swap(false, AtomicOrdering::SeqCst) {
            return Ok(());
        }
        self.wake_waiters();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for StreamingQuery {
    fn drop(&mut self) {
        if self.active.load(AtomicOrdering::SeqCst) {
            warn!("streaming query dropped while still active; stopping");
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{InMemorySink, InMemorySource, PassthroughExecutor, Schema};
    use crate::offset::LongOffset;
    use std::time::Duration as StdDuration;

    fn query_with(source: Arc<InMemorySource>, sink: Arc<InMemorySink>) -> Arc<StreamingQuery> {
        StreamingQuery::new(
            vec![source as Arc<dyn Source>],
            sink as Arc<dyn Sink>,
            Arc::new(PassthroughExecutor),
            StdDuration::from_millis(5),
        )
        .unwrap()
    }

    #[test]
    fn commits_a_batch_when_a_source_has_new_data() {
        let source = Arc::new(InMemorySource::new("s", Schema::default()));
        let sink = Arc::new(InMemorySink::new());
        let query = query_with(source.clone(), sink.clone());

        query.start().unwrap();
        source.push(vec![b"a".to_vec(), b"b".to_vec()]);
        query.await_offset("s", &LongOffset(0)).unwrap();
        query.stop().unwrap();

        assert_eq!(sink.all_data(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn stop_is_idempotent_and_await_termination_returns_cleanly() {
        let source = Arc::new(InMemorySource::new("s", Schema::default()));
        let sink = Arc::new(InMemorySink::new());
        let query = query_with(source, sink);

        query.start().unwrap();
        query.stop().unwrap();
        query.stop().unwrap();
        query.await_termination().unwrap();
    }

    #[test]
    fn await_termination_timeout_reports_still_active_before_stop() {
        let source = Arc::new(InMemorySource::new("s", Schema::default()));
        let sink = Arc::new(InMemorySink::new());
        let query = query_with(source, sink);

        query.start().unwrap();
        let still_active = !query.await_termination_timeout(StdDuration::from_millis(20)).unwrap();
        assert!(still_active);
        query.stop().unwrap();
    }

    #[test]
    fn duplicate_source_names_are_rejected_at_construction() {
        let a = Arc::new(InMemorySource::new("dup", Schema::default()));
        let b = Arc::new(InMemorySource::new("dup", Schema::default()));
        let sink = Arc::new(InMemorySink::new());
        let result = StreamingQuery::new(
            vec![a as Arc<dyn Source>, b as Arc<dyn Source>],
            sink as Arc<dyn Sink>,
            Arc::new(PassthroughExecutor),
            StdDuration::from_millis(5),
        );
        assert!(result.is_err());
    }
}
