use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::error::{CoreError, Result};
use crate::wal::WalManager;

use super::messages::{ReceivedBlockInfo, ReceiverState, ReceiverTrackerMessage, ReceiverTrackerReply};

/// How long [`ReceiverTracker::stop`] waits for a still-running
/// supervisor thread before giving up on it and logging a straggler.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type Envelope = (ReceiverTrackerMessage, oneshot::Sender<ReceiverTrackerReply>);

/// The actor's private state. Owned exclusively by the worker thread
/// that runs [`ActorState::handle`]; nothing outside this module ever
/// touches it directly, so there is no lock to take.
struct ActorState {
    known_streams: HashSet<i64>,
    receivers: HashMap<i64, ReceiverState>,
    queues: HashMap<i64, VecDeque<ReceivedBlockInfo>>,
    wal: Option<Arc<WalManager>>,
}

impl ActorState {
    fn handle(&mut self, msg: ReceiverTrackerMessage) -> ReceiverTrackerReply {
        match msg {
            ReceiverTrackerMessage::RegisterReceiver { stream_id, receiver_type, host } => {
                if !self.known_streams.contains(&stream_id) {
                    warn!(stream_id, "rejected registration for an unknown stream");
                    return ReceiverTrackerReply::Ack(false);
                }
                info!(stream_id, %receiver_type, %host, "receiver registered");
                self.receivers.insert(
                    stream_id,
                    ReceiverState { stream_id, receiver_type, host, active: true, last_error: None },
                );
                self.queues.entry(stream_id).or_default();
                ReceiverTrackerReply::Ack(true)
            }

            ReceiverTrackerMessage::AddBlock(info) => {
                let stream_id = info.stream_id;
                let registered_active = self.receivers.get(&stream_id).map(|r| r.active).unwrap_or(false);
                if !registered_active {
                    warn!(stream_id, ?info.block_id, "rejected block from an unregistered or terminated receiver");
                    return ReceiverTrackerReply::Accepted(false);
                }

                if let Some(wal) = &self.wal {
                    let encoded = match bincode::serde::encode_to_vec(&info, bincode::config::standard()) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            error!(stream_id, error = %e, "failed to encode received block metadata");
                            return ReceiverTrackerReply::Accepted(false);
                        }
                    };
                    if let Err(e) = wal.write(&encoded) {
                        error!(stream_id, error = %e, "failed to durably log received block metadata");
                        return ReceiverTrackerReply::Accepted(false);
                    }
                }

                self.queues.entry(stream_id).or_default().push_back(info);
                ReceiverTrackerReply::Accepted(true)
            }

            ReceiverTrackerMessage::ReportError { stream_id, message, error: err } => {
                match self.receivers.get_mut(&stream_id) {
                    Some(r) => {
                        warn!(stream_id, %message, error = ?err, "receiver reported an error");
                        r.last_error = Some(match &err {
                            Some(e) => format!("{message}: {e}"),
                            None => message,
                        });
                    }
                    None => warn!(stream_id, %message, "error report for an unknown receiver"),
                }
                ReceiverTrackerReply::None
            }

            ReceiverTrackerMessage::DeregisterReceiver { stream_id, message, error: err } => {
                match self.receivers.get_mut(&stream_id) {
                    Some(r) if r.active => {
                        r.active = false;
                        r.last_error = Some(match &err {
                            Some(e) => format!("{message}: {e}"),
                            None => message,
                        });
                        info!(stream_id, "receiver deregistered");
                        ReceiverTrackerReply::Ack(true)
                    }
                    Some(_) => {
                        // Already Terminated: tolerated no-op.
                        ReceiverTrackerReply::Ack(true)
                    }
                    None => {
                        warn!(stream_id, "deregistration for an unknown receiver");
                        ReceiverTrackerReply::Ack(false)
                    }
                }
            }

            ReceiverTrackerMessage::GetReceivedBlockInfo { stream_id } => {
                let blocks = self.queues.get_mut(&stream_id).map(|q| q.drain(..).collect()).unwrap_or_default();
                ReceiverTrackerReply::Blocks(blocks)
            }

            ReceiverTrackerMessage::Stop => ReceiverTrackerReply::None,
        }
    }
}

/// Driver-side singleton that registers receivers, accepts the blocks
/// they report, and hands each input stream's queued blocks to the
/// streaming loop once per batch.
///
/// The actor runs on a dedicated thread driving its own single-threaded
/// Tokio runtime, so the tracker never competes with, or depends on,
/// whatever runtime (if any) its caller happens to be using.
pub struct ReceiverTracker {
    sender: mpsc::UnboundedSender<Envelope>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
    stop_signal: Arc<AtomicBool>,
    supervisors: std::sync::Mutex<Vec<(i64, JoinHandle<()>)>>,
}

impl ReceiverTracker {
    /// Constructs a tracker for exactly `known_streams`. If `wal` is
    /// `Some`, every previously accepted block still on disk is
    /// replayed into its stream's queue before this call returns, so
    /// the first batch after a restart sees work a crashed run had
    /// already accepted.
    pub fn new(known_streams: impl IntoIterator<Item = i64>, wal: Option<Arc<WalManager>>) -> Result<Arc<Self>> {
        let mut queues: HashMap<i64, VecDeque<ReceivedBlockInfo>> = HashMap::new();
        if let Some(wal) = &wal {
            for payload in wal.read_from_log()? {
                let payload = payload?;
                let (info, _): (ReceivedBlockInfo, usize) =
                    bincode::serde::decode_from_slice(&payload, bincode::config::standard())?;
                queues.entry(info.stream_id).or_default().push_back(info);
            }
        }

        let mut state = ActorState {
            known_streams: known_streams.into_iter().collect(),
            receivers: HashMap::new(),
            queues,
            wal,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let worker = thread::Builder::new()
            .name("receiver-tracker".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to start receiver tracker runtime");
                rt.block_on(async move {
                    while let Some((msg, reply)) = rx.recv().await {
                        let stop = matches!(msg, ReceiverTrackerMessage::Stop);
                        let result = state.handle(msg);
                        let _ = reply.send(result);
                        if stop {
                            break;
                        }
                    }
                });
            })
            .map_err(|e| CoreError::Receiver(format!("failed to spawn tracker actor thread: {e}")))?;

        Ok(Arc::new(Self {
            sender: tx,
            worker: std::sync::Mutex::new(Some(worker)),
            stopped: AtomicBool::new(false),
            stop_signal: Arc::new(AtomicBool::new(false)),
            supervisors: std::sync::Mutex::new(Vec::new()),
        }))
    }

    fn request(&self, msg: ReceiverTrackerMessage) -> Result<ReceiverTrackerReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send((msg, reply_tx))
            .map_err(|_| CoreError::Receiver("tracker actor has already stopped".into()))?;
        reply_rx
            .blocking_recv()
            .map_err(|_| CoreError::Receiver("tracker actor dropped the reply channel".into()))
    }

    pub fn register_receiver(&self, stream_id: i64, receiver_type: impl Into<String>, host: impl Into<String>) -> Result<bool> {
        match self.request(ReceiverTrackerMessage::RegisterReceiver {
            stream_id,
            receiver_type: receiver_type.into(),
            host: host.into(),
        })? {
            ReceiverTrackerReply::Ack(ok) => Ok(ok),
            _ => Err(CoreError::Programming("unexpected reply to RegisterReceiver".into())),
        }
    }

    pub fn add_block(&self, info: ReceivedBlockInfo) -> Result<bool> {
        match self.request(ReceiverTrackerMessage::AddBlock(info))? {
            ReceiverTrackerReply::Accepted(ok) => Ok(ok),
            _ => Err(CoreError::Programming("unexpected reply to AddBlock".into())),
        }
    }

    pub fn report_error(&self, stream_id: i64, message: impl Into<String>, error: Option<String>) -> Result<()> {
        self.request(ReceiverTrackerMessage::ReportError { stream_id, message: message.into(), error })?;
        Ok(())
    }

    pub fn deregister_receiver(&self, stream_id: i64, message: impl Into<String>, error: Option<String>) -> Result<bool> {
        match self.request(ReceiverTrackerMessage::DeregisterReceiver { stream_id, message: message.into(), error })? {
            ReceiverTrackerReply::Ack(ok) => Ok(ok),
            _ => Err(CoreError::Programming("unexpected reply to DeregisterReceiver".into())),
        }
    }

    /// Atomically drains and returns every block queued for
    /// `stream_id` since the last call. Called once per source per
    /// batch by the streaming loop.
    pub fn get_received_block_info(&self, stream_id: i64) -> Result<Vec<ReceivedBlockInfo>> {
        match self.request(ReceiverTrackerMessage::GetReceivedBlockInfo { stream_id })? {
            ReceiverTrackerReply::Blocks(blocks) => Ok(blocks),
            _ => Err(CoreError::Programming("unexpected reply to GetReceivedBlockInfo".into())),
        }
    }

    /// Registers a caller-spawned receiver supervisor thread so
    /// [`Self::stop`] can wait for it to exit. Scheduling which host
    /// runs which receiver is a cluster-scheduler concern out of scope
    /// here; this only tracks the resulting thread handle.
    pub fn track_supervisor(&self, stream_id: i64, handle: JoinHandle<()>) {
        self.supervisors.lock().expect("supervisors lock poisoned").push((stream_id, handle));
    }

    /// Shared flag supervisor closures should poll to know when to
    /// stop pulling from their upstream source.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        self.stop_signal.clone()
    }

    /// Idempotent. Signals every tracked supervisor to stop, waits up
    /// to [`STOP_JOIN_TIMEOUT`] total for them to exit (logging any
    /// straggler rather than blocking forever on it), then stops the
    /// actor itself.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_signal.store(true, Ordering::SeqCst);

        let supervisors = std::mem::take(&mut *self.supervisors.lock().expect("supervisors lock poisoned"));
        if !supervisors.is_empty() {
            let (done_tx, done_rx) = std_mpsc::channel::<i64>();
            let mut pending: HashSet<i64> = supervisors.iter().map(|(id, _)| *id).collect();
            for (stream_id, handle) in supervisors {
                let done_tx = done_tx.clone();
                thread::spawn(move || {
                    let _ = handle.join();
                    let _ = done_tx.send(stream_id);
                });
            }
            drop(done_tx);
            let deadline = Instant::now() + STOP_JOIN_TIMEOUT;
            while !pending.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match done_rx.recv_timeout(remaining) {
                    Ok(stream_id) => {
                        pending.remove(&stream_id);
                    }
                    Err(_) => break,
                }
            }
            for stream_id in pending {
                warn!(stream_id, "receiver supervisor did not stop within the grace period");
            }
        }

        let _ = self.request(ReceiverTrackerMessage::Stop);
        if let Some(worker) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = worker.join();
        }
        Ok(())
    }
}

impl Drop for ReceiverTracker {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            let _ = self.stop();
        }
    }
}
