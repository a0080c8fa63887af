use serde::{Deserialize, Serialize};

use crate::block::BlockId;
use crate::wal::FileSegment;

/// Metadata the tracker records for one block handed off by a
/// receiver. The block's payload itself lives in the block store;
/// this is only the addressing and bookkeeping information the
/// streaming loop needs to build the next batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedBlockInfo {
    pub stream_id: i64,
    pub block_id: BlockId,
    pub num_records: u64,
    pub user_metadata: Option<Vec<u8>>,
    pub wal_segment: Option<FileSegment>,
}

/// Per-receiver bookkeeping the tracker keeps between registration and
/// termination. `Registered` and `Terminated` are the only two states;
/// there is no explicit enum because `active` already distinguishes
/// them and `last_error` is orthogonal to either.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverState {
    pub stream_id: i64,
    pub receiver_type: String,
    pub host: String,
    pub active: bool,
    pub last_error: Option<String>,
}

/// The tagged protocol the driver-side tracker accepts, replacing a
/// dynamic-dispatch-over-untyped-messages design. One variant per
/// message kind; the reply shape is carried by [`ReceiverTrackerReply`]
/// rather than by a message-specific return type, since all four (plus
/// the two query/control messages below) are handled by the same
/// serialized actor.
#[derive(Debug, Clone)]
pub enum ReceiverTrackerMessage {
    /// Replies `Ack(bool)`: `false` if `stream_id` is not one of the
    /// streams this tracker was constructed to expect.
    RegisterReceiver { stream_id: i64, receiver_type: String, host: String },
    /// Replies `Accepted(bool)`: `false` if the receiver isn't
    /// currently `Registered`, or if durable logging is enabled and the
    /// WAL append failed. In either case the block is not enqueued.
    AddBlock(ReceivedBlockInfo),
    /// Fire-and-forget; replies `None`. Unknown `stream_id` is logged
    /// and otherwise ignored.
    ReportError { stream_id: i64, message: String, error: Option<String> },
    /// Replies `Ack(bool)`. Idempotent: deregistering an already
    /// `Terminated` receiver is a tolerated no-op that still acks
    /// `true`. An unknown `stream_id` acks `false`.
    DeregisterReceiver { stream_id: i64, message: String, error: Option<String> },
    /// Replies `Blocks(Vec<ReceivedBlockInfo>)`: the full queue for
    /// `stream_id`, drained atomically so no block is ever handed to
    /// two batches.
    GetReceivedBlockInfo { stream_id: i64 },
    /// Replies `None`. Drains the actor loop; sent once by
    /// [`super::ReceiverTracker::stop`].
    Stop,
}

/// Reply shapes for [`ReceiverTrackerMessage`]. A flat enum rather than
/// one reply type per message keeps the actor's single channel
/// monomorphic.
#[derive(Debug, Clone)]
pub enum ReceiverTrackerReply {
    Ack(bool),
    Accepted(bool),
    Blocks(Vec<ReceivedBlockInfo>),
    None,
}
