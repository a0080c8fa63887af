//! Receiver Tracker (component E).
//!
//! Driver-side singleton coordinating distributed receivers through a
//! tagged-message protocol: dynamic dispatch over untyped messages
//! becomes a tagged variant `ReceiverTrackerMessage` and a single
//! handler with exhaustive case analysis. The actor's state (`known
//! streams`, per-receiver registration, per-stream block queues) is
//! owned exclusively by one task, serialized by its inbox.

mod messages;
mod tracker;

pub use messages::{ReceivedBlockInfo, ReceiverState, ReceiverTrackerMessage, ReceiverTrackerReply};
pub use tracker::ReceiverTracker;
