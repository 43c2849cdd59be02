//! The stream processor
//!
//! One stream processor runs per partition replica. In `Replay` mode it
//! follows the committed log and applies events to the state store. In
//! `Processing` mode (leader only) it first replays everything written by
//! previous leaders, then processes commands one at a time: it computes the
//! follow-up records, appends them, and commits the state transaction only
//! once the append succeeded.

mod processor;

pub use self::processor::{
    Phase, ProcessorMessage, ProcessorPositions, StreamProcessor, StreamProcessorConfig, StreamProcessorDeps,
    StreamProcessorHandle, StreamProcessorMode,
};

use crate::protocol::Record;

/// Receives the answers for client commands.
pub trait ResponseSink: Send + Sync {
    fn respond(&self, request_stream_id: i32, request_id: i64, response: Record);
}

/// Drops every response; used where no client can be waiting.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoResponses;

impl ResponseSink for NoResponses {
    fn respond(&self, _request_stream_id: i32, _request_id: i64, _response: Record) {}
}
