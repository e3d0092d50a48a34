use bytes::Bytes;

use crate::core::model::{ByteRange, RequestId};
use crate::core::retry::FetchError;

/// Element of the funnel's output channel.
#[derive(Debug)]
pub enum BlockEvent {
    Data(Bytes),
    EndOfStream,
    Failure(FetchError),
}

/// Progress notifications, broadcast for display purposes only.
#[derive(Debug, Clone)]
pub enum FunnelEvent {
    BlockStarted { request_id: RequestId, index: u64, range: ByteRange },
    PieceProgress { request_id: RequestId, index: u64, bytes: u64 },
    BlockDone { request_id: RequestId, index: u64 },
    Finished { request_id: RequestId, ok: bool },
}
