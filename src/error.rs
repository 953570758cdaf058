//! Error types shared by the lock caches, the transports and the extent store.

use crate::extent::ExtentId;
use crate::protocol::{ClientId, LockId};

/// Failure of a single RPC. Never carries a `Retry` reply: that is a protocol
/// continuation, not an error.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("no endpoint for client {0}")]
    Unreachable(ClientId),

    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

/// Errors surfaced to application callers of the client lock cache.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock server unreachable: {0}")]
    Rpc(#[from] RpcError),

    #[error("lock {0} is not held by this client")]
    NotHeld(LockId),

    #[error("lock cache has been shut down")]
    ShutDown,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtentError {
    #[error("extent {0} does not exist")]
    NoEnt(ExtentId),

    #[error("extent store unreachable: {0}")]
    Rpc(#[from] RpcError),
}
