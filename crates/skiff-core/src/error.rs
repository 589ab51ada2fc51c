//! Error types for the skiff core.

use thiserror::Error;

use crate::state::Side;

/// Failure reported by a protocol engine while consuming input.
///
/// Always fatal to the connection that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Peer violated the protocol (bad header, malformed frame)
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Engine gave up on the connection for its own reasons
    #[error("engine aborted: {0}")]
    Aborted(String),
}

/// Illegal operation on a connector state machine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// Operation requires the read side to be open
    #[error("read side is {0:?}")]
    ReadNotOpen(Side),

    /// Operation requires the write side to be open
    #[error("write side is {0:?}")]
    WriteNotOpen(Side),
}
