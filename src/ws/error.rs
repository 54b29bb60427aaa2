//! WebSocket protocol related errors.
use std::io;

use thiserror::Error;

/// Websocket protocol errors.
///
/// Any of these force-closes the connection with close code 1002.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ProtocolError {
    /// Received an unmasked frame from client
    #[error("Received an unmasked frame from client")]
    UnmaskedFrame,
    /// Received a masked frame from server
    #[error("Received a masked frame from server")]
    MaskedFrame,
    /// Encountered invalid opcode
    #[error("Invalid opcode: {0}")]
    InvalidOpcode(u8),
    /// Invalid control frame length
    #[error("Invalid control frame length: {0}")]
    InvalidLength(usize),
    /// A payload reached size limit
    #[error("A payload reached size limit")]
    Overflow,
    /// Control frames must not be fragmented
    #[error("Control frames must not be fragmented")]
    FragmentedControlFrame,
    /// Continuation is not started
    #[error("Continuation is not started")]
    ContinuationNotStarted,
    /// Received new continuation but it is already started
    #[error("Received new continuation but it is already started")]
    ContinuationStarted,
}

/// Websocket session errors.
#[derive(Debug, Error)]
pub enum WsError {
    /// Ws protocol level error
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    /// Underlying stream failure
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Peer has been disconnected
    #[error("Peer has been disconnected")]
    Disconnected,
    /// Session is closed, no further sends are possible
    #[error("Session is closed")]
    Closed,
}
