//! Socket.IO client error types.
use thiserror::Error;

use crate::http::ConnectError;
use crate::ws::{ProtocolError, WsError};

/// Packet and payload envelope decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Empty packet")]
    Empty,
    #[error("Invalid engine packet type: {0:?}")]
    InvalidEngineType(char),
    #[error("Invalid socket packet type: {0:?}")]
    InvalidSocketType(char),
    #[error("Invalid attachment count prefix: {0:?}")]
    InvalidAttachmentCount(String),
    #[error("Invalid payload segment: {0}")]
    InvalidSegment(String),
    #[error("Invalid base64 segment: {0}")]
    InvalidBase64(String),
}

/// Transport level failures, feeding the reconnection policy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request finished but the server answered with a failure status
    #[error("Server sent an error. Status code: {status} Message: {message}")]
    BadStatus { status: u16, message: String },
    /// The request failed before a response arrived
    #[error("Request error: {0}")]
    Request(String),
    /// The request was aborted locally; terminal, never retried
    #[error("Request aborted")]
    Aborted,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Request timed out")]
    TimedOut,
    /// The websocket upgrade handshake failed
    #[error("Websocket connect failed: {0}")]
    Connect(#[from] ConnectError),
    /// A failure on the open websocket stream
    #[error("Websocket error: {0}")]
    Ws(#[from] WsError),
    /// A send or poll was attempted while one is still outstanding
    #[error("A request is already in progress")]
    Concurrency,
    #[error("Transport is not open")]
    NotOpen,
}

impl TransportError {
    /// Aborts are terminal for the connection instance; everything else
    /// goes through the reconnection policy.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportError::Aborted)
    }
}

/// Errors surfaced through the manager's error callback.
#[derive(Debug, Error)]
pub enum Error {
    /// Wire protocol violation; the connection is force-closed with close
    /// code 1002 and reconnection may follow
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// Packet encode/decode fault; the dispatch loop keeps running
    #[error("Internal error: {0}")]
    Internal(#[from] PacketError),
    /// The initial handshake failed; reported directly, no reconnection
    #[error("Handshake failed: {0}")]
    Handshake(String),
    /// All reconnection attempts were used up
    #[error("Reconnection attempts exhausted")]
    ReconnectFailed,
}
