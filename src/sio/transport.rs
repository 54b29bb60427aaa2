//! Transport abstraction shared by the polling and websocket channels.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::http::{HttpDispatcher, WsConnector};

use super::error::{PacketError, TransportError};
use super::options::ClientOptions;
use super::packet::Packet;

/// Engine.IO protocol version sent in the query string.
pub const PROTOCOL_VERSION: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Opening,
    Connecting,
    Open,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Polling,
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Polling => f.write_str("polling"),
            TransportKind::WebSocket => f.write_str("websocket"),
        }
    }
}

/// Events a transport reports to the manager's pump.
#[derive(Debug)]
pub enum Notice {
    /// A fully received packet, all attachments present
    Packet(Packet),
    /// The transport reached the Open state
    Connected(TransportKind),
    /// A transport level failure, feeds the reconnection policy
    Error(TransportKind, TransportError),
    /// The underlying channel closed
    Closed(TransportKind),
    /// A packet or payload failed to decode; the loop keeps running
    DecodeError(TransportKind, PacketError),
}

/// Shared context handed to each transport: the http collaborators, the
/// negotiated endpoint and the per-manager request counter.
#[derive(Clone)]
pub struct TransportCtx {
    pub http: Arc<dyn HttpDispatcher>,
    pub ws: Arc<dyn WsConnector>,
    /// Base http(s) uri of the socket.io endpoint
    pub url: String,
    /// Session id from the handshake
    pub sid: String,
    pub options: Arc<ClientOptions>,
    /// Monotonically increasing request counter shared with the manager
    pub counter: Arc<AtomicU64>,
}

impl TransportCtx {
    fn extra_params(&self) -> String {
        if self.options.query_params_only_for_handshake {
            String::new()
        } else {
            self.options.build_query_params()
        }
    }

    /// Uri for one polling request, with a fresh timestamp-counter pair.
    pub fn polling_uri(&self) -> String {
        format!(
            "{}?EIO={}&transport=polling&t={}-{}&sid={}{}&b64=true",
            self.url,
            PROTOCOL_VERSION,
            timestamp_millis(),
            self.counter.fetch_add(1, Ordering::Relaxed),
            self.sid,
            self.extra_params(),
        )
    }

    /// Uri for the websocket upgrade, scheme swapped to ws/wss.
    pub fn websocket_uri(&self) -> String {
        let base = if let Some(rest) = self.url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.url.clone()
        };
        format!(
            "{}?EIO={}&transport=websocket&sid={}{}",
            base,
            PROTOCOL_VERSION,
            self.sid,
            self.extra_params(),
        )
    }
}

impl fmt::Debug for TransportCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCtx")
            .field("url", &self.url)
            .field("sid", &self.sid)
            .finish()
    }
}

/// Milliseconds since the unix epoch, used for cache busting in request
/// uris.
pub(crate) fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// Uniform send/open/close/poll contract over the two channels.
pub trait Transport {
    fn kind(&self) -> TransportKind;
    fn state(&self) -> TransportState;
    /// Start opening the channel; completion arrives as a [`Notice`].
    fn open(&mut self) -> Result<(), TransportError>;
    fn close(&mut self);
    /// Stop delivering while an upgrade is in progress.
    fn pause(&mut self);
    /// Send a batch of packets.
    fn send(&mut self, packets: Vec<Packet>) -> Result<(), TransportError>;
    /// Issue a poll cycle where the channel needs one.
    fn poll(&mut self) -> Result<(), TransportError>;
    /// Drive the transport from the manager's pump.
    fn tick(&mut self, now: Instant);
}
