//! Socket.IO client: handshake, transports and the connection manager.
mod error;
mod handshake;
mod manager;
mod options;
mod packet;
mod payload;
mod polling;
mod transport;
mod websocket;

pub use self::error::{Error, PacketError, TransportError};
pub use self::handshake::HandshakeInfo;
pub use self::manager::{ManagerState, ReconnectionState, SocketManager};
pub use self::options::ClientOptions;
pub use self::packet::{EngineEvent, Packet, SocketEvent};
pub use self::payload::{decode_payload, encode_payload, Segment};
pub use self::polling::PollingTransport;
pub use self::transport::{
    Notice, Transport, TransportCtx, TransportKind, TransportState, PROTOCOL_VERSION,
};
pub use self::websocket::WebSocketTransport;
