//! WebSocket (RFC 6455) client protocol support.
mod codec;
mod error;
pub mod frame;
mod mask;
pub mod proto;
mod reassembly;
mod session;

pub use self::codec::{Codec, Frame, Item, Message};
pub use self::error::{ProtocolError, WsError};
pub use self::proto::{CloseCode, CloseReason, OpCode};
pub use self::reassembly::Reassembler;
pub use self::session::{
    SessionConfig, SessionEvent, SessionState, WsSession, DEFAULT_MAX_FRAGMENT_SIZE,
};
