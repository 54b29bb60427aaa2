//! Client-side real-time transport stack: an RFC 6455 websocket frame
//! engine and an Engine.IO/Socket.IO transport negotiation layer.
//!
//! The [`ws`] module provides the frame codec, fragment reassembly and a
//! session state machine over an upgraded duplex stream. The [`sio`]
//! module layers the Socket.IO client on top: handshake, long-polling
//! transport, the upgrade-to-websocket probe and reconnection backoff.
//!
//! The actual http client is an external collaborator behind the
//! [`http::HttpDispatcher`] and [`http::WsConnector`] traits.
//!
//! ```ignore
//! use std::time::Instant;
//! use sockio::{ClientOptions, ConnectionRegistry, SocketManager};
//!
//! let mut registry = ConnectionRegistry::new();
//! let mut manager = SocketManager::new(
//!     "https://example.com/socket.io/",
//!     ClientOptions::default(),
//!     http_dispatcher,
//!     ws_connector,
//! );
//! manager.on_packet(|packet| println!("{packet}"));
//! manager.connect();
//! let handle = registry.insert(manager);
//!
//! loop {
//!     registry.tick_all(Instant::now());
//!     // run the rest of the application cycle
//! }
//! ```
#![deny(rust_2018_idioms, unreachable_pub)]

pub mod http;
pub mod registry;
pub mod sio;
pub mod testing;
pub mod ws;

pub use self::registry::{ConnectionHandle, ConnectionRegistry};
pub use self::sio::{ClientOptions, Error, ManagerState, Packet, SocketManager};
