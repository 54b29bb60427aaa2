//! Engine.IO / Socket.IO packet envelope.
//!
//! A textual packet is the concatenation of an engine event digit, for
//! message packets a socket event digit, an optional `<n>-` attachment
//! count prefix for binary events, an optional `/namespace,` prefix and
//! the payload text. Binary attachments travel out-of-band and are added
//! to the packet as they arrive.
use std::fmt;

use ntex_bytes::Bytes;

use super::error::PacketError;

/// Engine.IO packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    Open,
    Close,
    Ping,
    Pong,
    Message,
    Upgrade,
    Noop,
}

impl EngineEvent {
    pub fn from_digit(c: char) -> Option<EngineEvent> {
        Some(match c {
            '0' => EngineEvent::Open,
            '1' => EngineEvent::Close,
            '2' => EngineEvent::Ping,
            '3' => EngineEvent::Pong,
            '4' => EngineEvent::Message,
            '5' => EngineEvent::Upgrade,
            '6' => EngineEvent::Noop,
            _ => return None,
        })
    }

    pub fn digit(self) -> char {
        match self {
            EngineEvent::Open => '0',
            EngineEvent::Close => '1',
            EngineEvent::Ping => '2',
            EngineEvent::Pong => '3',
            EngineEvent::Message => '4',
            EngineEvent::Upgrade => '5',
            EngineEvent::Noop => '6',
        }
    }

    /// Raw value as used by the leading type byte of binary messages.
    pub fn type_byte(self) -> u8 {
        self.digit() as u8 - b'0'
    }
}

/// Socket.IO packet types, nested inside engine message packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketEvent {
    Connect,
    Disconnect,
    Event,
    Ack,
    Error,
    BinaryEvent,
    BinaryAck,
    /// Not a message packet, no socket event digit is present
    Unknown,
}

impl SocketEvent {
    pub fn from_digit(c: char) -> Option<SocketEvent> {
        Some(match c {
            '0' => SocketEvent::Connect,
            '1' => SocketEvent::Disconnect,
            '2' => SocketEvent::Event,
            '3' => SocketEvent::Ack,
            '4' => SocketEvent::Error,
            '5' => SocketEvent::BinaryEvent,
            '6' => SocketEvent::BinaryAck,
            _ => return None,
        })
    }

    pub fn digit(self) -> Option<char> {
        Some(match self {
            SocketEvent::Connect => '0',
            SocketEvent::Disconnect => '1',
            SocketEvent::Event => '2',
            SocketEvent::Ack => '3',
            SocketEvent::Error => '4',
            SocketEvent::BinaryEvent => '5',
            SocketEvent::BinaryAck => '6',
            SocketEvent::Unknown => return None,
        })
    }

    pub fn is_binary(self) -> bool {
        matches!(self, SocketEvent::BinaryEvent | SocketEvent::BinaryAck)
    }
}

/// One Socket.IO packet with its (possibly still incomplete) attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub engine_event: EngineEvent,
    pub socket_event: SocketEvent,
    pub namespace: String,
    pub payload: String,
    pub attachment_count: usize,
    attachments: Vec<Bytes>,
}

impl Packet {
    pub fn new(
        engine_event: EngineEvent,
        socket_event: SocketEvent,
        namespace: impl Into<String>,
        payload: impl Into<String>,
    ) -> Packet {
        Packet {
            engine_event,
            socket_event,
            namespace: namespace.into(),
            payload: payload.into(),
            attachment_count: 0,
            attachments: Vec::new(),
        }
    }

    /// Decode the textual packet envelope.
    pub fn decode(data: &str) -> Result<Packet, PacketError> {
        let mut chars = data.char_indices();

        let (_, engine_digit) = chars.next().ok_or(PacketError::Empty)?;
        let engine_event = EngineEvent::from_digit(engine_digit)
            .ok_or(PacketError::InvalidEngineType(engine_digit))?;

        if engine_event != EngineEvent::Message {
            // the whole remainder is the payload
            return Ok(Packet::new(
                engine_event,
                SocketEvent::Unknown,
                "/",
                &data[1..],
            ));
        }

        let (_, socket_digit) = chars
            .next()
            .ok_or(PacketError::InvalidSocketType('\0'))?;
        let socket_event = SocketEvent::from_digit(socket_digit)
            .ok_or(PacketError::InvalidSocketType(socket_digit))?;

        let mut rest = &data[2..];

        // binary events carry an `<n>-` attachment count prefix
        let attachment_count = if socket_event.is_binary() {
            let dash = rest
                .find('-')
                .ok_or_else(|| PacketError::InvalidAttachmentCount(rest.into()))?;
            let count = rest[..dash]
                .parse::<usize>()
                .map_err(|_| PacketError::InvalidAttachmentCount(rest[..dash].into()))?;
            rest = &rest[dash + 1..];
            count
        } else {
            0
        };

        let namespace = if rest.starts_with('/') {
            match rest.find(',') {
                Some(comma) => {
                    let nsp = rest[..comma].to_owned();
                    rest = &rest[comma + 1..];
                    nsp
                }
                None => {
                    let nsp = rest.to_owned();
                    rest = "";
                    nsp
                }
            }
        } else {
            "/".to_owned()
        };

        Ok(Packet {
            engine_event,
            socket_event,
            namespace,
            payload: rest.to_owned(),
            attachment_count,
            attachments: Vec::new(),
        })
    }

    /// Encode the textual packet envelope, the inverse of [`decode`].
    ///
    /// [`decode`]: Packet::decode
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.payload.len() + self.namespace.len() + 8);
        out.push(self.engine_event.digit());
        if let Some(digit) = self.socket_event.digit() {
            out.push(digit);
        }
        if self.socket_event.is_binary() {
            out.push_str(&self.attachment_count.to_string());
            out.push('-');
        }
        if self.namespace != "/" {
            out.push_str(&self.namespace);
            out.push(',');
        }
        out.push_str(&self.payload);
        out
    }

    pub fn attachments(&self) -> &[Bytes] {
        &self.attachments
    }

    /// True once every declared attachment has arrived.
    pub fn has_all_attachments(&self) -> bool {
        self.attachments.len() >= self.attachment_count
    }

    /// Append an out-of-band binary buffer received from the server.
    ///
    /// Attachments carried in websocket binary messages keep a leading
    /// engine type byte which has to be stripped; base64 polling segments
    /// arrive without it.
    pub fn add_attachment_from_server(&mut self, data: Bytes, strip_type_byte: bool) {
        let data = if strip_type_byte && !data.is_empty() {
            data.slice(1..)
        } else {
            data
        };
        self.attachments.push(data);
    }

    /// Attach an outgoing binary buffer, keeping the declared count in
    /// sync.
    pub fn add_attachment(&mut self, data: Bytes) {
        self.attachments.push(data);
        self.attachment_count = self.attachments.len();
    }

    /// Build a packet from a standalone binary polling segment: a leading
    /// engine type byte followed by the binary payload.
    pub fn from_binary(data: Bytes) -> Result<Packet, PacketError> {
        let first = *data.first().ok_or(PacketError::Empty)?;
        // the type byte may be raw (0..=6) or its ascii digit
        let digit = if first <= 6 {
            (first + b'0') as char
        } else {
            first as char
        };
        let engine_event =
            EngineEvent::from_digit(digit).ok_or(PacketError::InvalidEngineType(digit))?;
        let mut packet = Packet::new(engine_event, SocketEvent::Unknown, "/", "");
        packet.attachment_count = 1;
        packet.attachments.push(data.slice(1..));
        Ok(packet)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} nsp={} attachments={}/{} payload={:?}",
            self.engine_event,
            self.socket_event,
            self.namespace,
            self.attachments.len(),
            self.attachment_count,
            self.payload
        )
    }
}
