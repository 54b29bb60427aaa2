use std::cell::Cell;

use ntex_bytes::{ByteString, Bytes, BytesMut};
use ntex_codec::{Decoder, Encoder};

use super::error::ProtocolError;
use super::frame::Parser;
use super::proto::{CloseReason, OpCode};

/// WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message
    Text(ByteString),
    /// Binary message
    Binary(Bytes),
    /// Continuation
    Continuation(Item),
    /// Ping message
    Ping(Bytes),
    /// Pong message
    Pong(Bytes),
    /// Close message with optional reason
    Close(Option<CloseReason>),
}

/// WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text frame, codec does not verify utf8 encoding
    Text(Bytes),
    /// Binary frame
    Binary(Bytes),
    /// Continuation
    Continuation(Item),
    /// Ping message
    Ping(Bytes),
    /// Pong message
    Pong(Bytes),
    /// Close message with optional reason
    Close(Option<CloseReason>),
}

/// WebSocket continuation item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    FirstText(Bytes),
    FirstBinary(Bytes),
    Continue(Bytes),
    Last(Bytes),
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct Flags: u8 {
        const SERVER         = 0b0000_0001;
        const R_CONTINUATION = 0b0000_0010;
        const W_CONTINUATION = 0b0000_0100;
        const CLOSED         = 0b0000_1000;
    }
}

/// WebSocket protocol codec.
///
/// The codec tracks read and write continuation state and whether a close
/// frame has been written. It defaults to server mode; the client side of
/// a connection must call `client_mode()` so outgoing frames are masked
/// and masked incoming frames are rejected.
#[derive(Debug, Clone)]
pub struct Codec {
    flags: Cell<Flags>,
    max_size: usize,
}

impl Codec {
    /// Create new websocket frames codec.
    pub fn new() -> Codec {
        Codec {
            max_size: 65_536,
            flags: Cell::new(Flags::SERVER),
        }
    }

    /// Set max frame size.
    ///
    /// By default max size is set to 64kb.
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set codec to client mode.
    ///
    /// By default codec works in server mode.
    pub fn client_mode(self) -> Self {
        self.remove_flags(Flags::SERVER);
        self
    }

    /// Check if codec encoded a `Close` message.
    pub fn is_closed(&self) -> bool {
        self.flags.get().contains(Flags::CLOSED)
    }

    fn is_server(&self) -> bool {
        self.flags.get().contains(Flags::SERVER)
    }

    fn mask_outgoing(&self) -> bool {
        !self.is_server()
    }

    fn insert_flags(&self, f: Flags) {
        let mut flags = self.flags.get();
        flags.insert(f);
        self.flags.set(flags);
    }

    fn remove_flags(&self, f: Flags) {
        let mut flags = self.flags.get();
        flags.remove(f);
        self.flags.set(flags);
    }

    fn encode_continuation(&self, item: Item, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let mask = self.mask_outgoing();
        match item {
            Item::FirstText(data) => {
                if self.flags.get().contains(Flags::W_CONTINUATION) {
                    return Err(ProtocolError::ContinuationStarted);
                }
                self.insert_flags(Flags::W_CONTINUATION);
                Parser::write_message(dst, &data[..], OpCode::Text, false, mask);
            }
            Item::FirstBinary(data) => {
                if self.flags.get().contains(Flags::W_CONTINUATION) {
                    return Err(ProtocolError::ContinuationStarted);
                }
                self.insert_flags(Flags::W_CONTINUATION);
                Parser::write_message(dst, &data[..], OpCode::Binary, false, mask);
            }
            Item::Continue(data) => {
                if !self.flags.get().contains(Flags::W_CONTINUATION) {
                    return Err(ProtocolError::ContinuationNotStarted);
                }
                Parser::write_message(dst, &data[..], OpCode::Continue, false, mask);
            }
            Item::Last(data) => {
                if !self.flags.get().contains(Flags::W_CONTINUATION) {
                    return Err(ProtocolError::ContinuationNotStarted);
                }
                self.remove_flags(Flags::W_CONTINUATION);
                Parser::write_message(dst, &data[..], OpCode::Continue, true, mask);
            }
        }
        Ok(())
    }

    fn decoded(
        &self,
        finished: bool,
        opcode: OpCode,
        payload: Option<BytesMut>,
    ) -> Result<Frame, ProtocolError> {
        let payload = payload.map(BytesMut::freeze).unwrap_or_else(Bytes::new);

        if !finished {
            // a non-final data frame starts or continues a fragmented message
            return match opcode {
                OpCode::Continue => {
                    if self.flags.get().contains(Flags::R_CONTINUATION) {
                        Ok(Frame::Continuation(Item::Continue(payload)))
                    } else {
                        Err(ProtocolError::ContinuationNotStarted)
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.flags.get().contains(Flags::R_CONTINUATION) {
                        Err(ProtocolError::ContinuationStarted)
                    } else {
                        self.insert_flags(Flags::R_CONTINUATION);
                        if opcode == OpCode::Text {
                            Ok(Frame::Continuation(Item::FirstText(payload)))
                        } else {
                            Ok(Frame::Continuation(Item::FirstBinary(payload)))
                        }
                    }
                }
                // the frame parser rejects non-final control frames
                _ => Err(ProtocolError::FragmentedControlFrame),
            };
        }

        match opcode {
            OpCode::Continue => {
                if self.flags.get().contains(Flags::R_CONTINUATION) {
                    self.remove_flags(Flags::R_CONTINUATION);
                    Ok(Frame::Continuation(Item::Last(payload)))
                } else {
                    Err(ProtocolError::ContinuationNotStarted)
                }
            }
            OpCode::Text => Ok(Frame::Text(payload)),
            OpCode::Binary => Ok(Frame::Binary(payload)),
            OpCode::Ping => Ok(Frame::Ping(payload)),
            OpCode::Pong => Ok(Frame::Pong(payload)),
            OpCode::Close => {
                let reason = Parser::parse_close_payload(&payload);
                Ok(Frame::Close(reason))
            }
            OpCode::Bad => Err(ProtocolError::InvalidOpcode(u8::from(OpCode::Bad))),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for Codec {
    type Item = Message;
    type Error = ProtocolError;

    fn encode(&self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mask = self.mask_outgoing();
        match item {
            Message::Text(txt) => {
                Parser::write_message(dst, txt.as_ref(), OpCode::Text, true, mask)
            }
            Message::Binary(bin) => Parser::write_message(dst, bin, OpCode::Binary, true, mask),
            Message::Ping(txt) => Parser::write_message(dst, txt, OpCode::Ping, true, mask),
            Message::Pong(txt) => Parser::write_message(dst, txt, OpCode::Pong, true, mask),
            Message::Close(reason) => {
                self.insert_flags(Flags::CLOSED);
                Parser::write_close(dst, reason, mask);
            }
            Message::Continuation(cont) => self.encode_continuation(cont, dst)?,
        }
        Ok(())
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match Parser::parse(src, self.is_server(), self.max_size)? {
            Some((finished, opcode, payload)) => {
                self.decoded(finished, opcode, payload).map(Some)
            }
            None => Ok(None),
        }
    }
}
