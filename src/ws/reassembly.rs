//! Reassembly of fragmented messages.
use log::trace;
use ntex_bytes::{ByteString, Bytes, BytesMut};

use super::codec::{Frame, Item, Message};
use super::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Text,
    Binary,
}

/// Buffers non-final fragments and reconstructs the logical message.
///
/// Fragment payloads are collected in arrival order; the buffer is cleared
/// on successful assembly and on protocol error. A control frame received
/// while fragments are pending is treated as a protocol violation, as is a
/// continuation frame with no pending fragments.
#[derive(Debug, Default)]
pub struct Reassembler {
    kind: Option<Kind>,
    buf: BytesMut,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    /// Returns true if non-final fragments are buffered.
    pub fn is_pending(&self) -> bool {
        self.kind.is_some()
    }

    /// Drop any pending fragments.
    pub fn clear(&mut self) {
        self.kind = None;
        self.buf.clear();
    }

    /// Feed one decoded frame.
    ///
    /// Returns the completed message once the final frame of a fragmented
    /// message (or any unfragmented message) arrives, `None` while
    /// fragments are still outstanding.
    pub fn push(&mut self, frame: Frame) -> Result<Option<Message>, ProtocolError> {
        match frame {
            Frame::Continuation(item) => self.push_fragment(item),
            Frame::Text(data) => Ok(Some(Message::Text(lossy_utf8(data)))),
            Frame::Binary(data) => Ok(Some(Message::Binary(data))),
            Frame::Ping(data) => {
                self.reject_control_mid_message()?;
                Ok(Some(Message::Ping(data)))
            }
            Frame::Pong(data) => {
                self.reject_control_mid_message()?;
                Ok(Some(Message::Pong(data)))
            }
            Frame::Close(reason) => {
                self.reject_control_mid_message()?;
                Ok(Some(Message::Close(reason)))
            }
        }
    }

    // control frames must not participate in a fragmented message
    fn reject_control_mid_message(&mut self) -> Result<(), ProtocolError> {
        if self.is_pending() {
            self.clear();
            Err(ProtocolError::FragmentedControlFrame)
        } else {
            Ok(())
        }
    }

    fn push_fragment(&mut self, item: Item) -> Result<Option<Message>, ProtocolError> {
        match item {
            Item::FirstText(data) => {
                if self.is_pending() {
                    self.clear();
                    return Err(ProtocolError::ContinuationStarted);
                }
                self.kind = Some(Kind::Text);
                self.buf.extend_from_slice(&data);
                Ok(None)
            }
            Item::FirstBinary(data) => {
                if self.is_pending() {
                    self.clear();
                    return Err(ProtocolError::ContinuationStarted);
                }
                self.kind = Some(Kind::Binary);
                self.buf.extend_from_slice(&data);
                Ok(None)
            }
            Item::Continue(data) => {
                if !self.is_pending() {
                    return Err(ProtocolError::ContinuationNotStarted);
                }
                self.buf.extend_from_slice(&data);
                Ok(None)
            }
            Item::Last(data) => {
                let Some(kind) = self.kind.take() else {
                    return Err(ProtocolError::ContinuationNotStarted);
                };
                self.buf.extend_from_slice(&data);
                let payload = self.buf.split().freeze();
                trace!("Reassembled {kind:?} message of {} bytes", payload.len());
                Ok(Some(match kind {
                    Kind::Text => Message::Text(lossy_utf8(payload)),
                    Kind::Binary => Message::Binary(payload),
                }))
            }
        }
    }
}

// text payloads are decoded leniently, invalid sequences are replaced
fn lossy_utf8(data: Bytes) -> ByteString {
    match ByteString::try_from(data.clone()) {
        Ok(text) => text,
        Err(_) => ByteString::from(String::from_utf8_lossy(&data).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn fragments_reassemble_in_order() {
        let mut asm = Reassembler::new();

        assert!(asm
            .push(Frame::Continuation(Item::FirstBinary(bytes("A"))))
            .unwrap()
            .is_none());
        assert!(asm.is_pending());
        assert!(asm
            .push(Frame::Continuation(Item::Continue(bytes("B"))))
            .unwrap()
            .is_none());
        let msg = asm
            .push(Frame::Continuation(Item::Last(bytes("C"))))
            .unwrap()
            .unwrap();

        assert_eq!(msg, Message::Binary(bytes("ABC")));
        assert!(!asm.is_pending());
    }

    #[test]
    fn text_fragments_keep_text_type() {
        let mut asm = Reassembler::new();

        asm.push(Frame::Continuation(Item::FirstText(bytes("hel"))))
            .unwrap();
        let msg = asm
            .push(Frame::Continuation(Item::Last(bytes("lo"))))
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Text(ByteString::from("hello")));
    }

    #[test]
    fn control_frame_between_fragments() {
        let mut asm = Reassembler::new();

        asm.push(Frame::Continuation(Item::FirstBinary(bytes("A"))))
            .unwrap();
        assert_eq!(
            asm.push(Frame::Ping(bytes("x"))).unwrap_err(),
            ProtocolError::FragmentedControlFrame
        );
        // the pending buffer is cleared on protocol error
        assert!(!asm.is_pending());
    }

    #[test]
    fn continuation_without_start() {
        let mut asm = Reassembler::new();
        assert_eq!(
            asm.push(Frame::Continuation(Item::Continue(bytes("B"))))
                .unwrap_err(),
            ProtocolError::ContinuationNotStarted
        );
        assert_eq!(
            asm.push(Frame::Continuation(Item::Last(bytes("C"))))
                .unwrap_err(),
            ProtocolError::ContinuationNotStarted
        );
    }

    #[test]
    fn unfragmented_messages_pass_through() {
        let mut asm = Reassembler::new();
        assert_eq!(
            asm.push(Frame::Text(bytes("hi"))).unwrap().unwrap(),
            Message::Text(ByteString::from("hi"))
        );
        assert_eq!(
            asm.push(Frame::Ping(bytes("p"))).unwrap().unwrap(),
            Message::Ping(bytes("p"))
        );
        assert_eq!(
            asm.push(Frame::Close(None)).unwrap().unwrap(),
            Message::Close(None)
        );
    }

    #[test]
    fn reusable_after_completion() {
        let mut asm = Reassembler::new();
        asm.push(Frame::Continuation(Item::FirstBinary(bytes("1"))))
            .unwrap();
        asm.push(Frame::Continuation(Item::Last(bytes("2"))))
            .unwrap();

        asm.push(Frame::Continuation(Item::FirstText(bytes("3"))))
            .unwrap();
        let msg = asm
            .push(Frame::Continuation(Item::Last(bytes("4"))))
            .unwrap()
            .unwrap();
        assert_eq!(msg, Message::Text(ByteString::from("34")));
    }
}
