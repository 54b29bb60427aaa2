//! Low level websocket frame reader and writer.
use log::debug;
use nanorand::{Rng, WyRand};
use ntex_bytes::{BufMut, BytesMut};

use super::error::ProtocolError;
use super::mask::apply_mask;
use super::proto::{CloseCode, CloseReason, OpCode};

/// A struct representing a websocket frame.
#[derive(Debug)]
pub struct Parser;

impl Parser {
    fn parse_metadata(
        src: &[u8],
        server: bool,
        max_size: usize,
    ) -> Result<Option<(usize, bool, OpCode, usize, Option<[u8; 4]>)>, ProtocolError> {
        let chunk_len = src.len();

        let mut idx = 2;
        if chunk_len < 2 {
            return Ok(None);
        }
        let first = src[0];
        let second = src[1];
        let finished = first & 0x80 != 0;

        // check masking. a server must not mask any frames it sends to
        // the client, and a client must mask all frames it sends.
        let masked = second & 0x80 != 0;
        if !masked && server {
            return Err(ProtocolError::UnmaskedFrame);
        } else if masked && !server {
            return Err(ProtocolError::MaskedFrame);
        }

        // opcode
        let opcode = OpCode::from(first & 0x0F);
        if let OpCode::Bad = opcode {
            return Err(ProtocolError::InvalidOpcode(first & 0x0F));
        }

        let len = second & 0x7F;
        let length = if len == 126 {
            if chunk_len < 4 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([src[2], src[3]]) as usize;
            idx = 4;
            len
        } else if len == 127 {
            if chunk_len < 10 {
                return Ok(None);
            }
            let len = u64::from_be_bytes([
                src[2], src[3], src[4], src[5], src[6], src[7], src[8], src[9],
            ]);
            if len > usize::MAX as u64 {
                return Err(ProtocolError::Overflow);
            }
            idx = 10;
            len as usize
        } else {
            len as usize
        };

        // check the declared length against the max allowed size before
        // any of the payload is buffered
        if length > max_size {
            debug!("Rejecting frame exceeding the size limit ({length} > {max_size})");
            return Err(ProtocolError::Overflow);
        }

        // control frames must have a payload of 125 bytes or less and
        // must not be fragmented
        if opcode.is_control() {
            if length > 125 {
                return Err(ProtocolError::InvalidLength(length));
            }
            if !finished {
                return Err(ProtocolError::FragmentedControlFrame);
            }
        }

        let mask = if server {
            if chunk_len < idx + 4 {
                return Ok(None);
            }
            let mask = [src[idx], src[idx + 1], src[idx + 2], src[idx + 3]];
            idx += 4;
            Some(mask)
        } else {
            None
        };

        Ok(Some((idx, finished, opcode, length, mask)))
    }

    /// Parse the input stream into a frame.
    ///
    /// Returns the frame's fin flag, opcode and unmasked payload, or
    /// `None` if `src` does not yet hold a complete frame. Consumed bytes
    /// are removed from `src`.
    pub fn parse(
        src: &mut BytesMut,
        server: bool,
        max_size: usize,
    ) -> Result<Option<(bool, OpCode, Option<BytesMut>)>, ProtocolError> {
        // try to parse ws frame metadata
        let (idx, finished, opcode, length, mask) =
            match Parser::parse_metadata(src, server, max_size)? {
                None => return Ok(None),
                Some(res) => res,
            };

        // not enough data
        if src.len() < idx + length {
            return Ok(None);
        }

        // remove the frame header
        let _ = src.split_to(idx);

        // no need for body
        if length == 0 {
            return Ok(Some((finished, opcode, None)));
        }

        let mut data = src.split_to(length);

        // unmask
        if let Some(mask) = mask {
            apply_mask(&mut data, mask);
        }

        Ok(Some((finished, opcode, Some(data))))
    }

    /// Parse the payload of a close frame.
    pub fn parse_close_payload(payload: &[u8]) -> Option<CloseReason> {
        if payload.len() >= 2 {
            let raw_code = u16::from_be_bytes([payload[0], payload[1]]);
            let code = CloseCode::from(raw_code);
            let description = if payload.len() > 2 {
                Some(String::from_utf8_lossy(&payload[2..]).into())
            } else {
                None
            };
            Some(CloseReason { code, description })
        } else {
            None
        }
    }

    /// Generate the header and write the payload of a websocket frame.
    ///
    /// Client frames are masked with a fresh random key, server frames are
    /// written as is.
    pub fn write_message<B: AsRef<[u8]>>(
        dst: &mut BytesMut,
        pl: B,
        op: OpCode,
        fin: bool,
        mask: bool,
    ) {
        let payload = pl.as_ref();
        let one: u8 = if fin {
            0x80 | u8::from(op)
        } else {
            u8::from(op)
        };
        let payload_len = payload.len();
        let (two, p_len) = if mask {
            (0x80, payload_len + 4)
        } else {
            (0, payload_len)
        };

        if payload_len < 126 {
            dst.reserve(p_len + 2);
            dst.put_slice(&[one, two | payload_len as u8]);
        } else if payload_len <= 65_535 {
            dst.reserve(p_len + 4);
            dst.put_slice(&[one, two | 126]);
            dst.put_u16(payload_len as u16);
        } else {
            dst.reserve(p_len + 10);
            dst.put_slice(&[one, two | 127]);
            dst.put_u64(payload_len as u64);
        }

        if mask {
            let mut mask_key = [0u8; 4];
            WyRand::new().fill(&mut mask_key);
            dst.put_slice(&mask_key);

            let pos = dst.len();
            dst.put_slice(payload);
            apply_mask(&mut dst[pos..], mask_key);
        } else {
            dst.put_slice(payload);
        }
    }

    /// Create a websocket close frame.
    pub fn write_close(dst: &mut BytesMut, reason: Option<CloseReason>, mask: bool) {
        let payload = match reason {
            None => Vec::new(),
            Some(reason) => {
                let mut payload = u16::from(reason.code).to_be_bytes().to_vec();
                if let Some(description) = reason.description {
                    payload.extend_from_slice(description.as_bytes());
                }
                payload
            }
        };

        Parser::write_message(dst, payload, OpCode::Close, true, mask)
    }
}
