//! Polling batch body codec.
//!
//! A polling response or post body is the concatenation of
//! `<decimal-byte-length>:<segment>` entries. A segment starting with `b4`
//! carries base64-encoded binary data, everything else is one textual
//! packet. The bare body `ok` is a no-op acknowledgment.
//!
//! Length prefixes are computed over bytes, not characters.
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ntex_bytes::{Bytes, BytesMut};

use super::error::PacketError;
use super::packet::Packet;

/// One decoded body segment.
#[derive(Debug, PartialEq, Eq)]
pub enum Segment {
    /// A textual packet, not yet parsed
    Text(String),
    /// Decoded binary data of a `b4` segment
    Binary(Bytes),
}

/// Encode a batch of packets into one polling post body.
///
/// Each packet contributes its textual envelope; its attachments follow as
/// `b4` base64 segments in order.
pub fn encode_payload(packets: &[Packet]) -> Bytes {
    let mut out = BytesMut::new();
    for packet in packets {
        push_segment(&mut out, packet.encode().as_bytes());
        for attachment in packet.attachments() {
            let mut segment = String::with_capacity(2 + attachment.len() * 4 / 3 + 4);
            segment.push_str("b4");
            BASE64.encode_string(attachment, &mut segment);
            push_segment(&mut out, segment.as_bytes());
        }
    }
    out.freeze()
}

fn push_segment(out: &mut BytesMut, data: &[u8]) {
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.extend_from_slice(b":");
    out.extend_from_slice(data);
}

/// Split a polling body into its segments.
///
/// Returns an empty vector for the `ok` acknowledgment body.
pub fn decode_payload(body: &[u8]) -> Result<Vec<Segment>, PacketError> {
    if body == b"ok" {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    let mut pos = 0;

    while pos < body.len() {
        let colon = body[pos..]
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| PacketError::InvalidSegment(preview(&body[pos..])))?;
        let length: usize = std::str::from_utf8(&body[pos..pos + colon])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PacketError::InvalidSegment(preview(&body[pos..])))?;

        let start = pos + colon + 1;
        let end = start + length;
        if end > body.len() {
            return Err(PacketError::InvalidSegment(preview(&body[pos..])));
        }
        let data = &body[start..end];

        if data.starts_with(b"b4") {
            let decoded = BASE64
                .decode(&data[2..])
                .map_err(|err| PacketError::InvalidBase64(err.to_string()))?;
            segments.push(Segment::Binary(Bytes::from(decoded)));
        } else {
            let text = std::str::from_utf8(data)
                .map_err(|_| PacketError::InvalidSegment(preview(data)))?;
            segments.push(Segment::Text(text.to_owned()));
        }
        pos = end;
    }

    Ok(segments)
}

fn preview(data: &[u8]) -> String {
    String::from_utf8_lossy(&data[..data.len().min(32)]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sio::packet::{EngineEvent, SocketEvent};

    #[test]
    fn decode_connect_body() {
        let segments = decode_payload(b"2:40").unwrap();
        assert_eq!(segments, vec![Segment::Text("40".into())]);

        let packet = Packet::decode("40").unwrap();
        assert_eq!(packet.engine_event, EngineEvent::Message);
        assert_eq!(packet.socket_event, SocketEvent::Connect);
        assert_eq!(packet.payload, "");
    }

    #[test]
    fn decode_multiple_segments() {
        let segments = decode_payload(b"2:401:613:42[\"hi\",\"yo\"]").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Text("40".into()),
                Segment::Text("6".into()),
                Segment::Text("42[\"hi\",\"yo\"]".into()),
            ]
        );
    }

    #[test]
    fn ok_body_is_noop() {
        assert!(decode_payload(b"ok").unwrap().is_empty());
    }

    #[test]
    fn binary_segment() {
        let encoded = BASE64.encode(b"\x01\x02\x03");
        let body = format!("{}:b4{}", encoded.len() + 2, encoded);
        let segments = decode_payload(body.as_bytes()).unwrap();
        assert_eq!(
            segments,
            vec![Segment::Binary(Bytes::from_static(b"\x01\x02\x03"))]
        );
    }

    #[test]
    fn length_prefix_counts_bytes() {
        // a multi-byte utf8 payload: the prefix counts its bytes
        let packet = "42[\"héllo\"]";
        let body = format!("{}:{}", packet.len(), packet);
        let segments = decode_payload(body.as_bytes()).unwrap();
        assert_eq!(segments, vec![Segment::Text(packet.into())]);
    }

    #[test]
    fn malformed_bodies() {
        assert!(matches!(
            decode_payload(b"banana").unwrap_err(),
            PacketError::InvalidSegment(_)
        ));
        assert!(matches!(
            decode_payload(b"9:40").unwrap_err(),
            PacketError::InvalidSegment(_)
        ));
        assert!(matches!(
            decode_payload(b"5:b4!!!").unwrap_err(),
            PacketError::InvalidBase64(_)
        ));
    }

    #[test]
    fn encode_roundtrip() {
        let packets = vec![
            Packet::decode("40").unwrap(),
            Packet::decode("42[\"chat\",\"hi\"]").unwrap(),
        ];
        let body = encode_payload(&packets);
        assert_eq!(&body[..], b"2:4015:42[\"chat\",\"hi\"]");

        let segments = decode_payload(&body).unwrap();
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn encode_attachments_as_b4_segments() {
        let mut packet = Packet::new(
            EngineEvent::Message,
            SocketEvent::BinaryEvent,
            "/",
            "[\"up\",{\"_placeholder\":true,\"num\":0}]",
        );
        packet.add_attachment(Bytes::from_static(b"\xde\xad"));
        let body = encode_payload(std::slice::from_ref(&packet));

        let segments = decode_payload(&body).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1], Segment::Binary(Bytes::from_static(b"\xde\xad")));
    }
}
