//! Engine.IO handshake data.
use std::time::Duration;

use log::info;
use serde::Deserialize;

/// Raw handshake JSON as sent by the server.
#[derive(Debug, Deserialize)]
struct Wire {
    sid: String,
    upgrades: Vec<String>,
    #[serde(rename = "pingInterval")]
    ping_interval: u64,
    #[serde(rename = "pingTimeout")]
    ping_timeout: u64,
}

/// Parsed handshake data, immutable once parsed.
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub session_id: String,
    pub upgrades: Vec<String>,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl HandshakeInfo {
    /// Parse the handshake response body.
    ///
    /// The body arrives wrapped in a length-prefixed polling segment with
    /// the engine open digit, so parsing starts at the first `{`.
    pub fn parse(body: &str) -> Result<HandshakeInfo, String> {
        let idx = body
            .find('{')
            .ok_or_else(|| format!("Invalid handshake text: {body}"))?;

        let mut de = serde_json::Deserializer::from_str(&body[idx..]);
        let wire = Wire::deserialize(&mut de)
            .map_err(|err| format!("Parsing handshake data failed: {err}"))?;

        info!("Handshake data arrived, sid: {}", wire.sid);

        Ok(HandshakeInfo {
            session_id: wire.sid,
            upgrades: wire.upgrades,
            ping_interval: Duration::from_millis(wire.ping_interval),
            ping_timeout: Duration::from_millis(wire.ping_timeout),
        })
    }

    pub fn supports_websocket(&self) -> bool {
        self.upgrades.iter().any(|u| u == "websocket")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_handshake_json() {
        let info = HandshakeInfo::parse(
            "{\"sid\":\"abc\",\"upgrades\":[\"websocket\"],\"pingInterval\":25000,\"pingTimeout\":5000}",
        )
        .unwrap();
        assert_eq!(info.session_id, "abc");
        assert_eq!(info.upgrades, vec!["websocket".to_owned()]);
        assert_eq!(info.ping_interval, Duration::from_millis(25000));
        assert_eq!(info.ping_timeout, Duration::from_millis(5000));
        assert!(info.supports_websocket());
    }

    #[test]
    fn parse_skips_segment_prefix() {
        let body = "97:0{\"sid\":\"xyz\",\"upgrades\":[],\"pingInterval\":1000,\"pingTimeout\":2000}";
        let info = HandshakeInfo::parse(body).unwrap();
        assert_eq!(info.session_id, "xyz");
        assert!(!info.supports_websocket());
    }

    #[test]
    fn parse_failures() {
        assert!(HandshakeInfo::parse("no json here").is_err());
        assert!(HandshakeInfo::parse("0{\"sid\":\"x\"}").is_err());
    }
}
