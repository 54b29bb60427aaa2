//! Client configuration.
use std::time::Duration;

use crate::ws::DEFAULT_MAX_FRAGMENT_SIZE;

/// Socket.IO client options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Whether to reconnect automatically after a disconnect (default true)
    pub reconnection: bool,
    /// Number of reconnection attempts before giving up (default u32::MAX)
    pub reconnection_attempts: u32,
    /// Initial reconnection delay (default 1000ms); affected by
    /// `randomization_factor`, so the default first delay falls between
    /// 500ms and 1500ms
    pub reconnection_delay: Duration,
    /// Maximum delay between reconnections (default 5000ms)
    pub reconnection_delay_max: Duration,
    /// Connection timeout (default 20000ms)
    pub connect_timeout: Duration,
    /// Additional query parameters appended to request uris. Keys and
    /// values must already be escaped. An empty value appends the key
    /// alone.
    pub additional_query_params: Vec<(String, String)>,
    /// When true (the default) the additional query parameters are only
    /// appended to the handshake uri, not to every request.
    pub query_params_only_for_handshake: bool,
    /// Maximum payload of one outgoing websocket frame (default 32767)
    pub max_fragment_size: usize,
    /// Optional websocket level keepalive ping frequency. Engine level
    /// pings are always driven by the handshake's ping interval.
    pub ws_ping_frequency: Option<Duration>,
    randomization_factor: f64,
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions {
            reconnection: true,
            reconnection_attempts: u32::MAX,
            reconnection_delay: Duration::from_millis(1000),
            reconnection_delay_max: Duration::from_millis(5000),
            connect_timeout: Duration::from_millis(20000),
            additional_query_params: Vec::new(),
            query_params_only_for_handshake: true,
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            ws_ping_frequency: None,
            randomization_factor: 0.5,
        }
    }
}

impl ClientOptions {
    /// Backoff jitter factor, clamped to [0, 1] (default 0.5).
    pub fn randomization_factor(&self) -> f64 {
        self.randomization_factor
    }

    pub fn set_randomization_factor(&mut self, factor: f64) {
        self.randomization_factor = factor.clamp(0.0, 1.0);
    }

    /// Render the additional query parameters as `&key=value` pairs.
    pub fn build_query_params(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.additional_query_params {
            out.push('&');
            out.push_str(key);
            if !value.is_empty() {
                out.push('=');
                out.push_str(value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = ClientOptions::default();
        assert!(options.reconnection);
        assert_eq!(options.reconnection_delay, Duration::from_millis(1000));
        assert_eq!(options.reconnection_delay_max, Duration::from_millis(5000));
        assert_eq!(options.randomization_factor(), 0.5);
        assert!(options.query_params_only_for_handshake);
    }

    #[test]
    fn randomization_factor_clamped() {
        let mut options = ClientOptions::default();
        options.set_randomization_factor(1.5);
        assert_eq!(options.randomization_factor(), 1.0);
        options.set_randomization_factor(-0.1);
        assert_eq!(options.randomization_factor(), 0.0);
    }

    #[test]
    fn query_params() {
        let mut options = ClientOptions::default();
        assert_eq!(options.build_query_params(), "");

        options
            .additional_query_params
            .push(("token".into(), "s3cret".into()));
        options.additional_query_params.push(("flag".into(), "".into()));
        assert_eq!(options.build_query_params(), "&token=s3cret&flag");
    }
}
