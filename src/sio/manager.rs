//! Transport manager: handshake, transport selection, upgrade
//! orchestration and reconnection.
//!
//! The manager is the single-threaded cooperative pump of the connection.
//! `tick()` drains the transport notice queue, invokes application
//! callbacks in arrival order, drives engine pings and due reconnect
//! attempts. Callbacks never run concurrently; a panic inside one is
//! caught and logged without poisoning the pump.
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, trace};
use nanorand::{Rng, WyRand};

use crate::http::{HttpDispatcher, HttpRequest, RequestOutcome, RequestState, WsConnector};

use super::error::Error;
use super::handshake::HandshakeInfo;
use super::options::ClientOptions;
use super::packet::{EngineEvent, Packet, SocketEvent};
use super::polling::PollingTransport;
use super::transport::{
    timestamp_millis, Notice, Transport, TransportCtx, TransportKind, TransportState,
    PROTOCOL_VERSION,
};
use super::websocket::WebSocketTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// `connect()` has not been called yet
    Initial,
    /// Handshake or initial transport open in progress
    Opening,
    Open,
    /// Waiting for a scheduled reconnect attempt
    Reconnecting,
    /// Terminal for this instance
    Closed,
}

/// Exponential backoff with multiplicative jitter.
pub struct ReconnectionState {
    /// Reconnect attempts made since the last successful connect
    pub attempts: u32,
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub randomization_factor: f64,
    rng: WyRand,
}

impl ReconnectionState {
    pub fn new(options: &ClientOptions) -> ReconnectionState {
        ReconnectionState {
            attempts: 0,
            enabled: options.reconnection,
            max_attempts: options.reconnection_attempts,
            base_delay: options.reconnection_delay,
            max_delay: options.reconnection_delay_max,
            randomization_factor: options.randomization_factor(),
            rng: WyRand::new(),
        }
    }

    /// Delay before the next attempt, or `None` once reconnection stops
    /// permanently.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.enabled || self.attempts >= self.max_attempts {
            return None;
        }
        let exp = self.attempts.min(31);
        let unjittered = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);

        // uniform factor in [1-r, 1+r]
        let unit = self.rng.generate::<u32>() as f64 / u32::MAX as f64;
        let factor = 1.0 - self.randomization_factor + unit * 2.0 * self.randomization_factor;
        Some(unjittered.mul_f64(factor))
    }

    pub fn record_failure(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Called after handshake and transport open succeed.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

type PacketCallback = Box<dyn FnMut(&Packet) + Send>;
type ErrorCallback = Box<dyn FnMut(&Error) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

/// Application callbacks. An absent subscriber is an explicit no-op, a
/// panicking subscriber is caught and logged.
#[derive(Default)]
struct Handlers {
    packet: Option<PacketCallback>,
    error: Option<ErrorCallback>,
    connect: Option<EventCallback>,
    disconnect: Option<EventCallback>,
}

impl Handlers {
    fn emit_packet(&mut self, packet: &Packet) {
        if let Some(cb) = self.packet.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| cb(packet))).is_err() {
                error!("Packet handler panicked");
            }
        }
    }

    fn emit_error(&mut self, err: &Error) {
        error!("{err}");
        if let Some(cb) = self.error.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| cb(err))).is_err() {
                error!("Error handler panicked");
            }
        }
    }

    fn emit_connect(&mut self) {
        if let Some(cb) = self.connect.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                error!("Connect handler panicked");
            }
        }
    }

    fn emit_disconnect(&mut self) {
        if let Some(cb) = self.disconnect.as_mut() {
            if catch_unwind(AssertUnwindSafe(|| cb())).is_err() {
                error!("Disconnect handler panicked");
            }
        }
    }
}

/// One Socket.IO connection.
pub struct SocketManager {
    url: String,
    options: Arc<ClientOptions>,
    http: Arc<dyn HttpDispatcher>,
    ws: Arc<dyn WsConnector>,
    state: ManagerState,
    handshake: Option<HandshakeInfo>,
    polling: Option<PollingTransport>,
    websocket: Option<WebSocketTransport>,
    notices_tx: Sender<Notice>,
    notices_rx: Receiver<Notice>,
    handlers: Handlers,
    send_queue: Vec<Packet>,
    reconnection: ReconnectionState,
    next_reconnect_at: Option<Instant>,
    last_ping: Option<Instant>,
    counter: Arc<AtomicU64>,
    handshake_rx: Option<Receiver<RequestOutcome>>,
    reconnecting: bool,
}

impl SocketManager {
    pub fn new(
        url: impl Into<String>,
        options: ClientOptions,
        http: Arc<dyn HttpDispatcher>,
        ws: Arc<dyn WsConnector>,
    ) -> SocketManager {
        let (notices_tx, notices_rx) = unbounded();
        let reconnection = ReconnectionState::new(&options);
        SocketManager {
            url: url.into(),
            options: Arc::new(options),
            http,
            ws,
            state: ManagerState::Initial,
            handshake: None,
            polling: None,
            websocket: None,
            notices_tx,
            notices_rx,
            handlers: Handlers::default(),
            send_queue: Vec::new(),
            reconnection,
            next_reconnect_at: None,
            last_ping: None,
            counter: Arc::new(AtomicU64::new(0)),
            handshake_rx: None,
            reconnecting: false,
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ManagerState::Open
    }

    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        self.handshake.as_ref()
    }

    /// The transport currently carrying packets, if any is open.
    pub fn active_transport(&self) -> Option<TransportKind> {
        if self
            .websocket
            .as_ref()
            .is_some_and(|w| w.state() == TransportState::Open)
        {
            Some(TransportKind::WebSocket)
        } else if self
            .polling
            .as_ref()
            .is_some_and(|p| p.state() == TransportState::Open)
        {
            Some(TransportKind::Polling)
        } else {
            None
        }
    }

    pub fn on_packet(&mut self, cb: impl FnMut(&Packet) + Send + 'static) {
        self.handlers.packet = Some(Box::new(cb));
    }

    pub fn on_error(&mut self, cb: impl FnMut(&Error) + Send + 'static) {
        self.handlers.error = Some(Box::new(cb));
    }

    pub fn on_connect(&mut self, cb: impl FnMut() + Send + 'static) {
        self.handlers.connect = Some(Box::new(cb));
    }

    pub fn on_disconnect(&mut self, cb: impl FnMut() + Send + 'static) {
        self.handlers.disconnect = Some(Box::new(cb));
    }

    /// Start connecting: one handshake request, then the polling
    /// transport. Progress is driven by `tick()`.
    pub fn connect(&mut self) {
        if !matches!(self.state, ManagerState::Initial | ManagerState::Closed) {
            return;
        }
        info!("Connecting to {}", self.url);
        self.state = ManagerState::Opening;
        self.reconnecting = false;
        self.start_handshake();
    }

    /// Close the connection. User initiated, terminal: no reconnection.
    pub fn close(&mut self) {
        if self.state == ManagerState::Closed {
            return;
        }
        info!("Closing connection");
        self.shutdown_transports();
        self.state = ManagerState::Closed;
        self.next_reconnect_at = None;
        self.handshake_rx = None;
        self.handlers.emit_disconnect();
    }

    /// Queue a packet; it is flushed to the active transport on the next
    /// tick.
    pub fn send(&mut self, packet: Packet) {
        self.send_queue.push(packet);
    }

    /// Queue a socket event packet with a JSON payload.
    pub fn emit(&mut self, payload: impl Into<String>) {
        self.send(Packet::new(
            EngineEvent::Message,
            SocketEvent::Event,
            "/",
            payload,
        ));
    }

    /// Drive the connection: one pump cycle.
    pub fn tick(&mut self, now: Instant) {
        self.check_handshake(now);

        if let Some(polling) = self.polling.as_mut() {
            polling.tick(now);
        }
        if let Some(websocket) = self.websocket.as_mut() {
            websocket.tick(now);
        }

        while let Ok(notice) = self.notices_rx.try_recv() {
            self.on_notice(notice, now);
        }

        self.drive_ping(now);
        self.drive_poll();
        self.flush_send_queue();
        self.check_reconnect(now);
    }

    fn handshake_uri(&self) -> String {
        format!(
            "{}?EIO={}&transport=polling&t={}-{}{}&b64=true",
            self.url,
            PROTOCOL_VERSION,
            timestamp_millis(),
            self.counter
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            self.options.build_query_params(),
        )
    }

    fn start_handshake(&mut self) {
        let uri = self.handshake_uri();
        debug!("Handshake request: {uri}");

        let (tx, rx) = bounded(1);
        self.handshake_rx = Some(rx);
        let http = self.http.clone();
        thread::spawn(move || {
            let _ = tx.send(http.request(HttpRequest::get(uri)));
        });
    }

    fn check_handshake(&mut self, now: Instant) {
        let Some(rx) = self.handshake_rx.as_ref() else {
            return;
        };
        let Ok(outcome) = rx.try_recv() else {
            return;
        };
        self.handshake_rx = None;

        let result = match (outcome.state, outcome.response) {
            (RequestState::Finished, Some(resp)) if resp.is_success() => {
                HandshakeInfo::parse(&String::from_utf8_lossy(&resp.body))
            }
            (RequestState::Finished, Some(resp)) => Err(format!(
                "Handshake request finished, but the server sent an error. Status code: {}",
                resp.status
            )),
            (state, _) => Err(format!(
                "Handshake request failed ({state:?}): {}",
                outcome.error.unwrap_or_default()
            )),
        };

        match result {
            Ok(info) => self.on_handshake(info),
            Err(err) => {
                self.handlers.emit_error(&Error::Handshake(err));
                if self.reconnecting {
                    self.reconnection.record_failure();
                    self.schedule_reconnect(now);
                } else {
                    // the initial handshake failure is reported to the
                    // caller directly, no reconnection at this stage
                    self.state = ManagerState::Closed;
                }
            }
        }
    }

    fn transport_ctx(&self, sid: &str) -> TransportCtx {
        TransportCtx {
            http: self.http.clone(),
            ws: self.ws.clone(),
            url: self.url.clone(),
            sid: sid.to_owned(),
            options: self.options.clone(),
            counter: self.counter.clone(),
        }
    }

    fn on_handshake(&mut self, info: HandshakeInfo) {
        let ctx = self.transport_ctx(&info.session_id);
        self.handshake = Some(info);
        self.last_ping = None;

        // the initial transport is always polling
        let mut polling = PollingTransport::new(ctx, self.notices_tx.clone());
        if let Err(err) = polling.open() {
            self.handlers.emit_error(&Error::Transport(err));
            return;
        }
        self.polling = Some(polling);
    }

    fn on_notice(&mut self, notice: Notice, now: Instant) {
        match notice {
            Notice::Packet(packet) => self.on_packet_received(packet),
            Notice::Connected(kind) => self.on_transport_connected(kind),
            Notice::Error(kind, err) => {
                debug!("Transport error on {kind}: {err}");
                let terminal = err.is_terminal();
                self.handlers.emit_error(&Error::Transport(err));
                if terminal {
                    self.shutdown_transports();
                    self.state = ManagerState::Closed;
                    self.handlers.emit_disconnect();
                } else {
                    self.try_to_reconnect(now);
                }
            }
            Notice::Closed(kind) => {
                debug!("Transport closed: {kind}");
                self.try_to_reconnect(now);
            }
            Notice::DecodeError(_, err) => {
                self.handlers.emit_error(&Error::Internal(err));
            }
        }
    }

    fn on_packet_received(&mut self, packet: Packet) {
        match packet.engine_event {
            EngineEvent::Ping => {
                // answer a server initiated ping
                self.send_queue.push(Packet::new(
                    EngineEvent::Pong,
                    SocketEvent::Unknown,
                    "/",
                    packet.payload.clone(),
                ));
            }
            EngineEvent::Pong => trace!("Engine pong received"),
            EngineEvent::Close => {
                info!("Server closed the session");
                self.shutdown_transports();
                self.state = ManagerState::Closed;
                self.handlers.emit_disconnect();
                return;
            }
            _ => (),
        }

        if packet.engine_event == EngineEvent::Message {
            self.handlers.emit_packet(&packet);
        }
    }

    fn on_transport_connected(&mut self, kind: TransportKind) {
        match kind {
            TransportKind::Polling => {
                if self.state != ManagerState::Open {
                    self.state = ManagerState::Open;
                    self.reconnecting = false;
                    self.reconnection.reset();
                    self.handlers.emit_connect();
                }

                // start the upgrade probe once polling is usable
                let supports_ws = self
                    .handshake
                    .as_ref()
                    .is_some_and(HandshakeInfo::supports_websocket);
                if supports_ws && self.websocket.is_none() {
                    let sid = self
                        .handshake
                        .as_ref()
                        .map(|h| h.session_id.clone())
                        .unwrap_or_default();
                    let ctx = self.transport_ctx(&sid);
                    let mut websocket = WebSocketTransport::new(ctx, self.notices_tx.clone());
                    if let Err(err) = websocket.open() {
                        self.handlers.emit_error(&Error::Transport(err));
                        return;
                    }
                    self.websocket = Some(websocket);
                }
            }
            TransportKind::WebSocket => {
                info!("Upgraded to websocket, retiring polling transport");
                if let Some(mut polling) = self.polling.take() {
                    polling.pause();
                    polling.close();
                }
            }
        }
    }

    fn drive_ping(&mut self, now: Instant) {
        if self.state != ManagerState::Open {
            return;
        }
        let Some(interval) = self.handshake.as_ref().map(|h| h.ping_interval) else {
            return;
        };
        match self.last_ping {
            None => self.last_ping = Some(now),
            Some(last) if now.duration_since(last) >= interval => {
                trace!("Sending engine ping");
                self.send_queue.push(Packet::new(
                    EngineEvent::Ping,
                    SocketEvent::Unknown,
                    "/",
                    "",
                ));
                self.last_ping = Some(now);
            }
            Some(_) => (),
        }
    }

    // keep one long-poll outstanding while polling is the delivery channel
    fn drive_poll(&mut self) {
        if let Some(polling) = self.polling.as_mut() {
            if polling.state() == TransportState::Open && !polling.is_polling() {
                if let Err(err) = polling.poll() {
                    self.handlers.emit_error(&Error::Transport(err));
                }
            }
        }
    }

    fn flush_send_queue(&mut self) {
        if self.send_queue.is_empty() {
            return;
        }

        if let Some(websocket) = self.websocket.as_mut() {
            if websocket.state() == TransportState::Open {
                let packets = mem::take(&mut self.send_queue);
                if let Err(err) = websocket.send(packets) {
                    self.handlers.emit_error(&Error::Transport(err));
                }
                return;
            }
        }

        if let Some(polling) = self.polling.as_mut() {
            if polling.state() == TransportState::Open && !polling.is_sending() {
                let packets = mem::take(&mut self.send_queue);
                if let Err(err) = polling.send(packets) {
                    self.handlers.emit_error(&Error::Transport(err));
                }
            }
        }
    }

    fn shutdown_transports(&mut self) {
        if let Some(mut polling) = self.polling.take() {
            polling.close();
        }
        if let Some(mut websocket) = self.websocket.take() {
            websocket.close();
        }
        self.handshake = None;
        self.last_ping = None;
    }

    fn try_to_reconnect(&mut self, now: Instant) {
        if self.state == ManagerState::Closed || self.next_reconnect_at.is_some() {
            return;
        }
        self.shutdown_transports();

        // a failed reconnect attempt bumps the backoff
        if self.reconnecting {
            self.reconnection.record_failure();
        }
        self.schedule_reconnect(now);
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        match self.reconnection.next_delay() {
            Some(delay) => {
                info!(
                    "Reconnecting in {delay:?} (attempt {})",
                    self.reconnection.attempts
                );
                self.state = ManagerState::Reconnecting;
                self.next_reconnect_at = Some(now + delay);
            }
            None => {
                self.state = ManagerState::Closed;
                self.handlers.emit_error(&Error::ReconnectFailed);
                self.handlers.emit_disconnect();
            }
        }
    }

    fn check_reconnect(&mut self, now: Instant) {
        if let Some(at) = self.next_reconnect_at {
            if now >= at {
                self.next_reconnect_at = None;
                self.reconnecting = true;
                self.start_handshake();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(factor: f64) -> ClientOptions {
        let mut options = ClientOptions::default();
        options.set_randomization_factor(factor);
        options
    }

    #[test]
    fn backoff_monotone_until_cap_within_jitter() {
        let mut opts = options(0.5);
        opts.reconnection_delay = Duration::from_millis(1000);
        opts.reconnection_delay_max = Duration::from_millis(5000);
        let mut state = ReconnectionState::new(&opts);

        let mut prev_unjittered = Duration::ZERO;
        for attempt in 0..8u32 {
            let unjittered = Duration::from_millis(1000)
                .saturating_mul(2u32.pow(attempt))
                .min(Duration::from_millis(5000));
            assert!(unjittered >= prev_unjittered);
            prev_unjittered = unjittered;

            let sample = state.next_delay().unwrap();
            assert!(
                sample >= unjittered.mul_f64(0.5) && sample <= unjittered.mul_f64(1.5),
                "attempt {attempt}: {sample:?} outside ±50% of {unjittered:?}"
            );
            state.record_failure();
        }
    }

    #[test]
    fn backoff_reset_on_success() {
        let mut state = ReconnectionState::new(&options(0.0));
        state.record_failure();
        state.record_failure();
        assert_eq!(state.next_delay().unwrap(), Duration::from_millis(4000));

        state.reset();
        assert_eq!(state.attempts, 0);
        assert_eq!(state.next_delay().unwrap(), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_stops_at_max_attempts() {
        let mut opts = options(0.0);
        opts.reconnection_attempts = 2;
        let mut state = ReconnectionState::new(&opts);

        assert!(state.next_delay().is_some());
        state.record_failure();
        assert!(state.next_delay().is_some());
        state.record_failure();
        assert!(state.next_delay().is_none());
    }

    #[test]
    fn backoff_disabled() {
        let mut opts = options(0.0);
        opts.reconnection = false;
        let mut state = ReconnectionState::new(&opts);
        assert!(state.next_delay().is_none());
    }

    #[test]
    fn handler_panic_is_contained() {
        let mut handlers = Handlers::default();
        let seen = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = seen.clone();
        handlers.packet = Some(Box::new(move |_| {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n == 0 {
                panic!("first dispatch blows up");
            }
        }));

        let packet = Packet::decode("42[\"x\"]").unwrap();
        handlers.emit_packet(&packet);
        handlers.emit_packet(&packet);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn absent_handlers_are_noops() {
        let mut handlers = Handlers::default();
        handlers.emit_packet(&Packet::decode("40").unwrap());
        handlers.emit_connect();
        handlers.emit_disconnect();
    }
}
