//! WebSocket transport and the upgrade probe.
//!
//! Opening connects a raw websocket against the negotiated session id and
//! immediately sends an engine Ping packet with payload `probe`. The
//! matching Pong triggers the Upgrade packet; the transport counts as Open
//! once the first Message or Noop packet arrives while still Opening.
use std::thread;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info, trace};
use ntex_bytes::{ByteString, Bytes, BytesMut};

use crate::http::{ConnectError, ReadHalf, WriteHalf};
use crate::ws::{CloseCode, SessionConfig, SessionEvent, WsSession};

use super::error::TransportError;
use super::packet::{EngineEvent, Packet, SocketEvent};
use super::transport::{Notice, Transport, TransportCtx, TransportKind, TransportState};

type ConnectResult = Result<(ReadHalf, WriteHalf), ConnectError>;

pub struct WebSocketTransport {
    state: TransportState,
    ctx: TransportCtx,
    notices: Sender<Notice>,
    session: Option<WsSession>,
    connect_rx: Option<Receiver<ConnectResult>>,
    connect_started: Option<Instant>,
    packet_with_attachment: Option<Packet>,
}

impl WebSocketTransport {
    pub fn new(ctx: TransportCtx, notices: Sender<Notice>) -> WebSocketTransport {
        WebSocketTransport {
            state: TransportState::Closed,
            ctx,
            notices,
            session: None,
            connect_rx: None,
            connect_started: None,
            packet_with_attachment: None,
        }
    }

    fn on_connected(&mut self, reader: ReadHalf, writer: WriteHalf) {
        info!("Websocket stream established, starting upgrade probe");

        let cfg = SessionConfig {
            max_fragment_size: self.ctx.options.max_fragment_size,
            ping_frequency: self.ctx.options.ws_ping_frequency,
            ..SessionConfig::default()
        };
        let session = WsSession::start(reader, writer, cfg);
        self.session = Some(session);
        self.state = TransportState::Opening;

        self.send_packet(&Packet::new(
            EngineEvent::Ping,
            SocketEvent::Unknown,
            "/",
            "probe",
        ));
    }

    fn send_packet(&mut self, packet: &Packet) {
        let Some(session) = self.session.as_ref() else {
            return;
        };

        let encoded = packet.encode();
        trace!("Websocket send: {encoded}");
        if let Err(err) = session.send_text(ByteString::from(encoded)) {
            let _ = self
                .notices
                .send(Notice::Error(TransportKind::WebSocket, err.into()));
            return;
        }

        // attachments follow as binary messages, each with a leading
        // engine message type byte
        for attachment in packet.attachments() {
            let mut buf = BytesMut::with_capacity(attachment.len() + 1);
            buf.extend_from_slice(&[EngineEvent::Message.type_byte()]);
            buf.extend_from_slice(attachment);
            if let Err(err) = session.send_binary(buf.freeze()) {
                let _ = self
                    .notices
                    .send(Notice::Error(TransportKind::WebSocket, err.into()));
                return;
            }
        }
    }

    fn on_text(&mut self, text: ByteString) {
        match Packet::decode(&text) {
            Ok(packet) => {
                if packet.attachment_count != 0 && !packet.has_all_attachments() {
                    self.packet_with_attachment = Some(packet);
                } else {
                    self.on_packet(packet);
                }
            }
            Err(err) => {
                let _ = self
                    .notices
                    .send(Notice::DecodeError(TransportKind::WebSocket, err));
            }
        }
    }

    fn on_binary(&mut self, data: Bytes) {
        if let Some(pending) = self.packet_with_attachment.as_mut() {
            pending.add_attachment_from_server(data, true);
            if pending.has_all_attachments() {
                let packet = self.packet_with_attachment.take().unwrap();
                self.on_packet(packet);
            }
        } else {
            debug!("Unexpected binary message with no packet awaiting attachments");
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        match packet.engine_event {
            EngineEvent::Message | EngineEvent::Noop => {
                // the first ordinary packet while opening confirms that the
                // server switched over
                if self.state == TransportState::Opening {
                    self.state = TransportState::Open;
                    let _ = self
                        .notices
                        .send(Notice::Connected(TransportKind::WebSocket));
                }
            }
            EngineEvent::Pong => {
                if packet.payload == "probe" {
                    info!("\"probe\" pong received, sending upgrade packet");
                    self.send_packet(&Packet::new(
                        EngineEvent::Upgrade,
                        SocketEvent::Unknown,
                        "/",
                        "",
                    ));
                }
            }
            _ => (),
        }

        let _ = self.notices.send(Notice::Packet(packet));
    }
}

impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.state != TransportState::Closed {
            return Ok(());
        }

        let uri = self.ctx.websocket_uri();
        trace!("Connecting websocket: {uri}");

        let (tx, rx) = bounded(1);
        self.connect_rx = Some(rx);
        self.connect_started = Some(Instant::now());
        let ws = self.ctx.ws.clone();
        thread::spawn(move || {
            let _ = tx.send(ws.connect(&uri, &[]));
        });

        self.state = TransportState::Connecting;
        Ok(())
    }

    fn close(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        self.state = TransportState::Closed;

        if let Some(session) = self.session.take() {
            session.close(Some((CloseCode::Normal, "Bye!").into()));
            session.shutdown();
        }
    }

    fn pause(&mut self) {
        self.state = TransportState::Paused;
    }

    fn send(&mut self, packets: Vec<Packet>) -> Result<(), TransportError> {
        if self.state == TransportState::Closed || self.state == TransportState::Paused {
            return Err(TransportError::NotOpen);
        }
        for packet in &packets {
            self.send_packet(packet);
        }
        Ok(())
    }

    // polling is a no-op on a full duplex channel
    fn poll(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn tick(&mut self, now: Instant) {
        if let Some(rx) = self.connect_rx.as_ref() {
            match rx.try_recv() {
                Ok(Ok((reader, writer))) => {
                    self.connect_rx = None;
                    self.connect_started = None;
                    self.on_connected(reader, writer);
                }
                Ok(Err(err)) => {
                    self.connect_rx = None;
                    self.connect_started = None;
                    self.state = TransportState::Closed;
                    let _ = self
                        .notices
                        .send(Notice::Error(TransportKind::WebSocket, err.into()));
                }
                Err(_) => {
                    // a connect attempt that overruns the configured
                    // timeout is abandoned; a late result is dropped with
                    // the receiver
                    let overdue = self
                        .connect_started
                        .is_some_and(|at| now.duration_since(at) > self.ctx.options.connect_timeout);
                    if overdue {
                        self.connect_rx = None;
                        self.connect_started = None;
                        self.state = TransportState::Closed;
                        let _ = self.notices.send(Notice::Error(
                            TransportKind::WebSocket,
                            ConnectError::Timeout.into(),
                        ));
                    }
                }
            }
        }

        let mut events = Vec::new();
        if let Some(session) = self.session.as_mut() {
            session.tick(now);
            while let Some(event) = session.poll_event() {
                events.push(event);
            }
        }

        for event in events {
            match event {
                SessionEvent::Text(text) => self.on_text(text),
                SessionEvent::Binary(data) => self.on_binary(data),
                SessionEvent::Pong(_) => (),
                SessionEvent::Closed(reason) => {
                    debug!("Websocket closed: {reason:?}");
                    self.session = None;
                    self.state = TransportState::Closed;
                    let _ = self.notices.send(Notice::Closed(TransportKind::WebSocket));
                    break;
                }
                SessionEvent::Error(err) => {
                    let _ = self
                        .notices
                        .send(Notice::Error(TransportKind::WebSocket, err.into()));
                }
            }
        }
    }
}
