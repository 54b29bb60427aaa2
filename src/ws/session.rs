//! WebSocket session over an upgraded duplex stream.
//!
//! A session owns one background thread performing blocking reads from the
//! stream. Decoded frames are reassembled and pushed as [`SessionEvent`]s
//! into a bounded queue, which the single-threaded pump drains via
//! [`WsSession::poll_event`]. Events are observed in network arrival order.
//!
//! Outbound sends serialize under one send lock, so a fragmented write is
//! atomic relative to concurrent sends (including pong and close replies
//! issued by the reader thread).
//!
//! Closing sets a flag that the reader checks once per loop iteration.
//! Because the read itself blocks, shutdown completes only after the
//! current read returns or the peer closes the stream: the latency is
//! bounded but not zero.
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use std::{cmp, thread};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, error, trace};
use ntex_bytes::{ByteString, Bytes, BytesMut};
use ntex_codec::{Decoder, Encoder};

use super::codec::{Codec, Item, Message};
use super::error::{ProtocolError, WsError};
use super::proto::{CloseCode, CloseReason};
use super::reassembly::Reassembler;

/// Default maximum payload size of one outgoing fragment.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 32_767;

/// Session states. Transitions are monotonic; `Closed` is terminal.
///
/// `Connecting` and `Opening` cover the transport negotiation phases that
/// precede the stream hand-off; a session constructed from an upgraded
/// stream starts out `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Completed protocol events, delivered in network arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete text message
    Text(ByteString),
    /// A complete binary message
    Binary(Bytes),
    /// Pong answer from the peer
    Pong(Bytes),
    /// The close handshake completed
    Closed(Option<CloseReason>),
    /// Protocol or stream failure
    Error(WsError),
}

/// Websocket session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum payload carried by a single outgoing frame; larger payloads
    /// are fragmented. Default 32767.
    pub max_fragment_size: usize,
    /// Maximum accepted size of one incoming frame. Default 64kb.
    pub max_frame_size: usize,
    /// Frequency of outgoing keepalive pings driven by `tick()`. No
    /// liveness action is taken when a pong does not arrive.
    pub ping_frequency: Option<Duration>,
    /// Capacity of the event queue between the reader thread and the pump.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            max_frame_size: 65_536,
            ping_frequency: None,
            queue_capacity: 256,
        }
    }
}

struct WriteState {
    io: Box<dyn Write + Send>,
    codec: Codec,
    buf: BytesMut,
}

impl WriteState {
    fn send(&mut self, msg: Message) -> Result<(), WsError> {
        self.codec.encode(msg, &mut self.buf)?;
        let data = self.buf.split();
        self.io.write_all(&data)?;
        self.io.flush()?;
        Ok(())
    }
}

struct Shared {
    // the send lock
    writer: Mutex<WriteState>,
    closed: AtomicBool,
    close_sent: AtomicBool,
    close_received: AtomicBool,
}

impl Shared {
    fn send(&self, msg: Message) -> Result<(), WsError> {
        self.writer.lock().unwrap().send(msg)
    }

    // force-close the connection on protocol violation
    fn force_close(&self, code: CloseCode, description: &str) {
        if !self.close_sent.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.send(Message::Close(Some((code, description).into()))) {
                debug!("Failed to send close frame: {err}");
            }
        }
        self.closed.store(true, Ordering::Release);
    }
}

/// Handle to an open websocket session.
pub struct WsSession {
    shared: Arc<Shared>,
    events: Receiver<SessionEvent>,
    max_fragment_size: usize,
    ping_frequency: Option<Duration>,
    last_ping: Option<Instant>,
}

impl WsSession {
    /// Start a session over the read/write halves of an upgraded stream.
    ///
    /// Spawns the blocking reader thread. The thread exits when the closed
    /// flag is observed, the peer disconnects or a protocol error occurs.
    pub fn start(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        cfg: SessionConfig,
    ) -> WsSession {
        let (tx, rx) = bounded(cfg.queue_capacity);
        let shared = Arc::new(Shared {
            writer: Mutex::new(WriteState {
                io: writer,
                codec: Codec::new().client_mode(),
                buf: BytesMut::new(),
            }),
            closed: AtomicBool::new(false),
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
        });

        let loop_shared = shared.clone();
        let max_frame_size = cfg.max_frame_size;
        thread::Builder::new()
            .name("sockio-ws-read".into())
            .spawn(move || read_loop(reader, loop_shared, tx, max_frame_size))
            .expect("failed to spawn websocket reader thread");

        WsSession {
            shared,
            events: rx,
            // a zero fragment size would stall the fragmenting writer
            max_fragment_size: cfg.max_fragment_size.max(1),
            ping_frequency: cfg.ping_frequency,
            last_ping: None,
        }
    }

    /// Current session state, derived from the close handshake flags.
    pub fn state(&self) -> SessionState {
        if self.shared.closed.load(Ordering::Acquire) {
            SessionState::Closed
        } else if self.shared.close_sent.load(Ordering::Acquire)
            || self.shared.close_received.load(Ordering::Acquire)
        {
            SessionState::Closing
        } else {
            SessionState::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Fetch the next queued event without blocking.
    pub fn poll_event(&self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }

    /// Send one text message.
    pub fn send_text(&self, text: ByteString) -> Result<(), WsError> {
        if self.is_closed() {
            return Err(WsError::Closed);
        }
        if text.len() <= self.max_fragment_size {
            self.shared.send(Message::Text(text))
        } else {
            self.send_fragmented(text.into_bytes(), true)
        }
    }

    /// Send one binary message, fragmenting payloads larger than
    /// `max_fragment_size`.
    pub fn send_binary(&self, data: Bytes) -> Result<(), WsError> {
        if self.is_closed() {
            return Err(WsError::Closed);
        }
        if data.len() <= self.max_fragment_size {
            self.shared.send(Message::Binary(data))
        } else {
            self.send_fragmented(data, false)
        }
    }

    // the send lock is held across all fragments, keeping the fragmented
    // write atomic relative to concurrent sends
    fn send_fragmented(&self, data: Bytes, text: bool) -> Result<(), WsError> {
        let max = self.max_fragment_size;
        let mut writer = self.shared.writer.lock().unwrap();

        let first = data.slice(0..max);
        writer.send(Message::Continuation(if text {
            Item::FirstText(first)
        } else {
            Item::FirstBinary(first)
        }))?;

        let mut pos = max;
        while pos < data.len() {
            let end = cmp::min(pos + max, data.len());
            let chunk = data.slice(pos..end);
            if end == data.len() {
                writer.send(Message::Continuation(Item::Last(chunk)))?;
            } else {
                writer.send(Message::Continuation(Item::Continue(chunk)))?;
            }
            pos = end;
        }
        Ok(())
    }

    /// Send a ping control frame.
    pub fn send_ping(&self, payload: Bytes) -> Result<(), WsError> {
        if self.is_closed() {
            return Err(WsError::Closed);
        }
        self.shared.send(Message::Ping(payload))
    }

    /// Initiate the close handshake.
    ///
    /// Sends a close frame once; the session transitions to `Closed` when
    /// the peer's close frame arrives.
    pub fn close(&self, reason: Option<CloseReason>) {
        if self.is_closed() {
            return;
        }
        if !self.shared.close_sent.swap(true, Ordering::AcqRel) {
            if let Err(err) = self.shared.send(Message::Close(reason)) {
                debug!("Failed to send close frame: {err}");
                self.shared.closed.store(true, Ordering::Release);
            }
        }
    }

    /// Tear the session down without waiting for the peer's close frame.
    ///
    /// The reader thread observes the flag once its current blocking read
    /// returns.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    /// Drive outgoing keepalive pings. Called once per external tick.
    pub fn tick(&mut self, now: Instant) {
        let Some(freq) = self.ping_frequency else {
            return;
        };
        if self.state() != SessionState::Open {
            return;
        }
        match self.last_ping {
            None => self.last_ping = Some(now),
            Some(last) if now.duration_since(last) >= freq => {
                trace!("Sending keepalive ping");
                if let Err(err) = self.shared.send(Message::Ping(Bytes::new())) {
                    debug!("Keepalive ping failed: {err}");
                }
                self.last_ping = Some(now);
            }
            Some(_) => (),
        }
    }
}

impl Drop for WsSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Flow {
    Continue,
    Stop,
}

fn read_loop(
    mut io: Box<dyn Read + Send>,
    shared: Arc<Shared>,
    tx: Sender<SessionEvent>,
    max_frame_size: usize,
) {
    let codec = Codec::new().client_mode().max_size(max_frame_size);
    let mut assembler = Reassembler::new();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut chunk = [0u8; 8 * 1024];

    'outer: while !shared.closed.load(Ordering::Acquire) {
        // drain all complete frames currently buffered
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    match on_frame(frame, &shared, &mut assembler, &tx) {
                        Flow::Continue => (),
                        Flow::Stop => break 'outer,
                    }
                    if shared.closed.load(Ordering::Acquire) {
                        break 'outer;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    // protocol violation: force-close with code 1002, the
                    // offending payload is never dispatched
                    error!("Protocol error, closing connection: {err}");
                    shared.force_close(CloseCode::Protocol, "Protocol error");
                    let _ = tx.send(SessionEvent::Error(WsError::Protocol(err)));
                    break 'outer;
                }
            }
        }

        match io.read(&mut chunk) {
            Ok(0) => {
                if !shared.closed.swap(true, Ordering::AcqRel) {
                    let _ = tx.send(SessionEvent::Error(WsError::Disconnected));
                }
                break;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => (),
            Err(err) => {
                if !shared.closed.swap(true, Ordering::AcqRel) {
                    let _ = tx.send(SessionEvent::Error(WsError::Io(err)));
                }
                break;
            }
        }
    }
    trace!("Websocket reader thread finished");
}

fn on_frame(
    frame: super::codec::Frame,
    shared: &Shared,
    assembler: &mut Reassembler,
    tx: &Sender<SessionEvent>,
) -> Flow {
    let msg = match assembler.push(frame) {
        Ok(Some(msg)) => msg,
        Ok(None) => return Flow::Continue,
        Err(err) => {
            error!("Protocol error, closing connection: {err}");
            shared.force_close(CloseCode::Protocol, "Protocol error");
            let _ = tx.send(SessionEvent::Error(WsError::Protocol(err)));
            return Flow::Stop;
        }
    };

    let event = match msg {
        Message::Text(text) => SessionEvent::Text(text),
        Message::Binary(data) => SessionEvent::Binary(data),
        Message::Pong(data) => SessionEvent::Pong(data),
        Message::Ping(payload) => {
            // answer with a pong carrying the same payload, unless we
            // already sent a close frame
            if !shared.close_sent.load(Ordering::Acquire) {
                if let Err(err) = shared.send(Message::Pong(payload)) {
                    let _ = tx.send(SessionEvent::Error(err));
                    shared.closed.store(true, Ordering::Release);
                    return Flow::Stop;
                }
            }
            return Flow::Continue;
        }
        Message::Close(reason) => {
            shared.close_received.store(true, Ordering::Release);
            if !shared.close_sent.swap(true, Ordering::AcqRel) {
                // reply first, the session becomes Closed only once the
                // send completed
                if let Err(err) = shared.send(Message::Close(None)) {
                    debug!("Failed to reply to close frame: {err}");
                }
            }
            shared.closed.store(true, Ordering::Release);
            let _ = tx.send(SessionEvent::Closed(reason));
            return Flow::Stop;
        }
        Message::Continuation(_) => {
            // the reassembler never yields a bare continuation
            return Flow::Continue;
        }
    };

    match tx.send(event) {
        Ok(()) => Flow::Continue,
        Err(_) => {
            // the receiving side is gone
            shared.closed.store(true, Ordering::Release);
            Flow::Stop
        }
    }
}
