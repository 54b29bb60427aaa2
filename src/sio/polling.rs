//! Long-polling transport.
//!
//! Each request runs on a short-lived background thread performing one
//! blocking call into the http collaborator; the completion lands in an
//! internal queue drained by `tick()` on the manager's pump thread. At
//! most one GET and one POST are in flight at any time; an in-flight flag
//! is cleared only while handling the completion of that same request.
use std::thread;
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace};
use ntex_bytes::Bytes;

use crate::http::{HttpRequest, RequestOutcome, RequestState};

use super::error::TransportError;
use super::packet::{EngineEvent, Packet, SocketEvent};
use super::payload::{decode_payload, encode_payload, Segment};
use super::transport::{Notice, Transport, TransportCtx, TransportKind, TransportState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    /// A GET: the first one after the handshake or a poll cycle
    Get,
    /// A POST carrying a packet batch
    Post,
}

struct Completion {
    kind: RequestKind,
    outcome: RequestOutcome,
}

pub struct PollingTransport {
    state: TransportState,
    ctx: TransportCtx,
    notices: Sender<Notice>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    get_in_flight: bool,
    post_in_flight: bool,
    /// The last packet still waiting for binary attachments
    packet_with_attachment: Option<Packet>,
}

impl PollingTransport {
    pub fn new(ctx: TransportCtx, notices: Sender<Notice>) -> PollingTransport {
        let (completions_tx, completions_rx) = unbounded();
        PollingTransport {
            state: TransportState::Closed,
            ctx,
            notices,
            completions_tx,
            completions_rx,
            get_in_flight: false,
            post_in_flight: false,
            packet_with_attachment: None,
        }
    }

    /// True while a poll GET is outstanding.
    pub fn is_polling(&self) -> bool {
        self.get_in_flight
    }

    /// True while a packet POST is outstanding.
    pub fn is_sending(&self) -> bool {
        self.post_in_flight
    }

    fn start_request(&self, kind: RequestKind, req: HttpRequest) {
        let http = self.ctx.http.clone();
        let tx = self.completions_tx.clone();
        thread::spawn(move || {
            let outcome = http.request(req);
            let _ = tx.send(Completion { kind, outcome });
        });
    }

    fn on_completion(&mut self, completion: Completion) {
        // clear the in-flight flag for this request so the next one can go
        // out
        match completion.kind {
            RequestKind::Get => self.get_in_flight = false,
            RequestKind::Post => self.post_in_flight = false,
        }

        if self.state == TransportState::Closed {
            return;
        }

        let error = match completion.outcome.state {
            RequestState::Finished => match completion.outcome.response {
                Some(resp) if resp.is_success() => {
                    self.parse_response(&resp.body);
                    return;
                }
                Some(resp) => TransportError::BadStatus {
                    status: resp.status,
                    message: String::from_utf8_lossy(&resp.body).into_owned(),
                },
                None => TransportError::Request("finished without a response".into()),
            },
            RequestState::Error => {
                TransportError::Request(completion.outcome.error.unwrap_or_default())
            }
            RequestState::Aborted => TransportError::Aborted,
            RequestState::ConnectionTimedOut => TransportError::ConnectionTimedOut,
            RequestState::TimedOut => TransportError::TimedOut,
        };
        let _ = self
            .notices
            .send(Notice::Error(TransportKind::Polling, error));
    }

    fn parse_response(&mut self, body: &[u8]) {
        let segments = match decode_payload(body) {
            Ok(segments) => segments,
            Err(err) => {
                let _ = self
                    .notices
                    .send(Notice::DecodeError(TransportKind::Polling, err));
                return;
            }
        };

        for segment in segments {
            match segment {
                Segment::Text(text) => match Packet::decode(&text) {
                    Ok(packet) => self.on_packet(packet),
                    Err(err) => {
                        let _ = self
                            .notices
                            .send(Notice::DecodeError(TransportKind::Polling, err));
                    }
                },
                Segment::Binary(data) => self.on_binary(data),
            }
        }
    }

    // a base64 segment is an attachment of the pending packet if one is
    // waiting, otherwise a standalone binary packet
    fn on_binary(&mut self, data: Bytes) {
        if let Some(pending) = self.packet_with_attachment.as_mut() {
            pending.add_attachment_from_server(data, false);
            if pending.has_all_attachments() {
                let packet = self.packet_with_attachment.take().unwrap();
                self.on_packet(packet);
            }
            return;
        }

        match Packet::from_binary(data) {
            Ok(packet) => self.on_packet(packet),
            Err(err) => {
                let _ = self
                    .notices
                    .send(Notice::DecodeError(TransportKind::Polling, err));
            }
        }
    }

    fn on_packet(&mut self, packet: Packet) {
        if packet.attachment_count != 0 && !packet.has_all_attachments() {
            self.packet_with_attachment = Some(packet);
            return;
        }

        // the connect message confirms that the channel is usable
        if packet.engine_event == EngineEvent::Message
            && packet.socket_event == SocketEvent::Connect
            && self.state == TransportState::Opening
        {
            self.state = TransportState::Open;
            let _ = self.notices.send(Notice::Connected(TransportKind::Polling));
        }

        let _ = self.notices.send(Notice::Packet(packet));
    }
}

impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn open(&mut self) -> Result<(), TransportError> {
        trace!("Opening polling transport, sid: {}", self.ctx.sid);
        self.state = TransportState::Opening;
        self.get_in_flight = true;
        self.start_request(RequestKind::Get, HttpRequest::get(self.ctx.polling_uri()));
        Ok(())
    }

    fn close(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        self.state = TransportState::Closed;
    }

    fn pause(&mut self) {
        self.state = TransportState::Paused;
    }

    fn send(&mut self, packets: Vec<Packet>) -> Result<(), TransportError> {
        if self.state != TransportState::Open {
            return Err(TransportError::NotOpen);
        }
        if self.post_in_flight {
            return Err(TransportError::Concurrency);
        }

        let body = encode_payload(&packets);
        debug!("Polling send, {} packet(s)", packets.len());

        self.post_in_flight = true;
        self.start_request(
            RequestKind::Post,
            HttpRequest::post(self.ctx.polling_uri(), body)
                .header("Content-Type", "text/plain;charset=UTF-8"),
        );
        Ok(())
    }

    fn poll(&mut self) -> Result<(), TransportError> {
        if self.state == TransportState::Paused || self.state == TransportState::Closed {
            return Ok(());
        }
        if self.get_in_flight {
            return Err(TransportError::Concurrency);
        }

        self.get_in_flight = true;
        self.start_request(RequestKind::Get, HttpRequest::get(self.ctx.polling_uri()));
        Ok(())
    }

    fn tick(&mut self, _now: Instant) {
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.on_completion(completion);
        }
    }
}
