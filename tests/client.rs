//! End-to-end client flow over scripted collaborators.
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use ntex_bytes::{ByteString, Bytes, BytesMut};
use ntex_codec::{Decoder, Encoder};

use sockio::http::{
    ConnectError, HttpDispatcher, HttpRequest, HttpResponse, Method, ReadHalf, RequestOutcome,
    RequestState, WriteHalf, WsConnector,
};
use sockio::sio::{ClientOptions, ManagerState, SocketManager, TransportKind};
use sockio::testing::{duplex, PipeReader, PipeWriter};
use sockio::ws::{Codec, Frame, Message};

const HANDSHAKE_NO_UPGRADES: &str =
    "68:0{\"sid\":\"abc\",\"upgrades\":[],\"pingInterval\":25000,\"pingTimeout\":5000}";
const HANDSHAKE_WEBSOCKET: &str =
    "79:0{\"sid\":\"abc\",\"upgrades\":[\"websocket\"],\"pingInterval\":25000,\"pingTimeout\":5000}";

struct FakeHttp {
    gets: Mutex<VecDeque<RequestOutcome>>,
    posts: Mutex<VecDeque<RequestOutcome>>,
    get_count: AtomicU32,
    post_log: Mutex<Vec<String>>,
}

impl FakeHttp {
    fn new() -> Arc<FakeHttp> {
        Arc::new(FakeHttp {
            gets: Mutex::new(VecDeque::new()),
            posts: Mutex::new(VecDeque::new()),
            get_count: AtomicU32::new(0),
            post_log: Mutex::new(Vec::new()),
        })
    }

    fn push_get_body(&self, body: &str) {
        self.gets
            .lock()
            .unwrap()
            .push_back(RequestOutcome::finished(HttpResponse {
                status: 200,
                body: Bytes::copy_from_slice(body.as_bytes()),
            }));
    }

    fn push_get_outcome(&self, outcome: RequestOutcome) {
        self.gets.lock().unwrap().push_back(outcome);
    }

    fn push_post_ok(&self) {
        self.posts
            .lock()
            .unwrap()
            .push_back(RequestOutcome::finished(HttpResponse {
                status: 200,
                body: Bytes::from_static(b"ok"),
            }));
    }
}

impl HttpDispatcher for FakeHttp {
    fn request(&self, req: HttpRequest) -> RequestOutcome {
        let queue = match req.method {
            Method::Get => {
                self.get_count.fetch_add(1, Ordering::SeqCst);
                &self.gets
            }
            Method::Post => {
                let body = req.body.as_deref().unwrap_or_default();
                self.post_log
                    .lock()
                    .unwrap()
                    .push(String::from_utf8_lossy(body).into_owned());
                &self.posts
            }
        };

        // hold the request until the script provides a response, the way a
        // long poll would
        loop {
            if let Some(outcome) = queue.lock().unwrap().pop_front() {
                return outcome;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

struct NoWs;
impl WsConnector for NoWs {
    fn connect(
        &self,
        _url: &str,
        _headers: &[(String, String)],
    ) -> Result<(ReadHalf, WriteHalf), ConnectError> {
        panic!("no websocket upgrade expected in this scenario");
    }
}

struct PipeConnector {
    endpoint: Mutex<Option<(PipeReader, PipeWriter)>>,
}

impl WsConnector for PipeConnector {
    fn connect(
        &self,
        url: &str,
        _headers: &[(String, String)],
    ) -> Result<(ReadHalf, WriteHalf), ConnectError> {
        assert!(url.contains("transport=websocket&sid=abc"), "bad url: {url}");
        let (reader, writer) = self
            .endpoint
            .lock()
            .unwrap()
            .take()
            .expect("websocket connected twice");
        Ok((Box::new(reader), Box::new(writer)))
    }
}

#[derive(Default)]
struct Events {
    connects: AtomicU32,
    disconnects: AtomicU32,
    packets: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

fn wire(manager: &mut SocketManager) -> Arc<Events> {
    let events = Arc::new(Events::default());

    let ev = events.clone();
    manager.on_connect(move || {
        ev.connects.fetch_add(1, Ordering::SeqCst);
    });
    let ev = events.clone();
    manager.on_disconnect(move || {
        ev.disconnects.fetch_add(1, Ordering::SeqCst);
    });
    let ev = events.clone();
    manager.on_packet(move |packet| {
        ev.packets.lock().unwrap().push(packet.payload.clone());
    });
    let ev = events.clone();
    manager.on_error(move |err| {
        ev.errors.lock().unwrap().push(err.to_string());
    });

    events
}

fn pump_until<F: Fn(&SocketManager) -> bool>(manager: &mut SocketManager, done: F) {
    for _ in 0..400 {
        manager.tick(Instant::now());
        if done(manager) {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within two seconds");
}

fn no_reconnect_options() -> ClientOptions {
    let mut options = ClientOptions::default();
    options.reconnection = false;
    options
}

#[test]
fn connect_and_dispatch_over_polling() {
    let http = FakeHttp::new();
    http.push_get_body(HANDSHAKE_NO_UPGRADES);
    http.push_get_body("2:40");

    let mut manager = SocketManager::new(
        "http://server/socket.io/",
        no_reconnect_options(),
        http.clone(),
        Arc::new(NoWs),
    );
    let events = wire(&mut manager);

    manager.connect();
    assert_eq!(manager.state(), ManagerState::Opening);
    pump_until(&mut manager, SocketManager::is_open);

    assert_eq!(events.connects.load(Ordering::SeqCst), 1);
    assert_eq!(manager.handshake().unwrap().session_id, "abc");

    // the server delivers an event through the outstanding poll
    http.push_get_body("13:42[\"hi\",\"yo\"]");
    pump_until(&mut manager, |_| {
        events.packets.lock().unwrap().len() >= 2
    });

    let packets = events.packets.lock().unwrap();
    assert_eq!(packets[0], ""); // the connect packet
    assert_eq!(packets[1], "[\"hi\",\"yo\"]");
}

#[test]
fn handshake_failure_is_reported_directly() {
    let http = FakeHttp::new();
    http.push_get_outcome(RequestOutcome::failed(
        RequestState::Error,
        "connection refused",
    ));

    let mut manager = SocketManager::new(
        "http://server/socket.io/",
        ClientOptions::default(),
        http.clone(),
        Arc::new(NoWs),
    );
    let events = wire(&mut manager);

    manager.connect();
    pump_until(&mut manager, |m| m.state() == ManagerState::Closed);

    let errors = events.errors.lock().unwrap();
    assert!(errors[0].contains("Handshake failed"), "got: {errors:?}");
    // no reconnection after an initial handshake failure
    assert_eq!(http.get_count.load(Ordering::SeqCst), 1);
}

#[test]
fn queued_packets_flush_in_one_post() {
    let http = FakeHttp::new();
    http.push_get_body(HANDSHAKE_NO_UPGRADES);
    http.push_get_body("2:40");

    let mut manager = SocketManager::new(
        "http://server/socket.io/",
        no_reconnect_options(),
        http.clone(),
        Arc::new(NoWs),
    );
    let _events = wire(&mut manager);

    manager.connect();
    pump_until(&mut manager, SocketManager::is_open);

    http.push_post_ok();
    manager.emit("[\"chat\",\"one\"]");
    manager.emit("[\"chat\",\"two\"]");
    pump_until(&mut manager, |_| !http.post_log.lock().unwrap().is_empty());

    // allow a final settle tick for the post completion
    pump_until(&mut manager, |m| m.is_open());

    let posts = http.post_log.lock().unwrap();
    assert_eq!(posts.len(), 1, "both packets batch into one post");
    assert_eq!(
        posts[0],
        "16:42[\"chat\",\"one\"]16:42[\"chat\",\"two\"]"
    );
}

#[test]
fn reconnects_after_transport_error() {
    let http = FakeHttp::new();
    http.push_get_body(HANDSHAKE_NO_UPGRADES);
    http.push_get_body("2:40");

    let mut options = ClientOptions::default();
    options.reconnection_delay = Duration::from_millis(10);
    options.reconnection_delay_max = Duration::from_millis(20);
    options.set_randomization_factor(0.0);

    let mut manager = SocketManager::new(
        "http://server/socket.io/",
        options,
        http.clone(),
        Arc::new(NoWs),
    );
    let events = wire(&mut manager);

    manager.connect();
    pump_until(&mut manager, SocketManager::is_open);

    // the outstanding poll fails, the manager schedules a reconnect
    http.push_get_outcome(RequestOutcome::failed(RequestState::Error, "boom"));
    pump_until(&mut manager, |m| m.state() == ManagerState::Reconnecting);

    // the reconnect handshake and open succeed
    http.push_get_body(HANDSHAKE_NO_UPGRADES);
    http.push_get_body("2:40");
    pump_until(&mut manager, SocketManager::is_open);

    assert_eq!(events.connects.load(Ordering::SeqCst), 2);
    assert!(!events.errors.lock().unwrap().is_empty());
}

#[test]
fn abort_is_terminal() {
    let http = FakeHttp::new();
    http.push_get_body(HANDSHAKE_NO_UPGRADES);
    http.push_get_body("2:40");

    let mut manager = SocketManager::new(
        "http://server/socket.io/",
        ClientOptions::default(),
        http.clone(),
        Arc::new(NoWs),
    );
    let events = wire(&mut manager);

    manager.connect();
    pump_until(&mut manager, SocketManager::is_open);

    http.push_get_outcome(RequestOutcome::failed(RequestState::Aborted, "aborted"));
    pump_until(&mut manager, |m| m.state() == ManagerState::Closed);

    let requests_after_abort = http.get_count.load(Ordering::SeqCst);
    // a few idle ticks must not schedule any new request
    for _ in 0..10 {
        manager.tick(Instant::now());
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(http.get_count.load(Ordering::SeqCst), requests_after_abort);
    assert_eq!(events.disconnects.load(Ordering::SeqCst), 1);
}

#[test]
fn upgrades_to_websocket_and_sends_over_it() {
    let http = FakeHttp::new();
    http.push_get_body(HANDSHAKE_WEBSOCKET);
    http.push_get_body("2:40");

    let ((client_r, client_w), (server_r, server_w)) = duplex();
    let connector = PipeConnector {
        endpoint: Mutex::new(Some((client_r, client_w))),
    };

    // the server side of the upgrade probe
    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    let server_log = received.clone();
    thread::spawn(move || {
        let mut server = WsServer::new(server_r, server_w);
        assert_eq!(server.recv_text(), "2probe");
        server.send_text("3probe");
        assert_eq!(server.recv_text(), "5");
        server.send_text("6");
        // whatever the client sends post-upgrade; receive before taking
        // the lock so it is not held across the blocking read
        loop {
            let text = server.recv_text();
            server_log.lock().unwrap().push(text);
        }
    });

    let mut manager = SocketManager::new(
        "http://server/socket.io/",
        no_reconnect_options(),
        http.clone(),
        Arc::new(connector),
    );
    let events = wire(&mut manager);

    manager.connect();
    pump_until(&mut manager, SocketManager::is_open);

    // wait for the noop confirmation to retire polling and switch over
    pump_until(&mut manager, |m| {
        m.active_transport() == Some(TransportKind::WebSocket)
    });
    assert_eq!(events.connects.load(Ordering::SeqCst), 1);

    manager.emit("[\"chat\",\"over-ws\"]");
    pump_until(&mut manager, |_| !received.lock().unwrap().is_empty());

    let received = received.lock().unwrap();
    assert_eq!(received[0], "42[\"chat\",\"over-ws\"]");
    // nothing went out as a polling post
    assert!(http.post_log.lock().unwrap().is_empty());
}

struct WsServer {
    reader: PipeReader,
    writer: PipeWriter,
    codec: Codec,
    buf: BytesMut,
}

impl WsServer {
    fn new(reader: PipeReader, writer: PipeWriter) -> WsServer {
        WsServer {
            reader,
            writer,
            codec: Codec::new(),
            buf: BytesMut::new(),
        }
    }

    fn send_text(&mut self, text: &str) {
        let mut out = BytesMut::new();
        self.codec
            .encode(Message::Text(ByteString::from(text)), &mut out)
            .unwrap();
        self.writer.write_all(&out).unwrap();
    }

    fn recv_text(&mut self) -> String {
        let mut chunk = [0u8; 4096];
        loop {
            match self.codec.decode(&mut self.buf).unwrap() {
                Some(Frame::Text(data)) => return String::from_utf8(data.to_vec()).unwrap(),
                Some(Frame::Close(_)) => panic!("unexpected close frame"),
                Some(_) => continue,
                None => (),
            }
            let n = self.reader.read(&mut chunk).unwrap();
            assert_ne!(n, 0, "client went away");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
