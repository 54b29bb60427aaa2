//! Seams towards the http client used for polling requests and for the
//! websocket upgrade.
//!
//! The transports never talk to the network directly, they go through the
//! [`HttpDispatcher`] and [`WsConnector`] traits. A dispatcher performs one
//! blocking request; the transports call it from short lived worker
//! threads. The connector performs the upgrade handshake (including the
//! `Sec-WebSocket-Accept` check) and hands back the raw stream halves.
use std::io::{Read, Write};

use ntex_bytes::Bytes;
use thiserror::Error;

/// Reading half of an upgraded stream.
pub type ReadHalf = Box<dyn Read + Send>;
/// Writing half of an upgraded stream.
pub type WriteHalf = Box<dyn Write + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// One http request as issued by the polling transport.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> HttpRequest {
        HttpRequest {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Bytes) -> HttpRequest {
        HttpRequest {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Final state of a dispatched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// The request completed and a response was received. The response
    /// status may still be a failure status.
    Finished,
    /// The request failed before a response arrived
    Error,
    /// The request was aborted locally
    Aborted,
    /// The connection could not be established in time
    ConnectionTimedOut,
    /// The connection was established but the response did not arrive in
    /// time
    TimedOut,
}

/// Result of one blocking http request.
#[derive(Debug)]
pub struct RequestOutcome {
    pub state: RequestState,
    pub response: Option<HttpResponse>,
    pub error: Option<String>,
}

impl RequestOutcome {
    pub fn finished(response: HttpResponse) -> RequestOutcome {
        RequestOutcome {
            state: RequestState::Finished,
            response: Some(response),
            error: None,
        }
    }

    pub fn failed(state: RequestState, error: impl Into<String>) -> RequestOutcome {
        RequestOutcome {
            state,
            response: None,
            error: Some(error.into()),
        }
    }

    /// True when the request finished with a 2xx response.
    pub fn is_success(&self) -> bool {
        self.state == RequestState::Finished
            && self.response.as_ref().is_some_and(HttpResponse::is_success)
    }
}

/// Websocket upgrade errors.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    /// The server rejected the upgrade or the accept key did not match
    #[error("Upgrade rejected: {0}")]
    Rejected(String),
    #[error("Connect timeout")]
    Timeout,
}

/// Blocking http client used by the polling transport and the handshake.
pub trait HttpDispatcher: Send + Sync {
    fn request(&self, req: HttpRequest) -> RequestOutcome;
}

/// Performs the websocket upgrade handshake and yields the stream halves.
pub trait WsConnector: Send + Sync {
    fn connect(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<(ReadHalf, WriteHalf), ConnectError>;
}
