//! Test helpers: an in-memory blocking duplex stream.
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Default)]
struct Channel {
    buf: VecDeque<u8>,
    closed: bool,
}

struct Shared {
    channel: Mutex<Channel>,
    cond: Condvar,
}

impl Shared {
    fn new() -> Arc<Shared> {
        Arc::new(Shared {
            channel: Mutex::new(Channel::default()),
            cond: Condvar::new(),
        })
    }
}

/// Reading half of an in-memory pipe.
///
/// Reads block until data is written to the matching `PipeWriter` or the
/// writer is dropped, in which case reads return 0 (end of stream).
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// Writing half of an in-memory pipe.
pub struct PipeWriter {
    shared: Arc<Shared>,
}

/// Create a unidirectional in-memory pipe.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let shared = Shared::new();
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

/// Create two interconnected duplex endpoints.
///
/// Bytes written to the first endpoint can be read from the second and the
/// other way around. Each endpoint is a `(reader, writer)` pair matching
/// the stream hand-off of the websocket upgrade.
#[allow(clippy::type_complexity)]
pub fn duplex() -> ((PipeReader, PipeWriter), (PipeReader, PipeWriter)) {
    let (w1, r1) = pipe();
    let (w2, r2) = pipe();
    ((r1, w2), (r2, w1))
}

impl io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut channel = self.shared.channel.lock().unwrap();
        loop {
            if !channel.buf.is_empty() {
                let n = std::cmp::min(buf.len(), channel.buf.len());
                for byte in buf.iter_mut().take(n) {
                    *byte = channel.buf.pop_front().unwrap();
                }
                return Ok(n);
            }
            if channel.closed {
                return Ok(0);
            }
            channel = self.shared.cond.wait(channel).unwrap();
        }
    }
}

impl io::Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut channel = self.shared.channel.lock().unwrap();
        if channel.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed"));
        }
        channel.buf.extend(buf.iter().copied());
        self.shared.cond.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PipeWriter {
    /// Close the pipe; pending reads observe end of stream.
    pub fn close(&self) {
        self.shared.channel.lock().unwrap().closed = true;
        self.shared.cond.notify_all();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        // unblock any writer side bookkeeping
        self.shared.channel.lock().unwrap().closed = true;
        self.shared.cond.notify_all();
    }
}
