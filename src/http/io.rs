//! Per-request I/O lifecycle engine.
//!
//! A [`RequestIo`] sits between the transport task (which delivers request
//! bytes and pulls response bytes without ever blocking) and handler code
//! running on an async worker thread (which reads and writes bodies as plain
//! blocking streams). The two sides cooperate through a mutex-protected
//! mailbox and per-connection condition variables; the transport side parks on
//! a [`tokio::sync::Notify`] instead so it never blocks a callback thread.
//!
//! # Phases
//!
//! ```text
//! Sync ──handler returns──> Idle ──continuation scheduled──> Async
//!   Async ──continuation returns──> Idle
//!   Idle/Async ──upgrade──> WebSocket            (one-way)
//!   any ──teardown with continuation running──> Zombie   (terminal)
//! ```
//!
//! Zombie is terminal: once the transport reports teardown while a
//! continuation is still out, every blocking operation fails immediately with
//! `ConnectionAborted` and whoever drops the last `Arc<RequestIo>` runs the
//! finalizers.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};

use tokio::sync::Notify;

use crate::error::Error;
use crate::http::encoding::{self, Encoding};
use crate::http::request::RequestInfo;
use crate::http::response::{Body, Response};
use crate::http::ws::{WsMessage, WsSocket};

/// Output buffer size that triggers backpressure on writers.
pub const WRITE_HIGH_WATER: usize = 4096;

/// Most bytes handed to the transport per pull.
pub(crate) const PULL_CHUNK: usize = 16 * 1024;

/// Bound on queued-but-unread websocket messages before the reader thread
/// stops pulling frames off the socket.
pub(crate) const WS_QUEUE_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Handler is running synchronously on the transport task.
    Sync,
    /// No continuation in flight; the transport may finish the request.
    Idle,
    /// A continuation is running on an async worker thread.
    Async,
    /// Connection upgraded; normal read/write are no longer valid.
    WebSocket,
    /// Transport tore the connection down. Terminal.
    Zombie,
}

pub(crate) type Continuation = Box<dyn FnOnce() + Send + 'static>;
type Finalizer = Box<dyn FnOnce() + Send + 'static>;

/// State shared between the transport task and the worker thread.
pub(crate) struct Shared {
    pub phase: Phase,
    /// Whether the transport was told to stop polling for this request.
    pub suspended: bool,
    /// Continuation registered by the handler, consumed once per Idle cycle.
    pub pending: Option<Continuation>,
    pub last_err: Option<String>,

    // Attached response
    pub code: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Body,

    // Blocking-read mailbox. Staged bytes never exceed what the waiting
    // reader asked for.
    pub read_want: usize,
    pub read_staged: Vec<u8>,
    pub read_total: usize,
    pub read_max: Option<usize>,
    pub read_eof: bool,

    // Blocking-write mailbox, bounded by WRITE_HIGH_WATER.
    pub streaming: bool,
    pub write_code: u16,
    pub write_buf: Vec<u8>,
    pub write_eof: bool,

    // WebSocket handoff and inbound message queue.
    pub ws_socket: Option<WsSocket>,
    pub ws_queue: VecDeque<WsMessage>,
    pub ws_eof: bool,

    finalizers: Vec<Finalizer>,
}

/// Per-request I/O handle: the engine's state machine plus the operations
/// exposed to handlers.
pub struct RequestIo {
    request: RequestInfo,
    pub(crate) shared: Mutex<Shared>,
    pub(crate) read_cv: Condvar,
    pub(crate) write_cv: Condvar,
    pub(crate) ws_cv: Condvar,
    /// Transport-side wakeup. notify stores a permit, so resuming an already
    /// resumed connection is a no-op by construction.
    pub(crate) resume: Notify,
}

impl RequestIo {
    pub(crate) fn new(request: RequestInfo) -> Self {
        Self {
            request,
            shared: Mutex::new(Shared {
                phase: Phase::Sync,
                suspended: false,
                pending: None,
                last_err: None,
                code: None,
                headers: Vec::new(),
                body: Body::Bytes(Vec::new()),
                read_want: 0,
                read_staged: Vec::new(),
                read_total: 0,
                read_max: None,
                read_eof: false,
                streaming: false,
                write_code: 200,
                write_buf: Vec::new(),
                write_eof: false,
                ws_socket: None,
                ws_queue: VecDeque::new(),
                ws_eof: false,
                finalizers: Vec::new(),
            }),
            read_cv: Condvar::new(),
            write_cv: Condvar::new(),
            ws_cv: Condvar::new(),
            resume: Notify::new(),
        }
    }

    /// Immutable per-request facts.
    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    /// Registers a continuation to run on the async pool once the transport
    /// hands control back. At most one is pending at a time; registering again
    /// replaces the previous one.
    pub fn run_async<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut s = self.shared.lock().unwrap();
        s.pending = Some(Box::new(func));
    }

    /// Registers a cleanup closure run exactly once at destruction, in
    /// registration order.
    pub fn add_finalizer<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut s = self.shared.lock().unwrap();
        s.finalizers.push(Box::new(func));
    }

    /// Records an error message for this request; it feeds the default error
    /// page for 4xx responses.
    pub fn record_error(&self, msg: impl Into<String>) {
        let msg = msg.into();
        tracing::error!(client = %self.request.client_addr, "{msg}");
        self.shared.lock().unwrap().last_err = Some(msg);
    }

    /// Most recent error recorded on this request.
    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().unwrap().last_err.clone()
    }

    // ---- Response attachment ------------------------------------------------

    pub fn add_header(&self, key: impl Into<String>, value: impl Into<String>) {
        let mut s = self.shared.lock().unwrap();
        s.headers.push((key.into(), value.into()));
    }

    /// Adds the Content-Encoding header matching `encoding` (nothing for
    /// identity).
    pub fn add_encoding_header(&self, encoding: Encoding) {
        if let Some(value) = encoding.header_value() {
            self.add_header("Content-Encoding", value);
        }
    }

    /// Adds a Set-Cookie header; `None` deletes the cookie.
    pub fn add_cookie_header(&self, path: &str, name: &str, value: Option<&str>, http_only: bool) {
        let mut cookie = match value {
            Some(value) => format!("{name}={value}; Path={path};"),
            None => format!("{name}=; Path={path}; Max-Age=0;"),
        };
        cookie.push_str(" SameSite=Lax;");
        if http_only {
            cookie.push_str(" HttpOnly;");
        }
        self.add_header("Set-Cookie", cookie);
    }

    pub fn add_caching_headers(&self, max_age: u32, etag: Option<&str>) {
        if max_age > 0 {
            self.add_header("Cache-Control", format!("max-age={max_age}"));
        } else {
            self.add_header("Cache-Control", "no-store");
        }
        if let Some(etag) = etag {
            self.add_header("ETag", etag);
        }
    }

    fn attach_in(&self, s: &mut Shared, code: u16, body: Body) {
        s.code = Some(code);
        s.body = body;
    }

    pub fn attach_text(&self, code: u16, text: impl Into<String>) {
        let mut s = self.shared.lock().unwrap();
        self.attach_in(&mut s, code, Body::Bytes(text.into().into_bytes()));
        drop(s);
        self.set_content_type("text/plain");
    }

    /// Attaches a fixed binary payload whose bytes are already in `encoding`.
    ///
    /// If the client does not accept that encoding, the payload is re-encoded
    /// (decompressed then recompressed) through a background continuation
    /// instead of failing the request.
    pub fn attach_binary(
        self: &Arc<Self>,
        code: u16,
        data: Vec<u8>,
        mime_type: Option<&str>,
        data_encoding: Encoding,
    ) {
        let target = self.request.encoding;

        if data_encoding != target {
            if self.request.headers_only {
                self.attach_nothing(code);
                self.add_encoding_header(target);
            } else {
                let io = Arc::clone(self);
                self.run_async(move || {
                    let raw = match encoding::decompress(&data, data_encoding) {
                        Ok(raw) => raw,
                        Err(err) => {
                            io.record_error(format!("cannot re-encode response: {err}"));
                            return;
                        }
                    };

                    io.add_encoding_header(target);
                    let mut writer = io.open_for_write(code, target);
                    if let Err(err) = io::Write::write_all(&mut writer, &raw)
                        .and_then(|_| writer.finish())
                    {
                        io.record_error(format!("cannot write response: {err}"));
                    }
                });
            }
        } else {
            let mut s = self.shared.lock().unwrap();
            self.attach_in(&mut s, code, Body::Bytes(data));
            drop(s);
            self.add_encoding_header(data_encoding);
        }

        if let Some(mime_type) = mime_type {
            self.set_content_type(mime_type);
        }
    }

    /// Attaches the default plain-text error page. Without explicit details,
    /// client errors reuse the last recorded error message.
    pub fn attach_error(&self, code: u16, details: Option<&str>) {
        let mut s = self.shared.lock().unwrap();
        self.attach_error_in(&mut s, code, details);
    }

    pub(crate) fn attach_error_in(&self, s: &mut Shared, code: u16, details: Option<&str>) {
        let details = match details {
            Some(details) => details.to_string(),
            None if code < 500 => s.last_err.clone().unwrap_or_default(),
            None => String::new(),
        };

        let page = Response::error_page(code, &details);
        self.attach_in(s, code, page.body);
        s.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
        s.headers.push(("Content-Type".to_string(), "text/plain".to_string()));
    }

    /// Attaches a status-only response without a Content-Length.
    pub fn attach_nothing(&self, code: u16) {
        let mut s = self.shared.lock().unwrap();
        self.attach_in(&mut s, code, Body::Empty);
    }

    /// Discards the attached status, body and headers.
    pub fn reset_response(&self) {
        let mut s = self.shared.lock().unwrap();
        s.code = None;
        s.body = Body::Bytes(Vec::new());
        s.headers.clear();
    }

    fn set_content_type(&self, mime_type: &str) {
        let mut s = self.shared.lock().unwrap();
        s.headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
        s.headers.push(("Content-Type".to_string(), mime_type.to_string()));
    }

    /// Picks the first of `preferred` the client accepts, falling back to any
    /// acceptable encoding. Attaches a 406 and fails when nothing matches.
    pub fn negotiate_encoding(&self, preferred: &[Encoding]) -> Result<Encoding, Error> {
        match encoding::negotiate(self.request.accept_mask, preferred) {
            Some(encoding) => Ok(encoding),
            None => {
                self.attach_error(406, None);
                Err(Error::NotAcceptable)
            }
        }
    }

    // ---- Blocking adapters (continuation thread only) -----------------------

    /// Opens the request body for blocking reads, capped at `max_len`
    /// cumulative bytes. Must be called from a continuation.
    pub fn open_for_read(self: &Arc<Self>, max_len: usize) -> BodyReader {
        let mut s = self.shared.lock().unwrap();
        debug_assert!(s.phase != Phase::Sync);
        s.read_max = Some(max_len);
        drop(s);

        BodyReader { io: Arc::clone(self) }
    }

    /// Opens the response body for blocking writes with the given status code,
    /// compressing through `encoding`. The first write finalizes the status
    /// and flips the transport into pull mode. Must be called from a
    /// continuation; call [`BodyWriter::finish`] to mark end-of-output.
    pub fn open_for_write(self: &Arc<Self>, code: u16, encoding: Encoding) -> BodyWriter {
        let mut s = self.shared.lock().unwrap();
        debug_assert!(s.phase != Phase::Sync);
        s.write_code = code;
        drop(s);

        let raw = RawBody { io: Arc::clone(self) };
        let sink = match encoding {
            Encoding::Identity => Sink::Plain(raw),
            Encoding::Gzip => Sink::Gzip(flate2::write::GzEncoder::new(
                raw,
                flate2::Compression::default(),
            )),
            Encoding::Deflate => Sink::Deflate(flate2::write::ZlibEncoder::new(
                raw,
                flate2::Compression::default(),
            )),
        };

        BodyWriter { sink: Some(sink) }
    }

    /// Blocking read of request-body bytes into `dest`.
    ///
    /// Returns 0 at end of body. Fails with `ConnectionAborted` once the
    /// connection is torn down and with `PayloadTooLarge` past the cap (a 413
    /// page is attached in that case).
    fn read_some(&self, dest: &mut [u8]) -> io::Result<usize> {
        if dest.is_empty() {
            return Ok(0);
        }

        let mut s = self.shared.lock().unwrap();
        debug_assert!(s.phase != Phase::Sync);

        // Once output streaming starts the transport only pulls; it will
        // never feed request bytes again.
        if s.streaming {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read the request body after writing output",
            ));
        }

        s.read_want = dest.len();

        loop {
            if s.phase == Phase::Zombie {
                s.read_want = 0;
                s.last_err = Some(Error::ConnectionAborted.to_string());
                return Err(Error::ConnectionAborted.into());
            }

            if !s.read_staged.is_empty() {
                let n = dest.len().min(s.read_staged.len());
                dest[..n].copy_from_slice(&s.read_staged[..n]);
                s.read_staged.drain(..n);
                s.read_want = 0;

                if let Some(max) = s.read_max {
                    if s.read_total + n > max {
                        let err = Error::PayloadTooLarge { max };
                        s.last_err = Some(err.to_string());
                        self.attach_error_in(&mut s, 413, None);
                        return Err(err.into());
                    }
                }
                s.read_total += n;

                return Ok(n);
            }

            if s.read_eof {
                s.read_want = 0;
                return Ok(0);
            }
            if s.phase != Phase::Async {
                s.read_want = 0;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "body reads are only valid from a continuation",
                ));
            }

            self.resume_locked(&mut s);
            s = self.read_cv.wait(s).unwrap();
        }
    }

    /// Blocking append of response-body bytes; an empty `buf` marks
    /// end-of-output. Blocks while the buffer sits at the high-water mark.
    fn write_some(&self, buf: &[u8]) -> io::Result<()> {
        let mut s = self.shared.lock().unwrap();
        debug_assert!(s.phase != Phase::Sync);
        debug_assert!(!s.write_eof);

        if s.phase == Phase::WebSocket {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "body writes are invalid after a websocket upgrade",
            ));
        }

        s.streaming = true;
        if buf.is_empty() {
            s.write_eof = true;
        }
        self.resume_locked(&mut s);

        while s.phase == Phase::Async && s.write_buf.len() >= WRITE_HIGH_WATER {
            s = self.write_cv.wait(s).unwrap();
        }

        if s.phase == Phase::Zombie {
            s.last_err = Some(Error::ConnectionAborted.to_string());
            return Err(Error::ConnectionAborted.into());
        }

        s.write_buf.extend_from_slice(buf);
        Ok(())
    }

    // ---- Transport-side plumbing -------------------------------------------

    /// Wakes the transport task if it was told to suspend. Idempotent.
    pub(crate) fn resume_locked(&self, s: &mut Shared) {
        if s.suspended {
            s.suspended = false;
            self.resume.notify_one();
        }
    }

    /// Handler ran; the request sits idle until a continuation is scheduled or
    /// the transport finishes the response.
    pub(crate) fn finish_sync(&self) {
        let mut s = self.shared.lock().unwrap();
        debug_assert!(s.phase == Phase::Sync);
        s.phase = Phase::Idle;
    }

    /// Transport-side completion notification: if a continuation is still out
    /// there, the request turns Zombie and every blocked operation is woken
    /// with an abort. Otherwise there is nothing to do; dropping the Arc
    /// destroys the state.
    pub(crate) fn complete(&self) {
        let mut s = self.shared.lock().unwrap();
        if s.phase == Phase::Async {
            s.phase = Phase::Zombie;
            self.read_cv.notify_all();
            self.write_cv.notify_all();
            self.ws_cv.notify_all();
        }
    }

    /// Unconditional teardown: used by daemon shutdown and websocket I/O
    /// failures. Monotonic, never leaves Zombie.
    pub(crate) fn force_zombie(&self) {
        let mut s = self.shared.lock().unwrap();
        if s.phase != Phase::Zombie {
            s.phase = Phase::Zombie;
            self.read_cv.notify_all();
            self.write_cv.notify_all();
            self.ws_cv.notify_all();
        }
        drop(s);
        self.resume.notify_one();
    }

    /// Builds the attached response for the transport to send, defaulting to
    /// an internal error page when the handler never attached anything.
    pub(crate) fn take_attached_response(&self) -> (Response, bool) {
        let mut s = self.shared.lock().unwrap();
        if s.code.is_none() {
            self.attach_error_in(&mut s, 500, None);
        }

        let response = Response {
            status: s.code.unwrap_or(500),
            headers: std::mem::take(&mut s.headers),
            body: std::mem::replace(&mut s.body, Body::Empty),
        };
        (response, self.request.headers_only)
    }

    /// Status code and headers for a streamed response.
    pub(crate) fn take_stream_head(&self) -> (u16, Vec<(String, String)>) {
        let mut s = self.shared.lock().unwrap();
        (s.write_code, std::mem::take(&mut s.headers))
    }

    pub(crate) fn current_phase(&self) -> Phase {
        self.shared.lock().unwrap().phase
    }
}

impl Drop for RequestIo {
    fn drop(&mut self) {
        let finalizers = std::mem::take(&mut self.shared.get_mut().unwrap().finalizers);
        for func in finalizers {
            func();
        }
    }
}

/// Blocking reader over the request body. Obtained from
/// [`RequestIo::open_for_read`]; only valid on the continuation thread.
pub struct BodyReader {
    io: Arc<RequestIo>,
}

impl io::Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.read_some(buf)
    }
}

struct RawBody {
    io: Arc<RequestIo>,
}

impl io::Write for RawBody {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // An empty slice means end-of-output at the engine level, never pass
        // one through from a generic writer.
        if buf.is_empty() {
            return Ok(0);
        }
        self.io.write_some(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Sink {
    Plain(RawBody),
    Gzip(flate2::write::GzEncoder<RawBody>),
    Deflate(flate2::write::ZlibEncoder<RawBody>),
}

/// Blocking writer over the response body, optionally compressing. Obtained
/// from [`RequestIo::open_for_write`]; only valid on the continuation thread.
///
/// Dropping the writer without calling [`BodyWriter::finish`] leaves the
/// stream unterminated, which the transport reports as a truncated response.
pub struct BodyWriter {
    sink: Option<Sink>,
}

impl BodyWriter {
    /// Flushes any codec trailer and marks end-of-output.
    pub fn finish(mut self) -> io::Result<()> {
        let raw = match self.sink.take() {
            Some(Sink::Plain(raw)) => raw,
            Some(Sink::Gzip(encoder)) => encoder.finish()?,
            Some(Sink::Deflate(encoder)) => encoder.finish()?,
            None => return Ok(()),
        };
        raw.io.write_some(&[])
    }
}

impl io::Write for BodyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.sink.as_mut() {
            Some(Sink::Plain(raw)) => raw.write(buf),
            Some(Sink::Gzip(encoder)) => encoder.write(buf),
            Some(Sink::Deflate(encoder)) => encoder.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer finished")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(Sink::Plain(raw)) => raw.flush(),
            Some(Sink::Gzip(encoder)) => encoder.flush(),
            Some(Sink::Deflate(encoder)) => encoder.flush(),
            None => Ok(()),
        }
    }
}
