//! Daemon: listening endpoint, per-connection transport tasks, connection
//! table and graceful shutdown.
//!
//! Each accepted connection gets one tokio task that plays the transport
//! role: it parses request heads, feeds body bytes to a waiting blocking
//! reader, pulls buffered output, and otherwise parks on the request's
//! `resume` notifier so it never blocks a callback thread. Handler
//! continuations run on the bounded [`AsyncPool`] instead.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::config::{ClientAddrMode, Config, SocketKind};
use crate::error::Error;
use crate::http::encoding::{self, Encoding};
use crate::http::io::{Phase, RequestIo, Shared, PULL_CHUNK};
use crate::http::parser::{self, ParseError, RequestHead};
use crate::http::request::{Method, RequestInfo};
use crate::http::response::Response;
use crate::http::writer::{self, Framing};
use crate::http::ws::{self, WsSocket};
use crate::server::pool::AsyncPool;

/// Registered request handler: runs synchronously once per request on the
/// transport task, and may defer work with [`RequestIo::run_async`].
pub type Handler = dyn Fn(&RequestInfo, &Arc<RequestIo>) + Send + Sync + 'static;

/// The HTTP daemon. Owns the transport runtime, the async worker pool and the
/// table of live requests.
pub struct Daemon {
    runtime: Option<tokio::runtime::Runtime>,
    inner: Option<Arc<DaemonInner>>,
    local_addr: Option<SocketAddr>,
}

struct DaemonInner {
    running: AtomicBool,
    handler: Box<Handler>,
    pool: AsyncPool,
    requests: Mutex<HashMap<u64, Arc<RequestIo>>>,
    next_id: AtomicU64,
    live_connections: AtomicUsize,
    idle_timeout: Option<Duration>,
    max_connections: usize,
    client_addr_mode: ClientAddrMode,
}

impl Daemon {
    pub fn new() -> Self {
        Self {
            runtime: None,
            inner: None,
            local_addr: None,
        }
    }

    /// Validates the configuration, binds the endpoint, spins up the worker
    /// pool and starts accepting.
    ///
    /// Calling this on an already-started daemon is a programming error and
    /// panics.
    pub fn start<F>(&mut self, config: &Config, handler: F) -> Result<(), Error>
    where
        F: Fn(&RequestInfo, &Arc<RequestIo>) + Send + Sync + 'static,
    {
        assert!(self.inner.is_none(), "daemon is already started");

        config.validate()?;

        let listener = bind_listener(config)?;
        if let StdListener::Tcp(l) = &listener {
            self.local_addr = l.local_addr().ok();
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.threads)
            .thread_name("transport")
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;

        let inner = Arc::new(DaemonInner {
            running: AtomicBool::new(true),
            handler: Box::new(handler),
            pool: AsyncPool::new(config.async_threads),
            requests: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            live_connections: AtomicUsize::new(0),
            idle_timeout: (config.idle_timeout > 0)
                .then(|| Duration::from_secs(config.idle_timeout)),
            max_connections: config.max_connections,
            client_addr_mode: config.client_addr_mode,
        });

        {
            let _guard = runtime.enter();
            let listener = listener.into_tokio().map_err(Error::Runtime)?;
            runtime.spawn(accept_loop(Arc::clone(&inner), listener));
        }

        match self.local_addr {
            Some(addr) => tracing::info!(%addr, "daemon listening"),
            None => tracing::info!("daemon listening on local socket"),
        }

        self.runtime = Some(runtime);
        self.inner = Some(inner);
        Ok(())
    }

    /// Local address of the TCP listening socket. `None` before `start` and
    /// for unix-socket endpoints.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Graceful shutdown: new requests get an immediate 503, live requests
    /// are aborted so blocked continuations return, then the pool is drained
    /// and the listener stopped. Idempotent.
    pub fn stop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };

        inner.running.store(false, Ordering::SeqCst);

        let live: Vec<_> = inner
            .requests
            .lock()
            .unwrap()
            .drain()
            .map(|(_, io)| io)
            .collect();
        for io in live {
            io.force_zombie();
        }

        inner.pool.shutdown();

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }

        tracing::info!("daemon stopped");
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

enum StdListener {
    Tcp(std::net::TcpListener),
    Unix(std::os::unix::net::UnixListener),
}

impl StdListener {
    fn into_tokio(self) -> io::Result<Listener> {
        match self {
            StdListener::Tcp(l) => tokio::net::TcpListener::from_std(l).map(Listener::Tcp),
            StdListener::Unix(l) => tokio::net::UnixListener::from_std(l).map(Listener::Unix),
        }
    }
}

fn bind_listener(config: &Config) -> Result<StdListener, Error> {
    match config.socket {
        SocketKind::Unix => {
            let path = config.unix_path.clone().unwrap_or_default();
            // Stale socket files from a previous run would fail the bind.
            let _ = std::fs::remove_file(&path);

            let listener = std::os::unix::net::UnixListener::bind(&path)
                .and_then(|l| l.set_nonblocking(true).map(|()| l))
                .map_err(|source| Error::Bind {
                    addr: path.clone(),
                    source,
                })?;
            Ok(StdListener::Unix(listener))
        }
        kind => {
            // Dual-stack and IPv6 both bind the v6 wildcard; whether v6-only
            // binds also accept v4 is left to the OS default.
            let addr: SocketAddr = match kind {
                SocketKind::Ipv4 => (Ipv4Addr::UNSPECIFIED, config.port).into(),
                _ => (Ipv6Addr::UNSPECIFIED, config.port).into(),
            };

            let listener = std::net::TcpListener::bind(addr)
                .and_then(|l| l.set_nonblocking(true).map(|()| l))
                .map_err(|source| Error::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
            Ok(StdListener::Tcp(listener))
        }
    }
}

enum Listener {
    Tcp(tokio::net::TcpListener),
    Unix(tokio::net::UnixListener),
}

impl Listener {
    async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Listener::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Stream::Tcp(stream), peer.ip().to_string()))
            }
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok((Stream::Unix(stream), "unix".to_string()))
            }
        }
    }
}

enum Stream {
    Tcp(tokio::net::TcpStream),
    Unix(tokio::net::UnixStream),
}

impl Stream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read_buf(buf).await,
            Stream::Unix(s) => s.read_buf(buf).await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf).await,
            Stream::Unix(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(data).await,
            Stream::Unix(s) => s.write_all(data).await,
        }
    }

    /// Converts back to a blocking std socket for the websocket handoff.
    fn into_raw(self) -> io::Result<WsSocket> {
        match self {
            Stream::Tcp(s) => {
                let std = s.into_std()?;
                std.set_nonblocking(false)?;
                Ok(WsSocket::Tcp(std))
            }
            Stream::Unix(s) => {
                let std = s.into_std()?;
                std.set_nonblocking(false)?;
                Ok(WsSocket::Unix(std))
            }
        }
    }
}

async fn accept_loop(inner: Arc<DaemonInner>, listener: Listener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if inner.max_connections > 0
                    && inner.live_connections.load(Ordering::SeqCst) >= inner.max_connections
                {
                    tracing::warn!(client = %peer, "connection limit reached, refusing");
                    continue;
                }

                inner.live_connections.fetch_add(1, Ordering::SeqCst);
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    serve_connection(&inner, stream, peer).await;
                    inner.live_connections.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Err(err) => {
                tracing::error!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

enum HeadOutcome {
    Head(RequestHead),
    /// Clean close between requests.
    Eof,
    Malformed,
    Failed,
}

/// Most bytes a request head (request line plus headers) may occupy before
/// the connection is rejected.
const MAX_HEAD_LEN: usize = 16 * 1024;

async fn read_head(inner: &DaemonInner, stream: &mut Stream, buf: &mut BytesMut) -> HeadOutcome {
    loop {
        match parser::parse_request_head(&buf[..]) {
            Ok((head, consumed)) => {
                buf.advance(consumed);
                return HeadOutcome::Head(head);
            }
            Err(ParseError::Incomplete) => {
                if buf.len() > MAX_HEAD_LEN {
                    tracing::debug!("request head exceeds {MAX_HEAD_LEN} bytes");
                    return HeadOutcome::Malformed;
                }
            }
            Err(err) => {
                tracing::debug!(error = ?err, "malformed request head");
                return HeadOutcome::Malformed;
            }
        }

        match read_with_idle(inner, stream, buf).await {
            Ok(0) => {
                return if buf.is_empty() {
                    HeadOutcome::Eof
                } else {
                    HeadOutcome::Malformed
                };
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(error = %err, "connection lost while reading head");
                return HeadOutcome::Failed;
            }
        }
    }
}

async fn read_with_idle(
    inner: &DaemonInner,
    stream: &mut Stream,
    buf: &mut BytesMut,
) -> io::Result<usize> {
    match inner.idle_timeout {
        Some(dur) => match timeout(dur, stream.read_buf(buf)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
        },
        None => stream.read_buf(buf).await,
    }
}

fn resolve_client_addr(
    mode: ClientAddrMode,
    headers: &HashMap<String, String>,
    peer: &str,
) -> String {
    let header = match mode {
        ClientAddrMode::Socket => None,
        ClientAddrMode::XForwardedFor => headers.get("x-forwarded-for"),
        ClientAddrMode::XRealIp => headers.get("x-real-ip"),
    };
    header.cloned().unwrap_or_else(|| peer.to_string())
}

fn wants_keep_alive(head: &RequestHead) -> bool {
    match head.headers.get("connection").map(|v| v.as_str()) {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => head.version != "HTTP/1.0",
    }
}

fn build_request(
    inner: &DaemonInner,
    head: RequestHead,
    peer: &str,
) -> Result<RequestInfo, (u16, &'static str)> {
    if !head.target.starts_with('/') {
        return Err((400, "malformed request target"));
    }
    if head.headers.contains_key("transfer-encoding") {
        return Err((400, "chunked request bodies are not supported"));
    }

    let (method, headers_only) = if head.method == "HEAD" {
        (Method::Get, true)
    } else {
        match Method::parse(&head.method) {
            Some(method) => (method, false),
            None => return Err((405, "")),
        }
    };

    let (path, query) = match head.target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (head.target.clone(), None),
    };

    let client_addr = resolve_client_addr(inner.client_addr_mode, &head.headers, peer);

    let accept_mask = encoding::parse_acceptable_encodings(
        head.headers.get("accept-encoding").map(|v| v.as_str()),
    );
    let encoding = match encoding::negotiate(accept_mask, &[Encoding::Gzip]) {
        Some(encoding) => encoding,
        None => return Err((406, "")),
    };

    Ok(RequestInfo {
        method,
        headers_only,
        path,
        query,
        headers: head.headers,
        client_addr,
        encoding,
        accept_mask,
    })
}

async fn write_error_page(stream: &mut Stream, code: u16, details: &str) {
    let page = Response::error_page(code, details);
    let _ = stream.write_all(&writer::serialize_response(&page, false)).await;
}

async fn serve_connection(inner: &Arc<DaemonInner>, mut stream: Stream, peer: String) {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        let head = match read_head(inner, &mut stream, &mut buf).await {
            HeadOutcome::Head(head) => head,
            HeadOutcome::Eof => return,
            HeadOutcome::Malformed => {
                write_error_page(&mut stream, 400, "").await;
                return;
            }
            HeadOutcome::Failed => return,
        };

        if !inner.running.load(Ordering::SeqCst) {
            write_error_page(&mut stream, 503, "Server is shutting down").await;
            return;
        }

        let keep_alive = wants_keep_alive(&head);
        let body_len = head.content_length;

        let request = match build_request(inner, head, &peer) {
            Ok(request) => request,
            Err((code, details)) => {
                write_error_page(&mut stream, code, details).await;
                if keep_alive && body_len == 0 {
                    continue;
                }
                return;
            }
        };

        let io = Arc::new(RequestIo::new(request));
        let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
        inner.requests.lock().unwrap().insert(id, Arc::clone(&io));

        let next = drive_request(inner, stream, &mut buf, &io, body_len, keep_alive).await;
        inner.requests.lock().unwrap().remove(&id);

        match next {
            Some(returned) => stream = returned,
            None => return,
        }
    }
}

/// Schedules the pending continuation if the request sits idle. The pool
/// wrapper hands the phase back to Idle afterwards, or drops the last Arc if
/// the transport tore the connection down in the meantime.
fn run_next(inner: &Arc<DaemonInner>, io: &Arc<RequestIo>, s: &mut Shared) {
    if s.phase != Phase::Idle {
        return;
    }
    let Some(func) = s.pending.take() else {
        return;
    };

    let pool_io = Arc::clone(io);
    let pool_inner = Arc::clone(inner);
    let submitted = inner.pool.submit(move || {
        if pool_inner.running.load(Ordering::SeqCst)
            && catch_unwind(AssertUnwindSafe(func)).is_err()
        {
            pool_io.record_error("continuation panicked");
        }

        let mut s = pool_io.shared.lock().unwrap();
        match s.phase {
            // Transport already tore down; dropping the Arc frees the state.
            Phase::Zombie => {}
            // Upgraded connections belong to the websocket threads now.
            Phase::WebSocket => {}
            _ => {
                s.phase = Phase::Idle;
                pool_io.resume_locked(&mut s);
            }
        }
    });

    if submitted {
        s.phase = Phase::Async;
    } else {
        tracing::warn!("async pool rejected continuation");
    }
}

enum Step {
    Again,
    Feed(usize),
    Respond,
    StreamBody,
    Upgrade,
    Suspend,
    Abort,
}

/// The transport loop for one request: body delivery, suspend/resume, and the
/// final response. Returns the stream to serve another request on, or `None`
/// when the connection is done (closed, aborted or upgraded).
async fn drive_request(
    inner: &Arc<DaemonInner>,
    mut stream: Stream,
    buf: &mut BytesMut,
    io: &Arc<RequestIo>,
    mut body_remaining: usize,
    keep_alive: bool,
) -> Option<Stream> {
    // Sync phase: the handler runs exactly once, on this task.
    let run = catch_unwind(AssertUnwindSafe(|| (inner.handler)(io.request(), io)));
    if run.is_err() {
        io.record_error("handler panicked");
        io.attach_error(500, None);
    }
    io.finish_sync();

    loop {
        let step = {
            let mut s = io.shared.lock().unwrap();
            run_next(inner, io, &mut s);

            if s.phase == Phase::Zombie {
                Step::Abort
            } else if s.phase == Phase::WebSocket {
                Step::Upgrade
            } else if s.streaming {
                Step::StreamBody
            } else if s.phase == Phase::Idle {
                Step::Respond
            } else if s.read_want > s.read_staged.len() && body_remaining > 0 {
                Step::Feed(s.read_want - s.read_staged.len())
            } else if s.read_want > 0 && body_remaining == 0 && !s.read_eof {
                s.read_eof = true;
                io.read_cv.notify_all();
                Step::Again
            } else {
                s.suspended = true;
                Step::Suspend
            }
        };

        match step {
            Step::Again => {}

            // Torn down already (daemon shutdown); nothing left to send.
            Step::Abort => return None,

            Step::Suspend => {
                io.resume.notified().await;
                io.shared.lock().unwrap().suspended = false;
            }

            Step::Feed(want) => {
                if !buf.is_empty() {
                    // Pipelined body bytes already buffered behind the head.
                    let n = want.min(buf.len()).min(body_remaining);
                    let bytes = buf.split_to(n);
                    body_remaining -= n;

                    let mut s = io.shared.lock().unwrap();
                    s.read_staged.extend_from_slice(&bytes);
                    io.read_cv.notify_all();
                } else {
                    let mut tmp = vec![0u8; want.min(body_remaining).min(PULL_CHUNK)];
                    let result = match inner.idle_timeout {
                        Some(dur) => match timeout(dur, stream.read(&mut tmp)).await {
                            Ok(result) => result,
                            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
                        },
                        None => stream.read(&mut tmp).await,
                    };

                    match result {
                        Ok(n) if n > 0 => {
                            body_remaining -= n;
                            let mut s = io.shared.lock().unwrap();
                            s.read_staged.extend_from_slice(&tmp[..n]);
                            io.read_cv.notify_all();
                        }
                        Ok(_) | Err(_) => {
                            tracing::debug!(
                                client = %io.request().client_addr,
                                "client went away mid-body"
                            );
                            io.complete();
                            return None;
                        }
                    }
                }
            }

            Step::Respond => {
                let (response, headers_only) = io.take_attached_response();
                let status = response.status;
                let data = writer::serialize_response(&response, headers_only);

                if stream.write_all(&data).await.is_err() {
                    io.complete();
                    return None;
                }

                tracing::info!(
                    client = %io.request().client_addr,
                    method = io.request().method.as_str(),
                    path = %io.request().path,
                    status,
                    "request served"
                );

                io.complete();
                return finish_keep_alive(inner, stream, keep_alive, body_remaining);
            }

            Step::StreamBody => {
                return stream_response(inner, io, stream, keep_alive, body_remaining).await;
            }

            Step::Upgrade => {
                perform_upgrade(io, stream).await;
                return None;
            }
        }
    }
}

fn finish_keep_alive(
    inner: &DaemonInner,
    stream: Stream,
    keep_alive: bool,
    body_remaining: usize,
) -> Option<Stream> {
    // An undrained body would desynchronize the next request on this
    // connection, so close instead of draining.
    if keep_alive && body_remaining == 0 && inner.running.load(Ordering::SeqCst) {
        Some(stream)
    } else {
        None
    }
}

enum Pull {
    Chunk(Vec<u8>),
    Suspend,
    Finished,
    Truncated,
    Abort,
}

/// Pull-mode response streaming: drains the engine's write buffer into
/// chunked frames, waking blocked writers when the buffer empties.
async fn stream_response(
    inner: &Arc<DaemonInner>,
    io: &Arc<RequestIo>,
    mut stream: Stream,
    keep_alive: bool,
    body_remaining: usize,
) -> Option<Stream> {
    let (status, headers) = io.take_stream_head();
    let headers_only = io.request().headers_only;

    let head = writer::serialize_head(status, &headers, Framing::Chunked);
    if stream.write_all(&head).await.is_err() {
        io.complete();
        return None;
    }

    loop {
        let pull = {
            let mut s = io.shared.lock().unwrap();
            run_next(inner, io, &mut s);

            if !s.write_buf.is_empty() {
                let take = s.write_buf.len().min(PULL_CHUNK);
                let chunk: Vec<u8> = s.write_buf.drain(..take).collect();
                if s.write_buf.is_empty() {
                    io.write_cv.notify_all();
                }
                Pull::Chunk(chunk)
            } else if s.write_eof {
                Pull::Finished
            } else if s.phase == Phase::Zombie {
                Pull::Abort
            } else if s.phase != Phase::Async {
                Pull::Truncated
            } else {
                s.suspended = true;
                Pull::Suspend
            }
        };

        match pull {
            Pull::Chunk(chunk) => {
                if !headers_only
                    && stream.write_all(&writer::encode_chunk(&chunk)).await.is_err()
                {
                    io.complete();
                    return None;
                }
            }
            Pull::Suspend => {
                io.resume.notified().await;
                io.shared.lock().unwrap().suspended = false;
            }
            Pull::Finished => break,
            Pull::Truncated => {
                // The writer was dropped without finish(); the chunked body
                // has no terminator, so the client sees the truncation.
                tracing::error!(
                    client = %io.request().client_addr,
                    "truncated response stream"
                );
                io.complete();
                return None;
            }
            Pull::Abort => {
                io.complete();
                return None;
            }
        }
    }

    if !headers_only && stream.write_all(writer::TERMINAL_CHUNK).await.is_err() {
        io.complete();
        return None;
    }

    tracing::info!(
        client = %io.request().client_addr,
        method = io.request().method.as_str(),
        path = %io.request().path,
        status,
        "request served (streamed)"
    );

    io.complete();
    finish_keep_alive(inner, stream, keep_alive, body_remaining)
}

/// Answers the websocket handshake and hands the raw socket to the engine
/// side. From here on the connection belongs to the continuation and the
/// dedicated reader thread.
async fn perform_upgrade(io: &Arc<RequestIo>, mut stream: Stream) {
    let key = io
        .request()
        .header("sec-websocket-key")
        .unwrap_or_default()
        .to_string();
    let accept = ws::accept_key(&key);

    let mut headers = {
        let mut s = io.shared.lock().unwrap();
        std::mem::take(&mut s.headers)
    };
    headers.push(("Upgrade".to_string(), "websocket".to_string()));
    headers.push(("Connection".to_string(), "Upgrade".to_string()));
    headers.push(("Sec-WebSocket-Accept".to_string(), accept));

    let head = writer::serialize_head(101, &headers, Framing::None);
    if stream.write_all(&head).await.is_err() {
        io.force_zombie();
        return;
    }

    match stream.into_raw() {
        Ok(raw) => {
            let mut s = io.shared.lock().unwrap();
            s.ws_socket = Some(raw);
            io.ws_cv.notify_all();

            tracing::info!(
                client = %io.request().client_addr,
                path = %io.request().path,
                "connection upgraded to websocket"
            );
        }
        Err(err) => {
            tracing::error!(error = %err, "websocket socket handoff failed");
            io.force_zombie();
        }
    }
}
