use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use warden::{Config, Daemon, RequestIo, RequestInfo, SocketKind};

fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn start<F>(handler: F) -> (Daemon, std::net::SocketAddr)
where
    F: Fn(&RequestInfo, &Arc<RequestIo>) + Send + Sync + 'static,
{
    let config = Config {
        socket: SocketKind::Ipv4,
        port: free_port(),
        max_connections: 64,
        idle_timeout: 5,
        threads: 2,
        async_threads: 4,
        ..Config::default()
    };

    let mut daemon = Daemon::new();
    daemon.start(&config, handler).unwrap();
    let port = daemon.local_addr().unwrap().port();
    (daemon, ([127, 0, 0, 1], port).into())
}

fn connect(addr: std::net::SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
    })
}

fn read_chunked(stream: &mut TcpStream) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while !line.ends_with(b"\r\n") {
            stream.read_exact(&mut byte).unwrap();
            line.push(byte[0]);
        }
        let size =
            usize::from_str_radix(std::str::from_utf8(&line).unwrap().trim(), 16).unwrap();

        // Chunk data plus its trailing CRLF
        let mut chunk = vec![0u8; size + 2];
        stream.read_exact(&mut chunk).unwrap();
        if size == 0 {
            return body;
        }
        body.extend_from_slice(&chunk[..size]);
    }
}

fn read_response(stream: &mut TcpStream) -> (u16, String, Vec<u8>) {
    let head = read_head(stream);
    let status: u16 = head.split_whitespace().nth(1).unwrap().parse().unwrap();

    let body = if let Some(len) = header_value(&head, "content-length") {
        let mut body = vec![0u8; len.parse().unwrap()];
        stream.read_exact(&mut body).unwrap();
        body
    } else if header_value(&head, "transfer-encoding").as_deref() == Some("chunked") {
        read_chunked(stream)
    } else {
        let mut body = Vec::new();
        stream.read_to_end(&mut body).unwrap();
        body
    };

    (status, head, body)
}

fn echo_handler(_request: &RequestInfo, io: &Arc<RequestIo>) {
    let handle = Arc::clone(io);
    io.run_async(move || {
        let io = handle;
        let encoding = io.request().encoding;
        io.add_encoding_header(encoding);

        // Drain the upload before the first write; reads are invalid once
        // output streaming starts
        let mut body = Vec::new();
        let mut reader = io.open_for_read(1024 * 1024);
        if reader.read_to_end(&mut body).is_err() {
            return;
        }

        let mut writer = io.open_for_write(200, encoding);
        if writer.write_all(&body).is_err() {
            return;
        }
        let _ = writer.finish();
    });
}

#[test]
fn test_basic_get_round_trip() {
    let (_daemon, addr) = start(|_, io| io.attach_text(200, "hello engine"));

    let mut stream = connect(addr);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (status, head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(header_value(&head, "content-type").as_deref(), Some("text/plain"));
    assert_eq!(body, b"hello engine");
}

#[test]
fn test_head_request_advertises_length_without_body() {
    let (_daemon, addr) = start(|_, io| io.attach_text(200, "hello engine"));

    let mut stream = connect(addr);
    stream
        .write_all(b"HEAD / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let head = read_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"));
    assert_eq!(header_value(&head, "content-length").as_deref(), Some("12"));

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "HEAD response must not carry a body");
}

#[test]
fn test_unknown_method_gets_405() {
    let (_daemon, addr) = start(|_, io| io.attach_text(200, "unreachable"));

    let mut stream = connect(addr);
    stream
        .write_all(b"BREW /pot HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 405);
    assert!(body.starts_with(b"Error 405: Method Not Allowed"));
}

#[test]
fn test_unacceptable_encoding_gets_406() {
    let (_daemon, addr) = start(|_, io| io.attach_text(200, "unreachable"));

    let mut stream = connect(addr);
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\n\
              Accept-Encoding: gzip;q=0, deflate;q=0, identity;q=0\r\n\
              Connection: close\r\n\r\n",
        )
        .unwrap();

    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 406);
    assert!(body.starts_with(b"Error 406: Not Acceptable"));
}

#[test]
fn test_streamed_echo_identity() {
    let (_daemon, addr) = start(echo_handler);

    let payload = b"hello streamed echo";
    let mut stream = connect(addr);
    stream
        .write_all(
            format!(
                "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\
                 Accept-Encoding: identity\r\nConnection: close\r\n\r\n",
                payload.len()
            )
            .as_bytes(),
        )
        .unwrap();
    stream.write_all(payload).unwrap();

    let (status, head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(header_value(&head, "transfer-encoding").as_deref(), Some("chunked"));
    assert_eq!(header_value(&head, "content-encoding"), None);
    assert_eq!(body, payload);
}

#[test]
fn test_streamed_echo_gzip() {
    let (_daemon, addr) = start(echo_handler);

    let payload = b"compressible compressible compressible";
    let mut stream = connect(addr);
    stream
        .write_all(
            format!(
                "POST /echo HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\
                 Accept-Encoding: gzip\r\nConnection: close\r\n\r\n",
                payload.len()
            )
            .as_bytes(),
        )
        .unwrap();
    stream.write_all(payload).unwrap();

    let (status, head, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(header_value(&head, "content-encoding").as_deref(), Some("gzip"));

    let mut raw = Vec::new();
    flate2::read::GzDecoder::new(&body[..])
        .read_to_end(&mut raw)
        .unwrap();
    assert_eq!(raw, payload);
}

#[test]
fn test_body_over_cap_gets_413() {
    let (_daemon, addr) = start(|_, io| {
        let handle = Arc::clone(io);
        io.run_async(move || {
            let io = handle;
            let mut reader = io.open_for_read(4);
            let mut sink = Vec::new();
            // Fails past the cap; a 413 page is attached for us
            let _ = reader.read_to_end(&mut sink);
        });
    });

    let body = [0u8; 64];
    let mut stream = connect(addr);
    stream
        .write_all(
            format!(
                "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\
                 Connection: close\r\n\r\n",
                body.len()
            )
            .as_bytes(),
        )
        .unwrap();
    stream.write_all(&body).unwrap();

    let (status, _, page) = read_response(&mut stream);
    assert_eq!(status, 413);
    assert!(page.starts_with(b"Error 413: Payload Too Large"));
}

#[test]
fn test_disconnect_aborts_blocked_read_and_runs_finalizer() {
    let finalized = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));

    let (_daemon, addr) = {
        let finalized = Arc::clone(&finalized);
        let seen = Arc::clone(&seen);
        start(move |_, io| {
            let finalized = Arc::clone(&finalized);
            io.add_finalizer(move || {
                finalized.fetch_add(1, Ordering::SeqCst);
            });

            let handle = Arc::clone(io);
            let seen = Arc::clone(&seen);
            io.run_async(move || {
                let io = handle;
                let mut reader = io.open_for_read(1024 * 1024);
                let mut sink = Vec::new();
                if let Err(err) = reader.read_to_end(&mut sink) {
                    *seen.lock().unwrap() = Some(err.kind());
                }
            });
        })
    };

    let mut stream = connect(addr);
    stream
        .write_all(b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 1000\r\n\r\n")
        .unwrap();
    stream.write_all(&[0u8; 10]).unwrap();
    drop(stream);

    // The engine notices the disconnect, aborts the blocked reader and runs
    // the finalizer exactly once when the last handle drops
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while finalized.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(
        *seen.lock().unwrap(),
        Some(std::io::ErrorKind::ConnectionAborted)
    );
}

#[test]
fn test_keep_alive_serves_multiple_requests() {
    let counter = Arc::new(AtomicUsize::new(0));
    let (_daemon, addr) = {
        let counter = Arc::clone(&counter);
        start(move |_, io| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            io.attach_text(200, format!("request {n}"));
        })
    };

    let mut stream = connect(addr);

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"request 0");

    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 200);
    assert_eq!(body, b"request 1");
}

#[test]
fn test_oversized_request_head_gets_400() {
    let (_daemon, addr) = start(|_, io| io.attach_text(200, "unreachable"));

    let mut stream = connect(addr);
    // A header line that never ends; the daemon must give up instead of
    // buffering it forever
    let mut garbage = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
    garbage.resize(64 * 1024, b'a');
    let _ = stream.write_all(&garbage);

    let (status, _, body) = read_response(&mut stream);
    assert_eq!(status, 400);
    assert!(body.starts_with(b"Error 400: Bad Request"));
}

#[test]
fn test_stop_aborts_in_flight_request() {
    let finalized = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));

    let (mut daemon, addr) = {
        let finalized = Arc::clone(&finalized);
        let seen = Arc::clone(&seen);
        start(move |_, io| {
            let finalized = Arc::clone(&finalized);
            io.add_finalizer(move || {
                finalized.fetch_add(1, Ordering::SeqCst);
            });

            let handle = Arc::clone(io);
            let seen = Arc::clone(&seen);
            io.run_async(move || {
                let io = handle;
                // Slow continuation: the transport suspends while this runs
                std::thread::sleep(Duration::from_millis(500));
                let mut writer = io.open_for_write(200, warden::Encoding::Identity);
                if let Err(err) = writer.write_all(b"too late") {
                    *seen.lock().unwrap() = Some(err.kind());
                }
            });
        })
    };

    let mut stream = connect(addr);
    stream
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    std::thread::sleep(Duration::from_millis(200));

    // Stop while the continuation is still out: the request turns Zombie,
    // the late write fails and the finalizer still runs exactly once
    daemon.stop();

    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_eq!(
        *seen.lock().unwrap(),
        Some(std::io::ErrorKind::ConnectionAborted)
    );
}

#[test]
fn test_stop_is_idempotent_and_closes_the_listener() {
    let (mut daemon, addr) = start(|_, io| io.attach_text(200, "ok"));

    daemon.stop();
    daemon.stop();

    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_websocket_echo() {
    let (_daemon, addr) = start(|_, io| {
        let handle = Arc::clone(io);
        io.run_async(move || {
            let io = handle;
            let (mut reader, writer) = match io.upgrade_websocket(true) {
                Ok(pair) => pair,
                Err(_) => return,
            };
            while let Ok(Some(msg)) = reader.read_message() {
                if writer.write_message(&msg.data, msg.text).is_err() {
                    return;
                }
            }
        });
    });

    let mut stream = connect(addr);
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    let head = read_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 101"));
    assert_eq!(
        header_value(&head, "sec-websocket-accept").as_deref(),
        Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
    );

    // Masked text frame carrying "ping"
    let mask = [0x11u8, 0x22, 0x33, 0x44];
    let mut frame = vec![0x81, 0x84];
    frame.extend_from_slice(&mask);
    frame.extend(b"ping".iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m));
    stream.write_all(&frame).unwrap();

    // Echo comes back unmasked
    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply[..2], &[0x81, 0x04]);
    assert_eq!(&reply[2..], b"ping");

    // Close handshake
    let mut close = vec![0x88, 0x80];
    close.extend_from_slice(&mask);
    stream.write_all(&close).unwrap();

    let mut close_reply = [0u8; 2];
    stream.read_exact(&mut close_reply).unwrap();
    assert_eq!(close_reply, [0x88, 0x00]);
}
