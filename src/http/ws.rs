//! WebSocket subsystem: handshake plumbing, RFC 6455 frame codec and blocking
//! message I/O over the upgraded socket.
//!
//! After a continuation calls [`RequestIo::upgrade_websocket`], the transport
//! task answers the handshake and hands the raw socket over; from then on the
//! connection belongs to the engine side. A dedicated reader thread pulls
//! frames off the socket into a bounded message queue signaled on `ws_cv`,
//! while writes go straight to the socket under a write lock. Any raw-socket
//! failure is fatal and forces the Zombie phase.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::Error;
use crate::http::io::{Phase, RequestIo, WS_QUEUE_LIMIT};

/// One complete websocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsMessage {
    pub data: Vec<u8>,
    /// Text frame when true, binary otherwise.
    pub text: bool,
}

/// Raw bidirectional socket handed over by the transport on upgrade.
#[derive(Debug)]
pub enum WsSocket {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

impl WsSocket {
    fn try_clone(&self) -> io::Result<WsSocket> {
        match self {
            WsSocket::Tcp(s) => s.try_clone().map(WsSocket::Tcp),
            WsSocket::Unix(s) => s.try_clone().map(WsSocket::Unix),
        }
    }

    fn shutdown(&self) {
        let _ = match self {
            WsSocket::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
            WsSocket::Unix(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }
}

impl Read for WsSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            WsSocket::Tcp(s) => s.read(buf),
            WsSocket::Unix(s) => s.read(buf),
        }
    }
}

impl Write for WsSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            WsSocket::Tcp(s) => s.write(buf),
            WsSocket::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            WsSocket::Tcp(s) => s.flush(),
            WsSocket::Unix(s) => s.flush(),
        }
    }
}

/// Fixed GUID from RFC 6455 §4.2.2.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest message the reader thread will assemble.
const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

const OP_CONTINUATION: u8 = 0x0;
const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// Computes the Sec-WebSocket-Accept value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

struct Frame {
    opcode: u8,
    fin: bool,
    payload: Vec<u8>,
}

/// Reads one client frame. Client frames must be masked.
fn read_frame(socket: &mut WsSocket) -> io::Result<Frame> {
    let mut header = [0u8; 2];
    socket.read_exact(&mut header)?;

    let fin = header[0] & 0x80 != 0;
    let opcode = header[0] & 0x0F;
    let masked = header[1] & 0x80 != 0;

    if !masked {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "client frame is not masked",
        ));
    }

    let len = match header[1] & 0x7F {
        126 => {
            let mut ext = [0u8; 2];
            socket.read_exact(&mut ext)?;
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            socket.read_exact(&mut ext)?;
            let len = u64::from_be_bytes(ext);
            usize::try_from(len)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "oversized frame"))?
        }
        len => len as usize,
    };
    if len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "oversized frame"));
    }

    let mut mask = [0u8; 4];
    socket.read_exact(&mut mask)?;

    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload)?;
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }

    Ok(Frame { opcode, fin, payload })
}

/// Writes one unmasked server frame.
fn write_frame(socket: &mut WsSocket, opcode: u8, payload: &[u8]) -> io::Result<()> {
    let mut head = Vec::with_capacity(10);
    head.push(0x80 | opcode);

    if payload.len() < 126 {
        head.push(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        head.push(126);
        head.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        head.push(127);
        head.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    socket.write_all(&head)?;
    socket.write_all(payload)?;
    socket.flush()
}

/// Blocking message reader for an upgraded connection.
pub struct WsReader {
    io: Arc<RequestIo>,
}

impl WsReader {
    /// Blocks until a complete message arrives. Returns `None` on a clean
    /// close, `ConnectionAborted` once the connection is torn down.
    pub fn read_message(&mut self) -> io::Result<Option<WsMessage>> {
        let mut s = self.io.shared.lock().unwrap();
        loop {
            if let Some(msg) = s.ws_queue.pop_front() {
                // Room freed for the reader thread.
                self.io.ws_cv.notify_all();
                return Ok(Some(msg));
            }
            if s.phase == Phase::Zombie {
                return Err(Error::ConnectionAborted.into());
            }
            if s.ws_eof {
                return Ok(None);
            }
            s = self.io.ws_cv.wait(s).unwrap();
        }
    }
}

/// Blocking message writer for an upgraded connection.
pub struct WsWriter {
    io: Arc<RequestIo>,
    socket: Arc<Mutex<WsSocket>>,
    default_text: bool,
}

impl WsWriter {
    /// Writes one message in the mode chosen at upgrade time.
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        self.write_message(data, self.default_text)
    }

    /// Writes one message frame. A raw-socket failure is fatal to the
    /// connection.
    pub fn write_message(&self, data: &[u8], text: bool) -> io::Result<()> {
        if self.io.current_phase() == Phase::Zombie {
            return Err(Error::ConnectionAborted.into());
        }

        let opcode = if text { OP_TEXT } else { OP_BINARY };
        let result = write_frame(&mut self.socket.lock().unwrap(), opcode, data);
        if let Err(err) = &result {
            self.io.record_error(format!("websocket write failed: {err}"));
            self.io.force_zombie();
        }
        result
    }

    /// Sends a close frame; best effort.
    pub fn close(&self) -> io::Result<()> {
        write_frame(&mut self.socket.lock().unwrap(), OP_CLOSE, &[])
    }
}

impl Drop for WsWriter {
    /// The writer going away ends the connection: shutting the socket down
    /// unblocks the reader thread so it can exit and release its handle.
    fn drop(&mut self) {
        self.socket.lock().unwrap().shutdown();
        self.io.force_zombie();
    }
}

impl RequestIo {
    /// Upgrades the connection to websocket mode. Must be called from a
    /// continuation; blocks until the transport hands the raw socket over.
    ///
    /// One-way transition: after this, the normal body adapters are invalid
    /// for the rest of the connection's life.
    pub fn upgrade_websocket(self: &Arc<Self>, text: bool) -> Result<(WsReader, WsWriter), Error> {
        let key_present = self.request().header("sec-websocket-key").is_some();
        if !key_present {
            self.attach_error(400, Some("missing Sec-WebSocket-Key header"));
            return Err(Error::Upgrade("missing Sec-WebSocket-Key header".to_string()));
        }

        let socket = {
            let mut s = self.shared.lock().unwrap();
            if s.phase == Phase::Zombie {
                return Err(Error::ConnectionAborted);
            }
            debug_assert!(s.phase == Phase::Async);

            s.phase = Phase::WebSocket;
            self.resume_locked(&mut s);

            loop {
                if s.phase == Phase::Zombie {
                    return Err(Error::ConnectionAborted);
                }
                if let Some(socket) = s.ws_socket.take() {
                    break socket;
                }
                s = self.ws_cv.wait(s).unwrap();
            }
        };

        let read_half = socket
            .try_clone()
            .map_err(|err| Error::Upgrade(format!("cannot clone upgraded socket: {err}")))?;
        let socket = Arc::new(Mutex::new(socket));

        spawn_reader(Arc::clone(self), read_half, Arc::clone(&socket))
            .map_err(|err| Error::Upgrade(format!("cannot spawn reader thread: {err}")))?;

        let reader = WsReader { io: Arc::clone(self) };
        let writer = WsWriter {
            io: Arc::clone(self),
            socket,
            default_text: text,
        };
        Ok((reader, writer))
    }
}

/// Dedicated upgraded-socket I/O thread: assembles frames into messages and
/// answers pings.
fn spawn_reader(
    io: Arc<RequestIo>,
    mut socket: WsSocket,
    write_half: Arc<Mutex<WsSocket>>,
) -> io::Result<()> {
    std::thread::Builder::new()
        .name("ws-read".to_string())
        .spawn(move || {
            let mut message: Vec<u8> = Vec::new();
            let mut message_text = false;

            loop {
                let frame = match read_frame(&mut socket) {
                    Ok(frame) => frame,
                    Err(err) => {
                        if err.kind() != io::ErrorKind::UnexpectedEof {
                            io.record_error(format!("websocket read failed: {err}"));
                        }
                        socket.shutdown();
                        io.force_zombie();
                        return;
                    }
                };

                match frame.opcode {
                    OP_PING => {
                        let _ = write_frame(
                            &mut write_half.lock().unwrap(),
                            OP_PONG,
                            &frame.payload,
                        );
                        continue;
                    }
                    OP_PONG => continue,
                    OP_CLOSE => {
                        let _ = write_frame(&mut write_half.lock().unwrap(), OP_CLOSE, &[]);

                        let mut s = io.shared.lock().unwrap();
                        s.ws_eof = true;
                        io.ws_cv.notify_all();
                        return;
                    }
                    OP_TEXT | OP_BINARY => {
                        message_text = frame.opcode == OP_TEXT;
                        message = frame.payload;
                    }
                    OP_CONTINUATION => {
                        message.extend_from_slice(&frame.payload);
                    }
                    other => {
                        io.record_error(format!("unknown websocket opcode {other:#x}"));
                        socket.shutdown();
                        io.force_zombie();
                        return;
                    }
                }

                if message.len() > MAX_MESSAGE_LEN {
                    io.record_error("websocket message is too big");
                    socket.shutdown();
                    io.force_zombie();
                    return;
                }

                if frame.fin {
                    let msg = WsMessage {
                        data: std::mem::take(&mut message),
                        text: message_text,
                    };

                    let mut s = io.shared.lock().unwrap();
                    while s.ws_queue.len() >= WS_QUEUE_LIMIT && s.phase == Phase::WebSocket {
                        s = io.ws_cv.wait(s).unwrap();
                    }
                    if s.phase != Phase::WebSocket {
                        return;
                    }
                    s.ws_queue.push_back(msg);
                    io.ws_cv.notify_all();
                }
            }
        })
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        // Key/accept pair from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }
}
