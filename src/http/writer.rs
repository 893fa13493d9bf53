//! Response serialization: status line, headers and chunked body framing.
//!
//! Pure byte-level helpers; the daemon decides what to write and when.

use crate::http::response::{reason_phrase, Body, Response};

const HTTP_VERSION: &str = "HTTP/1.1";

/// How the response body will be framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Fixed body with Content-Length.
    Length(usize),
    /// Streamed body with Transfer-Encoding: chunked.
    Chunked,
    /// No framing headers at all (101 upgrade responses).
    None,
}

/// Serializes the status line and headers, adding the framing header.
pub fn serialize_head(status: u16, headers: &[(String, String)], framing: Framing) -> Vec<u8> {
    let mut buf = Vec::new();

    let status_line = format!("{} {} {}\r\n", HTTP_VERSION, status, reason_phrase(status));
    buf.extend_from_slice(status_line.as_bytes());

    for (k, v) in headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    match framing {
        Framing::Length(len) => {
            buf.extend_from_slice(format!("Content-Length: {len}\r\n").as_bytes());
        }
        Framing::Chunked => {
            buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        Framing::None => {}
    }

    buf.extend_from_slice(b"\r\n");
    buf
}

/// Serializes a complete attached response.
///
/// For `headers_only` requests (HEAD) the framing headers are kept but the
/// body is dropped.
pub fn serialize_response(response: &Response, headers_only: bool) -> Vec<u8> {
    match &response.body {
        Body::Bytes(body) => {
            let mut buf = serialize_head(
                response.status,
                &response.headers,
                Framing::Length(body.len()),
            );
            if !headers_only {
                buf.extend_from_slice(body);
            }
            buf
        }
        Body::Empty => {
            let mut buf = serialize_head(response.status, &response.headers, Framing::Chunked);
            if !headers_only {
                buf.extend_from_slice(TERMINAL_CHUNK);
            }
            buf
        }
    }
}

/// Frames one chunk of a streamed body.
pub fn encode_chunk(data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + 16);
    buf.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
    buf
}

/// Last chunk of a streamed body.
pub const TERMINAL_CHUNK: &[u8] = b"0\r\n\r\n";
