use std::collections::HashMap;

/// Parsed request head, before the daemon turns it into a
/// [`crate::http::request::RequestInfo`].
///
/// The body is deliberately not parsed here: body bytes stay on the socket and
/// are pulled on demand by the request lifecycle engine, so a handler that
/// never reads them costs no buffering.
#[derive(Debug)]
pub struct RequestHead {
    /// Method token as sent by the client (HEAD included).
    pub method: String,
    /// Request target (path + optional query string).
    pub target: String,
    pub version: String,
    /// Headers with lowercased keys.
    pub headers: HashMap<String, String>,
    /// Declared body length, from Content-Length (0 when absent).
    pub content_length: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidHeader,
    InvalidContentLength,
    /// Not enough bytes buffered yet, read more and retry.
    Incomplete,
}

/// Tries to parse a request head from the start of `buf`.
///
/// Returns the head and the number of bytes consumed (up to and including the
/// blank line). `Err(Incomplete)` means the caller should read more data.
pub fn parse_request_head(buf: &[u8]) -> Result<(RequestHead, usize), ParseError> {
    let headers_end = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    let header_bytes = &buf[..headers_end];

    let headers_str = std::str::from_utf8(header_bytes).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();

    let method = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    // Headers
    let mut headers = HashMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;

        headers.insert(
            key.trim().to_ascii_lowercase(),
            value.trim().to_string(),
        );
    }

    let content_length = headers
        .get("content-length")
        .map(|v| v.parse::<usize>().map_err(|_| ParseError::InvalidContentLength))
        .transpose()?
        .unwrap_or(0);

    let head = RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers,
        content_length,
    };

    Ok((head, headers_end + 4))
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
