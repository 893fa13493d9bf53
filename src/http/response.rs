/// Standard reason phrase for an HTTP status code.
///
/// Covers the codes the engine itself produces plus the common handler ones.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// How the response body is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Fixed payload, sent with Content-Length.
    Bytes(Vec<u8>),
    /// No payload and no Content-Length (status-only responses).
    Empty,
}

/// An attached (non-streamed) response: status, headers and a fixed body.
///
/// Streamed responses never materialize as a `Response`; their bytes are
/// pulled straight out of the engine's write buffer.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    /// Headers in insertion order; duplicates allowed (Set-Cookie).
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    pub fn new(status: u16, body: Body) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn text(status: u16, text: impl Into<String>) -> Self {
        let mut response = Response::new(status, Body::Bytes(text.into().into_bytes()));
        response.headers.push(("Content-Type".to_string(), "text/plain".to_string()));
        response
    }

    /// Default error page: `"Error <code>: <reason phrase>\n<details>"`.
    pub fn error_page(status: u16, details: &str) -> Self {
        let page = format!("Error {}: {}\n{}", status, reason_phrase(status), details);
        Response::text(status, page)
    }
}
