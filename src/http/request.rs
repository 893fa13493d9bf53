use std::collections::HashMap;

use crate::http::encoding::Encoding;

/// HTTP request methods.
///
/// HEAD is not listed: the daemon maps it to `Get` and sets
/// [`RequestInfo::headers_only`] instead, so handlers never special-case it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl Method {
    /// Parses an HTTP method token. Returns `None` for methods the daemon
    /// rejects with 405.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "PATCH" => Some(Method::Patch),
            "DELETE" => Some(Method::Delete),
            "OPTIONS" => Some(Method::Options),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
        }
    }
}

/// Immutable per-request facts handed to the registered handler.
///
/// Built by the daemon from the parsed request head before the handler runs;
/// nothing here changes for the lifetime of the request.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    /// True for HEAD requests (method is set to `Get`).
    pub headers_only: bool,
    /// Request path, without the query string.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query: Option<String>,
    /// Request headers, keys lowercased.
    pub headers: HashMap<String, String>,
    /// Resolved client address ("unix" for local sockets).
    pub client_addr: String,
    /// Content encoding negotiated for the response (gzip preferred).
    pub encoding: Encoding,
    /// Bitmask of encodings the client accepts, see [`crate::http::encoding`].
    pub accept_mask: u32,
}

impl RequestInfo {
    /// Case-insensitive header lookup.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(|v| v.as_str())
    }

    /// Looks up a query-string parameter, percent-decoding it.
    pub fn query_value(&self, key: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Looks up a cookie by name in the Cookie header.
    pub fn cookie_value(&self, key: &str) -> Option<&str> {
        let cookies = self.header("cookie")?;
        for pair in cookies.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            if name.trim() == key {
                return Some(value.trim());
            }
        }
        None
    }
}
