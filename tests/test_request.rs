use std::collections::HashMap;

use warden::{Encoding, Method, RequestInfo};

fn request_with_headers(headers: HashMap<String, String>) -> RequestInfo {
    RequestInfo {
        method: Method::Get,
        headers_only: false,
        path: "/".to_string(),
        query: None,
        headers,
        client_addr: "127.0.0.1".to_string(),
        encoding: Encoding::Identity,
        accept_mask: 0b111,
    }
}

#[test]
fn test_request_header_lookup_is_case_insensitive() {
    let mut headers = HashMap::new();
    headers.insert("host".to_string(), "example.com".to_string());
    headers.insert("content-type".to_string(), "application/json".to_string());

    let req = request_with_headers(headers);

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("CONTENT-TYPE"), Some("application/json"));
    assert_eq!(req.header("missing"), None);
}

#[test]
fn test_request_query_value_decoding() {
    let mut req = request_with_headers(HashMap::new());
    req.query = Some("q=hello%20world&page=2".to_string());

    assert_eq!(req.query_value("q").as_deref(), Some("hello world"));
    assert_eq!(req.query_value("page").as_deref(), Some("2"));
    assert_eq!(req.query_value("missing"), None);
}

#[test]
fn test_request_query_value_without_query_string() {
    let req = request_with_headers(HashMap::new());
    assert_eq!(req.query_value("q"), None);
}

#[test]
fn test_request_cookie_lookup() {
    let mut headers = HashMap::new();
    headers.insert(
        "cookie".to_string(),
        "session=abc123; theme=dark".to_string(),
    );

    let req = request_with_headers(headers);

    assert_eq!(req.cookie_value("session"), Some("abc123"));
    assert_eq!(req.cookie_value("theme"), Some("dark"));
    assert_eq!(req.cookie_value("missing"), None);
}

#[test]
fn test_request_cookie_skips_malformed_pairs() {
    let mut headers = HashMap::new();
    headers.insert("cookie".to_string(), "garbage; session=abc".to_string());

    let req = request_with_headers(headers);

    assert_eq!(req.cookie_value("session"), Some("abc"));
}

#[test]
fn test_method_parse_round_trip() {
    for token in ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"] {
        let method = Method::parse(token).unwrap();
        assert_eq!(method.as_str(), token);
    }
}

#[test]
fn test_method_parse_rejects_unknown_and_head() {
    // HEAD is not a handler-visible method; the daemon maps it to Get with
    // headers_only set
    assert_eq!(Method::parse("HEAD"), None);
    assert_eq!(Method::parse("BREW"), None);
    assert_eq!(Method::parse("get"), None);
}
