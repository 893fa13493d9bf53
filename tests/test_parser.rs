use warden::http::parser::{parse_request_head, ParseError};

#[test]
fn test_parse_simple_get_request() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (head, consumed) = parse_request_head(req).unwrap();

    assert_eq!(head.method, "GET");
    assert_eq!(head.target, "/");
    assert_eq!(head.version, "HTTP/1.1");
    assert_eq!(head.headers.get("host").unwrap(), "example.com");
    assert_eq!(consumed, req.len());
}

#[test]
fn test_parse_consumes_head_only() {
    // The body stays on the wire for the engine to pull on demand
    let req = b"POST /api HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
    let (head, consumed) = parse_request_head(req).unwrap();

    assert_eq!(head.method, "POST");
    assert_eq!(head.content_length, 5);
    assert_eq!(consumed, req.len() - 5);
    assert_eq!(&req[consumed..], b"hello");
}

#[test]
fn test_parse_multiple_headers_lowercases_keys() {
    let req =
        b"GET /path HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test-client\r\nAccept: */*\r\n\r\n";
    let (head, _) = parse_request_head(req).unwrap();

    assert_eq!(head.headers.get("host").unwrap(), "example.com");
    assert_eq!(head.headers.get("user-agent").unwrap(), "test-client");
    assert_eq!(head.headers.get("accept").unwrap(), "*/*");
    assert!(!head.headers.contains_key("Host"));
}

#[test]
fn test_parse_keeps_query_in_target() {
    let req = b"GET /search?q=rust HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let (head, _) = parse_request_head(req).unwrap();

    assert_eq!(head.target, "/search?q=rust");
}

#[test]
fn test_parse_incomplete_without_blank_line() {
    let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n";
    let result = parse_request_head(req);

    assert!(matches!(result, Err(ParseError::Incomplete)));
}

#[test]
fn test_parse_partial_body_is_still_complete() {
    // Head parsing does not wait for body bytes
    let req = b"POST /api HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello";
    let (head, _) = parse_request_head(req).unwrap();

    assert_eq!(head.content_length, 10);
}

#[test]
fn test_parse_unknown_method_is_kept_verbatim() {
    // The parser does not judge methods; the daemon answers 405 later
    let req = b"BREW /pot HTTP/1.1\r\n\r\n";
    let (head, _) = parse_request_head(req).unwrap();

    assert_eq!(head.method, "BREW");
}

#[test]
fn test_parse_malformed_header() {
    let req = b"GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n";
    let result = parse_request_head(req);

    assert!(matches!(result, Err(ParseError::InvalidHeader)));
}

#[test]
fn test_parse_bad_content_length() {
    let req = b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n";
    let result = parse_request_head(req);

    assert!(matches!(result, Err(ParseError::InvalidContentLength)));
}

#[test]
fn test_parse_missing_content_length_means_zero() {
    let req = b"POST /api HTTP/1.1\r\nHost: localhost\r\n\r\n";
    let (head, _) = parse_request_head(req).unwrap();

    assert_eq!(head.content_length, 0);
}

#[test]
fn test_parse_header_values_are_trimmed() {
    let req = b"GET / HTTP/1.1\r\nContent-Type:   application/json  \r\n\r\n";
    let (head, _) = parse_request_head(req).unwrap();

    assert_eq!(head.headers.get("content-type").unwrap(), "application/json");
}
