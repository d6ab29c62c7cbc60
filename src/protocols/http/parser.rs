//! HTTP/1.1 request decoder and response encoder.
//!
//! The decoder works on a complete buffer handed over by the connection
//! handler. It never waits for more data and never truncates the body to
//! `Content-Length`: whatever follows the blank line is the body.

use super::types::{Method, Request, Response};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use thiserror::Error;

/// Reasons a buffer could not be decoded into a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty request")]
    Empty,
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("unknown method: {0}")]
    UnknownMethod(String),
    #[error("empty request path")]
    EmptyPath,
}

/// Decode a raw request buffer.
pub fn parse_request(input: &[u8]) -> Result<Request, ParseError> {
    if input.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut lines = Lines::new(input);

    let request_line = lines.next().ok_or(ParseError::Empty)?;
    let request_line = String::from_utf8_lossy(request_line);
    let mut tokens = request_line.split_ascii_whitespace();
    let (method_token, target, _version) = match (tokens.next(), tokens.next(), tokens.next()) {
        (Some(m), Some(t), Some(v)) => (m, t, v),
        _ => return Err(ParseError::MalformedRequestLine),
    };

    let method = Method::parse(method_token);
    if method == Method::Unknown {
        return Err(ParseError::UnknownMethod(method_token.to_string()));
    }

    let (raw_path, query_string) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    let path = percent_decode(raw_path);
    if path.is_empty() {
        return Err(ParseError::EmptyPath);
    }

    let mut headers = HashMap::new();
    let mut saw_terminator = false;
    for line in lines.by_ref() {
        if line.is_empty() {
            saw_terminator = true;
            break;
        }
        let line = String::from_utf8_lossy(line);
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let body = if saw_terminator {
        Bytes::copy_from_slice(lines.rest())
    } else {
        Bytes::new()
    };

    Ok(Request {
        method,
        path,
        query_string: query_string.to_string(),
        headers,
        body,
    })
}

/// Encode a response into wire bytes. A `Content-Length` header matching the
/// body is added unless one is already set.
pub fn encode_response(response: &Response) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + response.body.len());

    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(response.status.as_u16().to_string().as_bytes());
    buf.extend_from_slice(b" ");
    buf.extend_from_slice(response.status.reason_phrase().as_bytes());
    buf.extend_from_slice(b"\r\n");

    let mut has_length = false;
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("content-length") {
            has_length = true;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    if !has_length {
        buf.extend_from_slice(b"Content-Length: ");
        buf.extend_from_slice(response.body.len().to_string().as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(&response.body);
    buf
}

/// Decode `%XX` escapes and `+` in a path. Malformed escapes are kept as-is.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi << 4) | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Find the end of the header block (`\r\n\r\n`), returning the offset of
/// the first body byte.
pub fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Scan a header block for `Content-Length` without building a request.
/// Missing or unparseable values count as zero.
pub fn scan_content_length(headers: &[u8]) -> usize {
    for line in Lines::new(headers) {
        let line = String::from_utf8_lossy(line);
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Iterator over `\n`-terminated lines with any trailing `\r` removed.
/// `rest()` yields everything not yet consumed.
struct Lines<'a> {
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> Lines<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Lines { buffer, pos: 0 }
    }

    fn rest(&self) -> &'a [u8] {
        &self.buffer[self.pos..]
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.pos >= self.buffer.len() {
            return None;
        }
        let rest = &self.buffer[self.pos..];
        let (line, consumed) = match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => (&rest[..nl], nl + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        Some(line.strip_suffix(b"\r").unwrap_or(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::http::types::StatusCode;

    #[test]
    fn test_parse_request_line() {
        let request = parse_request(b"GET /services HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/services");
        assert_eq!(request.query_string, "");
        assert_eq!(request.header("host"), Some("localhost"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_parse_query_string_kept_raw() {
        let request = parse_request(b"GET /search?q=a%20b&x=1 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.path, "/search");
        assert_eq!(request.query_string, "q=a%20b&x=1");
    }

    #[test]
    fn test_parse_decodes_path() {
        let request = parse_request(b"GET /hello%20world+again HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.path, "/hello world again");
    }

    #[test]
    fn test_percent_decode_edge_cases() {
        assert_eq!(percent_decode("/a%2Fb"), "/a/b");
        assert_eq!(percent_decode("/a%2fb"), "/a/b");
        assert_eq!(percent_decode("/100%"), "/100%");
        assert_eq!(percent_decode("/%zz"), "/%zz");
        assert_eq!(percent_decode("/%4"), "/%4");
        assert_eq!(percent_decode("/%41"), "/A");
    }

    #[test]
    fn test_parse_headers_lowercased_last_wins() {
        let raw = b"POST /service/echo HTTP/1.1\r\n\
                    Content-Type: text/plain\r\n\
                    content-type:   application/json  \r\n\
                    X-Custom:a:b\r\n\
                    no colon here\r\n\
                    \r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.header("content-type"), Some("application/json"));
        assert_eq!(request.header("x-custom"), Some("a:b"));
        assert_eq!(request.headers.len(), 2);
    }

    #[test]
    fn test_parse_body_verbatim() {
        let raw = b"POST /service/echo HTTP/1.1\r\nContent-Length: 3\r\n\r\nline1\r\nline2\n";
        let request = parse_request(raw).unwrap();
        // No truncation to Content-Length.
        assert_eq!(&request.body[..], b"line1\r\nline2\n");
    }

    #[test]
    fn test_parse_without_header_terminator() {
        let request = parse_request(b"GET / HTTP/1.1\r\nHost: x\r\n").unwrap();
        assert_eq!(request.path, "/");
        assert_eq!(request.header("host"), Some("x"));
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_parse_lowercase_method() {
        let request = parse_request(b"post /service/echo HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(request.method, Method::Post);
    }

    #[test]
    fn test_parse_failures() {
        assert_eq!(parse_request(b""), Err(ParseError::Empty));
        assert_eq!(
            parse_request(b"GET /\r\n\r\n"),
            Err(ParseError::MalformedRequestLine)
        );
        assert_eq!(
            parse_request(b"\r\n\r\n"),
            Err(ParseError::MalformedRequestLine)
        );
        assert_eq!(
            parse_request(b"BREW /pot HTTP/1.1\r\n\r\n"),
            Err(ParseError::UnknownMethod("BREW".to_string()))
        );
        assert_eq!(
            parse_request(b"GET ?x=1 HTTP/1.1\r\n\r\n"),
            Err(ParseError::EmptyPath)
        );
    }

    #[test]
    fn test_encode_adds_content_length() {
        let mut response = Response::new(StatusCode::OK);
        response.body = Bytes::from_static(b"hello");

        let encoded = encode_response(&response);
        assert_eq!(&encoded[..], b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
    }

    #[test]
    fn test_encode_keeps_explicit_content_length() {
        let mut response = Response::new(StatusCode::NOT_FOUND);
        response.set_text("gone");

        let encoded = encode_response(&response);
        let text = String::from_utf8(encoded.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert_eq!(text.matches("Content-Length").count(), 1);
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\ngone"));
    }

    #[test]
    fn test_decoded_requests_encode_with_exact_length() {
        let requests: [&[u8]; 3] = [
            b"GET / HTTP/1.1\r\n\r\n",
            b"POST /service/upper HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world",
            b"DELETE /x?y=z HTTP/1.0\r\n\r\n\xc3\xa9t\xc3\xa9",
        ];

        for raw in requests {
            let request = parse_request(raw).unwrap();
            let mut response = Response::default();
            response.body = request.body.clone();

            let encoded = encode_response(&response);
            let header_end = find_header_end(&encoded).unwrap();
            assert_eq!(
                scan_content_length(&encoded[..header_end]),
                encoded.len() - header_end
            );
            assert_eq!(encoded.len() - header_end, request.body.len());
        }
    }

    #[test]
    fn test_find_header_end() {
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), None);
    }

    #[test]
    fn test_scan_content_length() {
        assert_eq!(scan_content_length(b"POST / HTTP/1.1\r\nContent-Length: 42\r\n\r\n"), 42);
        assert_eq!(scan_content_length(b"POST / HTTP/1.1\r\ncontent-length:7\r\n\r\n"), 7);
        assert_eq!(scan_content_length(b"POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n"), 0);
        assert_eq!(scan_content_length(b"GET / HTTP/1.1\r\n\r\n"), 0);
    }
}
