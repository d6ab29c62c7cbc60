//! HTTP value types shared by the codec, router and services.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Request method. Anything outside the supported set parses as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Options,
    Head,
    Patch,
    Unknown,
}

impl Method {
    /// Parse a method token, ignoring ASCII case.
    pub fn parse(token: &str) -> Method {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "HEAD" => Method::Head,
            "PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric HTTP status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const NOT_IMPLEMENTED: StatusCode = StatusCode(501);

    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Reason phrase for the status line.
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            400 => "Bad Request",
            404 => "Not Found",
            405 => "Method Not Allowed",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// A decoded request. Built once per connection and never mutated by the
/// router or the services.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    /// Percent-decoded path without the query string.
    pub path: String,
    /// Raw query string, without the leading `?`.
    pub query_string: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Request {
            method,
            path: path.into(),
            query_string: String::new(),
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.method != Method::Unknown && !self.path.is_empty()
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    /// Body as text, replacing invalid UTF-8 sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A response under construction. Header names keep the case they were set
/// with.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Default for Response {
    fn default() -> Self {
        Response::new(StatusCode::OK)
    }
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    /// JSON response with the given status.
    pub fn json(status: StatusCode, json: impl Into<String>) -> Self {
        let mut response = Response::new(status);
        response.set_json(json);
        response
    }

    /// Error envelope: `{"error": ..., "status": ..., "timestamp": ...}`.
    pub fn error(status: StatusCode, message: &str) -> Self {
        let envelope = ErrorBody {
            error: message,
            status: status.as_u16(),
            timestamp: utc_timestamp(),
        };
        // Serializing a struct of strings and integers cannot fail.
        let json = serde_json::to_string(&envelope).unwrap_or_default();
        Response::json(status, json)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Replace the body and set Content-Type and Content-Length to match.
    pub fn set_content(&mut self, content: impl Into<Bytes>, content_type: &str) {
        self.body = content.into();
        self.set_header("Content-Type", content_type);
        self.set_header("Content-Length", self.body.len().to_string());
    }

    pub fn set_json(&mut self, json: impl Into<String>) {
        self.set_content(json.into(), "application/json; charset=utf-8");
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.set_content(text.into(), "text/plain; charset=utf-8");
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    status: u16,
    timestamp: String,
}

/// Current UTC time as ISO-8601 with millisecond precision.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
