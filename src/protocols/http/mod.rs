//! HTTP/1.1 over plain TCP, one request per connection.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  METHOD SP TARGET SP VERSION\r\n
//!           Name: Value\r\n ...
//!           \r\n
//!           <body>
//!
//! Response: HTTP/1.1 <code> <reason>\r\n
//!           Name: Value\r\n ...
//!           Content-Length: <n>\r\n
//!           \r\n
//!           <body of exactly n bytes>
//! ```
//!
//! There is no keep-alive and no chunked encoding. The server closes the
//! connection after writing the response.

pub mod handler;
pub mod parser;
pub mod types;

pub use handler::{handle_connection, ConnectionSettings, RequestHandler};
pub use parser::{encode_response, parse_request, ParseError};
pub use types::{Method, Request, Response, StatusCode};
