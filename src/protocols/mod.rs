//! Protocol implementations.
//!
//! Each protocol has a parser module and a connection handler used by the
//! server's accept loop.
//!
//! - `http`: HTTP/1.1 request/response framing, one exchange per connection

pub mod http;
