//! Per-connection worker: read one request, hand it to the request handler,
//! write the reply, close.

use super::parser::{find_header_end, scan_content_length};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

/// Read buffer growth step.
const READ_CHUNK: usize = 8 * 1024;

/// Default per-operation socket timeout.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ceiling on bytes read for one request (1 MiB).
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Turns the raw bytes of one request into the raw bytes of its response.
pub type RequestHandler = Arc<dyn Fn(&[u8]) -> Bytes + Send + Sync>;

/// Limits applied to every accepted connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// Timeout for each read and for the response write.
    pub io_timeout: Duration,
    /// Reading stops once this many bytes have been received.
    pub max_request_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

/// Serve exactly one request on `stream` and close it.
///
/// Nothing is written if the peer sent no bytes. Transport failures are
/// logged and end the exchange; they never propagate to the accept loop.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    handler: RequestHandler,
    settings: ConnectionSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_request(&mut stream, &settings).await;
    if request.is_empty() {
        debug!(peer = %peer, "No data received");
        return;
    }

    trace!(peer = %peer, bytes = request.len(), "Request received");

    let request = request.freeze();
    let response = match tokio::task::spawn_blocking(move || handler(&request)).await {
        Ok(response) => response,
        Err(e) => {
            error!(peer = %peer, error = %e, "Request handler failed");
            return;
        }
    };

    match timeout(settings.io_timeout, stream.write_all(&response)).await {
        Ok(Ok(())) => {
            trace!(peer = %peer, bytes = response.len(), "Response sent");
            let _ = stream.shutdown().await;
        }
        Ok(Err(e)) => warn!(peer = %peer, error = %e, "Failed to send response"),
        Err(_) => warn!(peer = %peer, "Timed out sending response"),
    }
}

/// Accumulate one request from `stream`.
///
/// Reads until the header terminator is seen, then until `Content-Length`
/// body bytes have arrived. Stops early on EOF, a read error, a timeout, or
/// once `max_request_size` bytes have been received; whatever arrived so far
/// is returned.
pub async fn read_request<R>(stream: &mut R, settings: &ConnectionSettings) -> BytesMut
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    let mut body_start: Option<usize> = None;
    let mut content_length = 0usize;

    loop {
        let previous_len = buffer.len();
        buffer.reserve(READ_CHUNK);
        let n = match timeout(settings.io_timeout, stream.read_buf(&mut buffer)).await {
            Ok(Ok(0)) => {
                trace!("Connection closed by client");
                break;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!(error = %e, "Error receiving data");
                break;
            }
            Err(_) => {
                debug!(received = buffer.len(), "Timed out receiving data");
                break;
            }
        };
        trace!(bytes = n, "Read chunk");

        if body_start.is_none() {
            // The terminator may straddle the previous read.
            let from = previous_len.saturating_sub(3);
            if let Some(end) = find_header_end(&buffer[from..]).map(|end| from + end) {
                body_start = Some(end);
                content_length = scan_content_length(&buffer[..end]);
            }
        }

        if let Some(start) = body_start {
            if buffer.len() - start >= content_length {
                break;
            }
        }

        if buffer.len() > settings.max_request_size {
            warn!(received = buffer.len(), "Request too large, stopping read");
            break;
        }
    }

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_read_headers_only() {
        let mut stream = Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .build();

        let data = read_request(&mut stream, &ConnectionSettings::default()).await;
        assert_eq!(&data[..], b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    }

    #[tokio::test]
    async fn test_read_headers_split_across_reads() {
        let mut stream = Builder::new()
            .read(b"GET / HT")
            .read(b"TP/1.1\r\n")
            .read(b"\r\n")
            .build();

        let data = read_request(&mut stream, &ConnectionSettings::default()).await;
        assert_eq!(&data[..], b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_read_terminator_split_byte_by_byte() {
        let mut stream = Builder::new()
            .read(b"POST /service/echo HTTP/1.1\r\nContent-Length: 2\r")
            .read(b"\n")
            .read(b"\r")
            .read(b"\nok")
            .build();

        let data = read_request(&mut stream, &ConnectionSettings::default()).await;
        assert!(data.ends_with(b"Content-Length: 2\r\n\r\nok"));
    }

    #[tokio::test]
    async fn test_read_waits_for_body() {
        let mut stream = Builder::new()
            .read(b"POST /service/echo HTTP/1.1\r\nContent-Length: 11\r\n\r\n")
            .read(b"hello")
            .read(b" world")
            .build();

        let data = read_request(&mut stream, &ConnectionSettings::default()).await;
        assert!(data.ends_with(b"\r\n\r\nhello world"));
    }

    #[tokio::test]
    async fn test_read_stops_at_eof() {
        let mut stream = Builder::new()
            .read(b"POST /service/echo HTTP/1.1\r\nContent-Length: 100\r\n\r\nshort")
            .build();

        let data = read_request(&mut stream, &ConnectionSettings::default()).await;
        assert!(data.ends_with(b"short"));
    }

    #[tokio::test]
    async fn test_read_stops_at_size_ceiling() {
        let settings = ConnectionSettings {
            max_request_size: 64,
            ..ConnectionSettings::default()
        };
        let head = b"POST /service/echo HTTP/1.1\r\nContent-Length: 1000\r\n\r\n";
        let mut stream = Builder::new().read(head).read(&[b'a'; 40]).build();

        let data = read_request(&mut stream, &settings).await;
        assert_eq!(data.len(), head.len() + 40);
    }

    #[tokio::test]
    async fn test_read_empty_connection() {
        let mut stream = Builder::new().build();
        let data = read_request(&mut stream, &ConnectionSettings::default()).await;
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_handle_connection_writes_handler_output() {
        let stream = Builder::new()
            .read(b"GET /ping HTTP/1.1\r\n\r\n")
            .write(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
            .build();

        let handler: RequestHandler = Arc::new(|raw: &[u8]| {
            assert!(raw.starts_with(b"GET /ping"));
            Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\npong")
        });

        handle_connection(stream, peer(), handler, ConnectionSettings::default()).await;
    }

    #[tokio::test]
    async fn test_handle_connection_skips_empty_request() {
        let stream = Builder::new().build();
        let handler: RequestHandler = Arc::new(|_: &[u8]| -> Bytes { panic!("handler must not run") });

        handle_connection(stream, peer(), handler, ConnectionSettings::default()).await;
    }

    #[tokio::test]
    async fn test_handle_connection_survives_handler_panic() {
        let stream = Builder::new().read(b"GET / HTTP/1.1\r\n\r\n").build();
        let handler: RequestHandler = Arc::new(|_: &[u8]| -> Bytes { panic!("boom") });

        // Returns normally and writes nothing.
        handle_connection(stream, peer(), handler, ConnectionSettings::default()).await;
    }
}
