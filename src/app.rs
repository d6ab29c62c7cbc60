//! Application composition root.
//!
//! Owns the registry, router and server and wires the raw request handler
//! the server runs for every connection.

use crate::config::Config;
use crate::protocols::http::types::utc_timestamp;
use crate::protocols::http::{
    encode_response, parse_request, ConnectionSettings, Request, RequestHandler, Response,
    StatusCode,
};
use crate::registry::{ServiceError, ServiceInfo, ServiceRegistry};
use crate::router::Router;
use crate::server::{Server, ServerError};
use crate::static_files::StaticFileHandler;
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Version reported for services registered through [`App`].
pub const SERVICE_VERSION: &str = "1.0.0";

/// Health check service name.
pub const PING_SERVICE: &str = "ping";

/// Server statistics service name.
pub const STATS_SERVICE: &str = "api/server/stats";

#[derive(Serialize)]
struct Ping {
    status: &'static str,
    message: &'static str,
    timestamp: String,
    services: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    uptime: u64,
    uptime_formatted: String,
    request_count: u64,
    port: u16,
    version: &'static str,
    timestamp: String,
}

#[derive(Serialize)]
struct Failure {
    error: String,
}

/// The HTTP service host.
pub struct App {
    config: Config,
    registry: Arc<ServiceRegistry>,
    router: Arc<Router>,
    server: Server,
    started_at: Instant,
    requests: Arc<AtomicU64>,
    port: Arc<AtomicU16>,
}

impl App {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ServiceRegistry::new());

        let mut router = Router::new(Arc::clone(&registry));
        if let Some(static_files) = config.web_root.as_deref().and_then(StaticFileHandler::from_root)
        {
            router = router.with_static_files(static_files);
        }

        let settings = ConnectionSettings {
            io_timeout: config.read_timeout,
            max_request_size: config.max_request_size,
        };
        let server = Server::new(settings, config.backlog);
        let port = Arc::new(AtomicU16::new(config.port));

        App {
            config,
            registry,
            router: Arc::new(router),
            server,
            started_at: Instant::now(),
            requests: Arc::new(AtomicU64::new(0)),
            port,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        self.server.is_running()
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Requests handed to the router so far.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Register a service that receives the full request.
    ///
    /// Registration is only allowed while the server is stopped.
    pub fn register_service<F>(&self, name: &str, handler: F) -> bool
    where
        F: Fn(&Request) -> Result<Response, ServiceError> + Send + Sync + 'static,
    {
        if self.is_running() {
            warn!(service = name, "Cannot register service while server is running");
            return false;
        }
        let info = ServiceInfo::new(format!("{name} service"), SERVICE_VERSION, handler);
        self.registry.register(name, info)
    }

    /// Register a service that maps the request body text to a JSON
    /// document. Errors become a 500 carrying the error message.
    pub fn register_body_service<F>(&self, name: &str, handler: F) -> bool
    where
        F: Fn(&str) -> Result<String, ServiceError> + Send + Sync + 'static,
    {
        self.register_service(name, move |request: &Request| {
            Ok(match handler(&request.body_text()) {
                Ok(json) => Response::json(StatusCode::OK, json),
                Err(e) => {
                    let failure = Failure {
                        error: format!("Exception: {}", e.message()),
                    };
                    Response::json(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        serde_json::to_string(&failure).unwrap_or_default(),
                    )
                }
            })
        })
    }

    /// Remove a service. Only allowed while the server is stopped.
    pub fn unregister_service(&self, name: &str) -> bool {
        if self.is_running() {
            warn!(service = name, "Cannot unregister service while server is running");
            return false;
        }
        self.registry.unregister(name)
    }

    /// Names of all registered services, sorted.
    pub fn services(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Register the built-in services and bind the listener.
    pub fn start(&self) -> Result<SocketAddr, ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyRunning);
        }

        self.register_internal_services();
        let addr = self.server.start(&self.config.host, self.config.port)?;
        self.port.store(addr.port(), Ordering::Relaxed);

        info!(
            address = %addr,
            services = self.registry.len(),
            "Application started"
        );
        Ok(addr)
    }

    /// Accept and serve connections until [`App::stop`] is called.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let router = Arc::clone(&self.router);
        let requests = Arc::clone(&self.requests);
        let handler: RequestHandler = Arc::new(move |raw: &[u8]| {
            requests.fetch_add(1, Ordering::Relaxed);
            process_request(&router, raw)
        });
        self.server.run(handler).await
    }

    pub fn stop(&self) {
        if self.is_running() {
            info!("Stopping application");
        }
        self.server.stop();
    }

    fn register_internal_services(&self) {
        if !self.registry.contains(PING_SERVICE) {
            let registry: Weak<ServiceRegistry> = Arc::downgrade(&self.registry);
            self.register_service(PING_SERVICE, move |_: &Request| {
                let ping = Ping {
                    status: "ok",
                    message: "ping",
                    timestamp: utc_timestamp(),
                    services: registry.upgrade().map_or(0, |r| r.len()),
                };
                json_response(&ping)
            });
        }

        if !self.registry.contains(STATS_SERVICE) {
            let started_at = self.started_at;
            let requests = Arc::clone(&self.requests);
            let port = Arc::clone(&self.port);
            self.register_service(STATS_SERVICE, move |_: &Request| {
                let uptime = started_at.elapsed().as_secs();
                let stats = Stats {
                    uptime,
                    uptime_formatted: format_uptime(uptime),
                    request_count: requests.load(Ordering::Relaxed),
                    port: port.load(Ordering::Relaxed),
                    version: env!("CARGO_PKG_VERSION"),
                    timestamp: utc_timestamp(),
                };
                json_response(&stats)
            });
        }
    }
}

fn json_response<T: Serialize>(value: &T) -> Result<Response, ServiceError> {
    let json = serde_json::to_string(value).map_err(|e| ServiceError::new(e.to_string()))?;
    Ok(Response::json(StatusCode::OK, json))
}

/// Decode one raw request, route it and encode the reply.
///
/// Input that does not decode gets a plain-text 400.
pub fn process_request(router: &Router, raw: &[u8]) -> Bytes {
    let response = match parse_request(raw) {
        Ok(request) => {
            debug!(method = %request.method, path = %request.path, "Processing request");
            router.route(&request)
        }
        Err(e) => {
            warn!(error = %e, bytes = raw.len(), "Received invalid HTTP request");
            let mut response = Response::new(StatusCode::BAD_REQUEST);
            response.set_text("Bad Request");
            response
        }
    };
    encode_response(&response).freeze()
}

/// Human readable uptime: `1d 2h 3m`, `2h 3m` or `3m`.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600) / 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::register_example_services;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        }
    }

    fn split_response(raw: &[u8]) -> (String, String) {
        let text = String::from_utf8_lossy(raw).into_owned();
        match text.split_once("\r\n\r\n") {
            Some((head, body)) => (head.to_string(), body.to_string()),
            None => (text, String::new()),
        }
    }

    async fn exchange(addr: SocketAddr, request: &str) -> (String, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        split_response(&response)
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(0), "0m");
        assert_eq!(format_uptime(59), "0m");
        assert_eq!(format_uptime(3 * 60), "3m");
        assert_eq!(format_uptime(2 * 3600 + 3 * 60), "2h 3m");
        assert_eq!(format_uptime(86_400 + 2 * 3600 + 3 * 60 + 4), "1d 2h 3m");
    }

    #[test]
    fn test_bad_request_is_plain_text() {
        let app = App::new(test_config());
        let (head, body) = split_response(&process_request(app.router(), b"GARBAGE\r\n\r\n"));
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(head.contains("Content-Type: text/plain"));
        assert_eq!(body, "Bad Request");
    }

    #[test]
    fn test_register_service_metadata() {
        let app = App::new(test_config());
        assert!(app.register_body_service("echo", |input: &str| Ok(format!("\"{input}\""))));
        assert!(!app.register_body_service("echo", |_: &str| Ok(String::new())));

        let info = app.registry().lookup("echo").unwrap();
        assert_eq!(info.description, "echo service");
        assert_eq!(info.version, SERVICE_VERSION);
        assert_eq!(app.services(), vec!["echo".to_string()]);

        assert!(app.unregister_service("echo"));
        assert!(app.services().is_empty());
    }

    #[test]
    fn test_body_service_error_is_500() {
        let app = App::new(test_config());
        app.register_body_service("fail", |_: &str| Err(ServiceError::new("bad input")));

        let raw = process_request(app.router(), b"POST /service/fail HTTP/1.1\r\n\r\nx");
        let (head, body) = split_response(&raw);
        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert_eq!(body, r#"{"error":"Exception: bad input"}"#);
    }

    #[test]
    fn test_listing_before_start_is_empty() {
        let app = App::new(test_config());
        let raw = process_request(app.router(), b"GET /services HTTP/1.1\r\n\r\n");
        let (head, body) = split_response(&raw);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, r#"{"services":[],"total":0}"#);
    }

    #[tokio::test]
    async fn test_registration_rejected_while_running() {
        let app = App::new(test_config());
        app.start().unwrap();
        assert!(!app.register_body_service("late", |_: &str| Ok(String::new())));
        assert!(!app.registry().contains("late"));
        assert!(!app.unregister_service(PING_SERVICE));
        assert!(app.registry().contains(PING_SERVICE));

        app.stop();
        assert!(app.register_body_service("late", |_: &str| Ok(String::new())));
    }

    #[tokio::test]
    async fn test_internal_services() {
        let app = App::new(test_config());
        register_example_services(&app);
        let addr = app.start().unwrap();
        assert!(app.registry().contains(PING_SERVICE));
        assert!(app.registry().contains(STATS_SERVICE));

        let raw = process_request(app.router(), b"GET /ping HTTP/1.1\r\n\r\n");
        let (_, body) = split_response(&raw);
        let ping: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(ping["status"], "ok");
        assert_eq!(ping["services"], app.registry().len());

        let raw = process_request(app.router(), b"GET /api/server/stats HTTP/1.1\r\n\r\n");
        let (_, body) = split_response(&raw);
        let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(stats["port"], addr.port());
        assert_eq!(stats["uptimeFormatted"], "0m");
        assert_eq!(stats["requestCount"], 0);

        app.stop();
        // A restart must not trip over the already-registered built-ins.
        app.start().unwrap();
        app.stop();
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let app = Arc::new(App::new(test_config()));
        register_example_services(&app);
        let addr = app.start().unwrap();

        let serving = {
            let app = Arc::clone(&app);
            tokio::spawn(async move { app.serve().await })
        };

        let (head, body) = exchange(
            addr,
            "POST /service/upper HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world",
        )
        .await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Access-Control-Allow-Origin: *"));
        assert_eq!(
            body,
            r#"{"service":"upper","input":"hello world","output":"HELLO WORLD"}"#
        );

        let (head, body) = exchange(addr, "GET /services HTTP/1.1\r\n\r\n").await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        let listing: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(listing["total"], app.registry().len());

        let (head, _) = exchange(
            addr,
            "POST /service/doesnotexist HTTP/1.1\r\nContent-Length: 1\r\n\r\nx",
        )
        .await;
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

        let (head, body) = exchange(addr, "OPTIONS /service/upper HTTP/1.1\r\n\r\n").await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Access-Control-Max-Age: 86400"));
        assert!(body.is_empty());

        let (_, first) = exchange(
            addr,
            "POST /service/reverse HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await;
        let (_, second) = exchange(
            addr,
            "POST /service/reverse HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await;
        assert_eq!(first, second);
        assert_eq!(first, r#"{"service":"reverse","input":"abc","output":"cba"}"#);

        assert_eq!(app.request_count(), 6);

        app.stop();
        serving.await.unwrap().unwrap();
    }
}
