//! Request routing.
//!
//! Dispatch order:
//! 1. `OPTIONS *` → CORS preflight
//! 2. `GET /<name>` where `<name>` is a registered service → invoke it
//! 3. `GET /services` → service listing
//! 4. `GET *` with a web root configured → static files
//! 5. `GET /` → welcome payload
//! 6. `POST /service/<name>` → invoke `<name>`
//! 7. anything else → 404
//!
//! CORS headers are added to every response, error responses included.

use crate::protocols::http::{Method, Request, Response, StatusCode};
use crate::registry::ServiceRegistry;
use crate::static_files::StaticFileHandler;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

/// Path answered with the service listing.
pub const SERVICES_PATH: &str = "/services";

/// Prefix for `POST` service invocation.
pub const SERVICE_PREFIX: &str = "/service/";

const CORS_ALLOW_ORIGIN: &str = "*";
const CORS_ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS";
const CORS_ALLOW_HEADERS: &str = "Content-Type, Authorization";
const CORS_MAX_AGE: &str = "86400";

#[derive(Debug, Error)]
enum RouteError {
    #[error("failed to serialize response: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct Endpoints {
    health: &'static str,
    services: &'static str,
    invoke: &'static str,
}

#[derive(Serialize)]
struct Welcome {
    message: &'static str,
    version: &'static str,
    endpoints: Endpoints,
    timestamp: String,
}

/// Maps requests to the registry, the static file handler or a built-in
/// endpoint.
#[derive(Debug)]
pub struct Router {
    registry: Arc<ServiceRegistry>,
    static_files: Option<StaticFileHandler>,
}

impl Router {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Router {
            registry,
            static_files: None,
        }
    }

    pub fn with_static_files(mut self, handler: StaticFileHandler) -> Self {
        self.static_files = Some(handler);
        self
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Produce the response for `request`. Never fails: internal faults
    /// become a 500.
    pub fn route(&self, request: &Request) -> Response {
        debug!(method = %request.method, path = %request.path, "Routing request");

        let mut response = match catch_unwind(AssertUnwindSafe(|| self.dispatch(request))) {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(error = %e, "Error routing request");
                Response::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
            Err(_) => {
                error!(path = %request.path, "Panic while routing request");
                Response::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        };

        add_cors_headers(&mut response);
        debug!(status = response.status.as_u16(), "Request routed");
        response
    }

    fn dispatch(&self, request: &Request) -> Result<Response, RouteError> {
        match request.method {
            Method::Options => Ok(preflight()),
            Method::Get => self.handle_get(request),
            Method::Post => Ok(self.handle_post(request)),
            _ => Ok(Response::error(StatusCode::NOT_FOUND, "Resource not found")),
        }
    }

    fn handle_get(&self, request: &Request) -> Result<Response, RouteError> {
        let path = request.path.as_str();

        let name = path.strip_prefix('/').unwrap_or(path);
        if !name.is_empty() && self.registry.contains(name) {
            return Ok(self.registry.invoke(request, name));
        }

        if path == SERVICES_PATH {
            return Ok(self.registry.services_info());
        }

        if let Some(static_files) = &self.static_files {
            return Ok(static_files.handle(request));
        }

        if path == "/" {
            return welcome();
        }

        Ok(Response::error(StatusCode::NOT_FOUND, "Resource not found"))
    }

    fn handle_post(&self, request: &Request) -> Response {
        match request.path.strip_prefix(SERVICE_PREFIX) {
            Some(rest) => {
                let name = service_name(rest);
                if name.is_empty() {
                    Response::error(StatusCode::BAD_REQUEST, "Service name is required")
                } else {
                    self.registry.invoke(request, name)
                }
            }
            None => Response::error(StatusCode::NOT_FOUND, "Endpoint not found"),
        }
    }
}

/// Service name from the part of the path after `/service/`, without any
/// query or fragment suffix.
fn service_name(rest: &str) -> &str {
    match rest.find(|c: char| c == '?' || c == '#') {
        Some(end) => &rest[..end],
        None => rest,
    }
}

fn preflight() -> Response {
    let mut response = Response::new(StatusCode::OK);
    response.set_header("Access-Control-Max-Age", CORS_MAX_AGE);
    response
}

fn welcome() -> Result<Response, RouteError> {
    let welcome = Welcome {
        message: "Welcome to servicehub",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: Endpoints {
            health: "GET /ping",
            services: "GET /services",
            invoke: "POST /service/<name>",
        },
        timestamp: crate::protocols::http::types::utc_timestamp(),
    };
    Ok(Response::json(StatusCode::OK, serde_json::to_string(&welcome)?))
}

fn add_cors_headers(response: &mut Response) {
    response.set_header("Access-Control-Allow-Origin", CORS_ALLOW_ORIGIN);
    response.set_header("Access-Control-Allow-Methods", CORS_ALLOW_METHODS);
    response.set_header("Access-Control-Allow-Headers", CORS_ALLOW_HEADERS);
}
