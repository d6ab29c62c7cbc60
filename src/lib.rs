//! servicehub: a lightweight HTTP server that exposes registered services
//!
//! Features:
//! - HTTP/1.1 over raw TCP, one request per connection
//! - Named services invoked with `POST /service/<name>` or `GET /<name>`
//! - Service listing, health check and server statistics endpoints
//! - Optional static file serving from a web root
//! - Configuration via CLI arguments or TOML file

pub mod app;
pub mod config;
pub mod protocols;
pub mod registry;
pub mod router;
pub mod server;
pub mod services;
pub mod static_files;

pub use app::App;
pub use config::Config;
pub use registry::{ServiceError, ServiceRegistry};
