//! Serves files from a web root directory for GET requests the router does
//! not otherwise answer.

use crate::protocols::http::{Request, Response, StatusCode};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Static file handler rooted at a directory.
#[derive(Debug, Clone)]
pub struct StaticFileHandler {
    root: PathBuf,
}

impl StaticFileHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        info!(root = %root.display(), "Static file handler initialized");
        StaticFileHandler { root }
    }

    /// Handler for `root`, or `None` if it is not an existing directory.
    pub fn from_root(root: &Path) -> Option<Self> {
        if root.is_dir() {
            Some(Self::new(root))
        } else {
            warn!(root = %root.display(), "Web root directory does not exist");
            None
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handle(&self, request: &Request) -> Response {
        let path = match request.path.as_str() {
            "" | "/" => "/index.html",
            path => path,
        };

        if !is_safe_path(path) {
            warn!(path, "Rejected unsafe static path");
            return text(StatusCode::BAD_REQUEST, "Invalid path");
        }

        let full_path = self.root.join(path.trim_start_matches('/'));
        let metadata = match fs::metadata(&full_path) {
            Ok(metadata) => metadata,
            Err(_) => return text(StatusCode::NOT_FOUND, "File not found"),
        };
        if !metadata.is_file() {
            return text(StatusCode::NOT_FOUND, "Not a file");
        }

        match fs::read(&full_path) {
            Ok(content) => {
                let mime = mime_type(&full_path);
                debug!(path, mime, "Served file");
                let mut response = Response::new(StatusCode::OK);
                response.set_content(content, mime);
                response
            }
            Err(e) => {
                error!(path, error = %e, "Failed to read file");
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read file")
            }
        }
    }
}

fn text(status: StatusCode, message: &str) -> Response {
    let mut response = Response::new(status);
    response.set_text(message);
    response
}

fn is_safe_path(path: &str) -> bool {
    path.starts_with('/') && !path.contains("..") && !path.contains('\0')
}

/// Content type for a file, by extension.
pub fn mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        Some("xml") => "application/xml",
        _ => "application/octet-stream",
    }
}
