//! Service registry: the concurrent name → handler map behind every
//! service invocation.
//!
//! Lookups, invocation and listing take the read lock; registration,
//! removal and enable/disable take the write lock. Handlers are cloned out
//! of the map and run after the lock is released, so a handler may call back
//! into the registry.

use crate::protocols::http::{Request, Response, StatusCode};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Failure reported by a service handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    message: String,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        ServiceError {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Outcome of one handler call.
pub type ServiceResult = Result<Response, ServiceError>;

/// A service: full request in, full response out.
pub type ServiceHandler = Arc<dyn Fn(&Request) -> ServiceResult + Send + Sync>;

/// A registered service and its metadata.
#[derive(Clone)]
pub struct ServiceInfo {
    pub description: String,
    pub version: String,
    pub handler: ServiceHandler,
    pub enabled: bool,
}

impl ServiceInfo {
    /// Enabled service with the given metadata.
    pub fn new<F>(description: impl Into<String>, version: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Request) -> ServiceResult + Send + Sync + 'static,
    {
        ServiceInfo {
            description: description.into(),
            version: version.into(),
            handler: Arc::new(handler),
            enabled: true,
        }
    }
}

impl fmt::Debug for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceInfo")
            .field("description", &self.description)
            .field("version", &self.version)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct ServiceEntry<'a> {
    name: &'a str,
    description: &'a str,
    version: &'a str,
    enabled: bool,
}

#[derive(Serialize)]
struct ServiceListing<'a> {
    services: Vec<ServiceEntry<'a>>,
    total: usize,
}

/// Thread-safe service registry.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, ServiceInfo>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        debug!("Initializing service registry");
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ServiceInfo>> {
        self.services.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ServiceInfo>> {
        self.services.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a service. Fails if `name` is empty or already taken; the
    /// existing entry is left untouched.
    pub fn register(&self, name: &str, info: ServiceInfo) -> bool {
        if name.is_empty() {
            warn!("Refusing to register service with empty name");
            return false;
        }

        let mut services = self.write();
        if services.contains_key(name) {
            warn!(service = name, "Service already exists");
            return false;
        }

        info!(service = name, version = %info.version, "Registered service");
        services.insert(name.to_string(), info);
        true
    }

    pub fn unregister(&self, name: &str) -> bool {
        if self.write().remove(name).is_some() {
            info!(service = name, "Unregistered service");
            true
        } else {
            warn!(service = name, "Failed to unregister non-existent service");
            false
        }
    }

    /// Copy of the entry registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<ServiceInfo> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        let mut services = self.write();
        let count = services.len();
        services.clear();
        info!(count, "Cleared services");
    }

    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.write().get_mut(name) {
            Some(info) => {
                info.enabled = enabled;
                info!(service = name, enabled, "Service state changed");
                true
            }
            None => {
                warn!(service = name, enabled, "Cannot change state of non-existent service");
                false
            }
        }
    }

    /// Run the service registered under `name`.
    ///
    /// Unknown names give 404 and disabled services 500. A handler that
    /// returns an error or panics gives a 500 with a generic message; the
    /// detail is only logged.
    pub fn invoke(&self, request: &Request, name: &str) -> Response {
        let (handler, enabled) = match self.read().get(name) {
            Some(info) => (Arc::clone(&info.handler), info.enabled),
            None => {
                warn!(service = name, "Requested non-existent service");
                return Response::error(
                    StatusCode::NOT_FOUND,
                    &format!("Service not found: {name}"),
                );
            }
        };

        if !enabled {
            warn!(service = name, "Requested disabled service");
            return Response::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Service disabled: {name}"),
            );
        }

        debug!(service = name, "Invoking service");
        match catch_unwind(AssertUnwindSafe(|| handler(request))) {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(service = name, error = %e, "Service failed");
                Response::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal service error")
            }
            Err(_) => {
                error!(service = name, "Service panicked");
                Response::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal service error")
            }
        }
    }

    /// JSON listing of every service, taken under a single read lock so
    /// `total` always matches the listed entries.
    pub fn services_info(&self) -> Response {
        let services = self.read();

        let mut entries: Vec<ServiceEntry<'_>> = services
            .iter()
            .map(|(name, info)| ServiceEntry {
                name,
                description: &info.description,
                version: &info.version,
                enabled: info.enabled,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(b.name));

        let listing = ServiceListing {
            total: entries.len(),
            services: entries,
        };

        match serde_json::to_string(&listing) {
            Ok(json) => {
                let mut response = Response::json(StatusCode::OK, json);
                response.set_header("Content-Type", "application/json");
                response.set_header("Cache-Control", "no-cache");
                response
            }
            Err(e) => {
                error!(error = %e, "Failed to serialize service listing");
                Response::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        }
    }
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}
