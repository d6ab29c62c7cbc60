//! servicehub binary: loads configuration, registers the example services
//! and serves until interrupted.

use servicehub::services::register_example_services;
use servicehub::{App, Config};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        read_timeout_secs = config.read_timeout.as_secs(),
        max_request_size = config.max_request_size,
        web_root = ?config.web_root,
        "Starting servicehub"
    );

    let app = Arc::new(App::new(config));
    register_example_services(&app);

    let addr = app.start()?;
    info!(services = ?app.services(), "Registered services");
    info!("Health check: http://{addr}/ping");
    info!("Service list: http://{addr}/services");
    info!("Invoke:       POST http://{addr}/service/<name>");

    let serving = {
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.serve().await })
    };

    shutdown_signal().await;
    app.stop();

    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Server exited with error"),
        Err(e) => error!(error = %e, "Server task failed"),
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
