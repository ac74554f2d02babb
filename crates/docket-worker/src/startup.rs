//! Process startup: logging, banner, and signal handling.

use docket_config::{AppConfig, ObservabilityConfig};
use docket_jobs::StopHandle;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Status used when a second signal forces the worker down.
pub const FORCED_EXIT_STATUS: i32 = 1;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.is_json() {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("Logging already initialised: {e}");
    }
}

/// Logs the effective configuration at startup.
pub fn print_startup_info(config: &AppConfig) {
    let separator = "=".repeat(60);
    info!("{}", separator);
    info!("Docket {}", config.app.version);
    info!("Environment:  {}", config.app.environment);
    info!("Store:        {:?}", config.store.backend);
    info!("Connection:   {}", config.default_connection);
    info!("Failed table: {}", config.failed.table);
    info!("{}", separator);
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received terminate signal"),
    }
}

/// Turns the first shutdown signal into a graceful stop and the second
/// into a forced kill.
pub fn watch_signals(stop: StopHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Stopping after the current job; signal again to force");
        stop.request_stop(0);

        shutdown_signal().await;
        warn!("Second signal received, killing worker");
        stop.force_kill(FORCED_EXIT_STATUS);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_print_startup_info_does_not_panic() {
        let _ = tracing_subscriber::fmt::try_init();
        print_startup_info(&AppConfig::default());
    }

    #[test]
    fn test_init_logging_twice_does_not_panic() {
        let config = ObservabilityConfig {
            log_level: "not a directive ===".to_string(),
            log_format: "json".to_string(),
        };
        init_logging(&config);
        init_logging(&ObservabilityConfig::default());
    }
}
