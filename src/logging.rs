//! Logging setup
//!
//! Installs a `tracing` subscriber from [`LoggingConfig`]: stderr output
//! (human-readable or JSON) plus, when a directory is configured, a
//! daily-rolling JSON file written through a non-blocking worker.
//! `RUST_LOG` overrides the configured filter.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::core::{GuardError, GuardResult};

const LOG_FILE_PREFIX: &str = "gridguard.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber. Keep the returned guard alive for as long
/// as file logging should flush.
pub fn init_logging(config: &LoggingConfig) -> GuardResult<Option<WorkerGuard>> {
    let filter = build_filter(std::env::var("RUST_LOG").ok(), &config.filter)?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    });

    let guard = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| GuardError::InvalidConfig(format!("logging already initialized: {}", e)))?;

    Ok(guard)
}

fn build_filter(rust_log: Option<String>, configured: &str) -> GuardResult<EnvFilter> {
    let directives = match rust_log {
        Some(value) if !value.trim().is_empty() => value,
        _ => configured.to_string(),
    };
    EnvFilter::try_new(&directives)
        .map_err(|e| GuardError::InvalidConfig(format!("bad log filter '{}': {}", directives, e)))
}
