//! Structured logging setup.
//!
//! Installs a global `tracing` subscriber built from a [`LoggingConfig`]:
//! `RUST_LOG` takes precedence over the configured level, output goes to the
//! console and/or a file, in human or JSON format.

use crate::config::LoggingConfig;
use crate::error::{DbusError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Build the filter from `RUST_LOG`, falling back to the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let default_level = config.log_level.to_string().to_ascii_lowercase();
    EnvFilter::builder().parse_lossy(std::env::var("RUST_LOG").unwrap_or(default_level))
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed; that is not
/// treated as an error.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.log_to_console {
        let layer = fmt::layer().with_target(true);
        layers.push(if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            DbusError::ConfigError("log_file_path must be specified when log_to_file is true".into())
        })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| DbusError::ConfigError(format!("Failed to open log file {path}: {e}")))?;
        let layer = fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(Mutex::new(file));
        layers.push(if config.json_format {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    let installed = tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(config))
        .try_init()
        .is_ok();

    if installed {
        info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    } else {
        debug!("A global subscriber is already installed; keeping it");
    }
    Ok(installed)
}
