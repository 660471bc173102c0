//! Log initialization.
//!
//! All binaries log through `tracing`. The configured level acts as the
//! default filter; a `RUST_LOG` environment variable overrides it with a
//! full filter directive when set.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output layout for the fmt subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human output for interactive use.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// JSON lines for collection.
    Json,
}

fn default_level() -> String {
    "info".to_string()
}

/// The `[log]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `info,obsctl=debug`.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

/// Install the global subscriber. A second call is a no-op, so tests and
/// embedded use can both run through the same entry points.
pub fn init(cfg: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match cfg.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    match result {
        Ok(()) => {}
        Err(e) if e.to_string().contains("already been set") => {}
        Err(e) => eprintln!("log init failed: {e}"),
    }
}
