//! Logger setup. Everything goes to stderr; stdout is left to prompts and reports.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Emit one JSON object per event instead of human-readable lines
    pub json: bool,
    /// 0 = info, 1 = debug, 2+ = trace
    pub verbosity: u8,
}

impl LoggingConfig {
    pub fn filter_directives(&self) -> String {
        let level = match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        format!("warn,scrobble_match={level}")
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(cfg: &LoggingConfig) {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(cfg.filter_directives()));

    let registry = tracing_subscriber::registry().with(filter);
    if cfg.json {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .json()
                    .flatten_event(true),
            )
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
    }
}
