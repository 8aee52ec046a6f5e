//! Diagnostic logging for the CLI.
//!
//! Filter with `STREAKLINE_LOG` (an `EnvFilter` directive string); pick the
//! output shape with `STREAKLINE_LOG_FORMAT=compact|json`. Everything goes to
//! stderr so `stats --json` output stays clean on stdout.
//!
//! The library only emits `tracing` events and never installs a subscriber.

use std::env;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// Unknown values fall back to compact output.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

fn default_directives() -> &'static str {
    if env::var("DEBUG").is_ok() {
        "streakline=debug,info"
    } else {
        "streakline=warn"
    }
}

/// Install the global subscriber. Call once at startup; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_env("STREAKLINE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_directives()));

    let format = LogFormat::from_env_value(env::var("STREAKLINE_LOG_FORMAT").ok().as_deref());

    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
    };
    if result.is_err() {
        eprintln!("Warning: a tracing subscriber was already installed");
    }
}
