//! Tracing initialization and terminal color policy.
//!
//! Both binaries call [`init_tracing`] once at startup so log output looks
//! the same on either side of a call.

use anyhow::Result;
use std::env;
use tracing_subscriber::{fmt, EnvFilter};

/// When to emit ANSI colors in log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorWhen {
    /// Color only when stderr is a terminal and `NO_COLOR` is unset.
    Auto,
    Always,
    Never,
}

impl ColorWhen {
    // ---
    /// Resolves the policy against the environment and stderr.
    pub fn enabled(self) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => env::var_os("NO_COLOR").is_none() && atty::is(atty::Stream::Stderr),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// - Respects `RUST_LOG` via `EnvFilter` (default `info`).
/// - Logs go to stderr; ANSI color controlled by `ColorWhen`.
pub fn init_tracing(color: ColorWhen) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(color.enabled())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
