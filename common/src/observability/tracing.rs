//! Tracing initialization.
//!
//! Centralizes tracing config so every entry point behaves the same:
//! `RUST_LOG` is honoured via `EnvFilter`, and log output can be
//! diverted to a file with the server's `-l` option.

use crate::ColorWhen;
use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// With `log_file` set, output goes to that file (truncating any
/// previous contents) with ANSI disabled; otherwise output goes to the
/// console with ANSI controlled by `color`.
///
/// # Errors
///
/// Returns error if the log file cannot be created.
pub fn init_tracing(color: ColorWhen, log_file: Option<&Path>) -> Result<()> {
    // ---
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;

            fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            fmt()
                .with_env_filter(env_filter)
                .with_ansi(color.should_color_stderr())
                .init();
        }
    }

    Ok(())
}
