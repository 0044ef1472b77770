//! Multi-layer tracing setup shared by all fleet roles.
//!
//! Each process writes a compact text log and a structured JSON log, both
//! daily-rotated under `logs/`, plus a terse stdout stream. Files are named
//! after the role so several workers on one host do not interleave.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the tracing subscriber for one fleet process.
///
/// `role_tag` becomes part of the log file names, e.g. `general-2.log` and
/// `general-2.json.log`. Level filtering comes from `RUST_LOG`, defaulting
/// to `info`.
///
/// # Panics
/// Panics if a subscriber is already installed.
pub fn init_logging<P: AsRef<Path>>(
    log_dir: P,
    role_tag: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let text_appender =
        tracing_appender::rolling::daily(log_path, format!("{}.log", role_tag));
    let (text_writer, text_guard) = tracing_appender::non_blocking(text_appender);

    let json_appender =
        tracing_appender::rolling::daily(log_path, format!("{}.json.log", role_tag));
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_appender);

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_target(true)
        .with_ansi(false)
        .compact()
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        );

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        );

    let stdout_layer = fmt::layer()
        .with_target(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer)
        .init();

    // The non-blocking writers stop flushing once their guards drop, so the
    // guards must outlive the process.
    Box::leak(Box::new(text_guard));
    Box::leak(Box::new(json_guard));

    tracing::info!(dir = %log_path.display(), role = role_tag, "logging initialized");

    Ok(())
}
