//! Tracing setup for the CLI and the bundled engine.
//!
//! Logs always go to stderr: stdout belongs to the delegated command (and,
//! inside an engine, to the protocol).
use anyhow::{anyhow, Result};
use std::io;
use tracing_subscriber::EnvFilter;

/// Install the CLI subscriber. `RUST_LOG` wins unless `verbose` is set.
pub fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(verbose)
        .try_init()
        .map_err(|err| anyhow!("install tracing subscriber: {err}"))
}

/// Install the subscriber inside an engine process, at the level the host
/// passed down. Output carries no ANSI codes since the host re-logs it.
pub fn init_engine_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .without_time()
        .try_init()
        .map_err(|err| anyhow!("install tracing subscriber: {err}"))
}
