//! iacrun: run an IaC command across working directories, optionally through
//! a pluggable out-of-process execution engine.
//!
//! The engine subsystem lives in [`engine`]; [`runner`] drives it (or plain
//! process execution) for the CLI.
pub mod config;
pub mod engine;
pub mod logging;
pub mod runner;
pub mod util;
