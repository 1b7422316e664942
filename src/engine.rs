//! Out-of-process execution engines.
//!
//! Instead of running the wrapped IaC tool directly, commands can be
//! delegated to an engine binary. The pieces, leaves first:
//!
//! - [`verify`]: signed checksum manifests for downloaded artifacts.
//! - [`download`] (with [`fetch`] and [`archive`]): resolves, fetches and
//!   installs an engine into the local cache.
//! - [`host`] and [`protocol`]: spawns the engine and performs the handshake.
//! - [`registry`]: one live session per working directory.
//! - [`invoker`] and [`stream`]: Init/Run/Shutdown calls and output
//!   multiplexing.
//!
//! [`EngineContext`] ties them together for one orchestrator run.
pub mod archive;
pub mod context;
pub mod descriptor;
pub mod download;
pub mod error;
pub mod fetch;
pub mod host;
pub mod invoker;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod stream;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{
    default_cache_root, CancelToken, EngineContext, EngineContextBuilder, EngineSettings,
    ExecutionOptions,
};
pub use descriptor::{EngineDescriptor, Platform, SourceKind};
pub use error::{CommandOutput, EngineError, EngineResult, ExecutionFailure};
pub use invoker::ShutdownSummary;
pub use stream::OutputSink;
pub use verify::Verifier;
