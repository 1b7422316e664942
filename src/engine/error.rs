//! Error taxonomy for the engine subsystem.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Captured output of a delegated command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A command that the engine ran to completion with a non-zero result code.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    pub working_dir: String,
    pub command: String,
    pub args: Vec<String>,
    pub exit_code: i32,
    pub output: CommandOutput,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.command.as_str());
        argv.extend(self.args.iter().map(String::as_str));
        write!(
            f,
            "`{}` in {} exited with code {}",
            shell_words::join(argv),
            self.working_dir,
            self.exit_code
        )?;
        if !self.output.stderr.is_empty() {
            write!(f, "\n{}", self.output.stderr.trim_end())?;
        }
        Ok(())
    }
}

/// Errors raised while fetching, verifying, spawning, or talking to an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("resolve latest engine version from {url}: {reason}")]
    LatestVersion { url: String, reason: String },

    #[error("signature check failed for checksum manifest {}", manifest.display())]
    SignatureInvalid { manifest: PathBuf },

    #[error("checksum manifest {} has no entry for {artifact}", manifest.display())]
    ChecksumEntryMissing { artifact: String, manifest: PathBuf },

    #[error(
        "checksum mismatch for {}: expected {expected}, got {actual}",
        artifact.display()
    )]
    ChecksumMismatch {
        artifact: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("checksum manifest {} is malformed: {reason}", manifest.display())]
    MalformedManifest { manifest: PathBuf, reason: String },

    #[error("read {}: {source}", path.display())]
    VerificationIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("extract {}: {reason}", archive.display())]
    Extraction { archive: PathBuf, reason: String },

    #[error("spawn engine {}: {source}", engine.display())]
    Spawn {
        engine: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with engine {}: {reason}", engine.display())]
    Handshake { engine: PathBuf, reason: String },

    #[error("initialize engine for {working_dir}: {reason}")]
    InitFailed { working_dir: String, reason: String },

    #[error("{0}")]
    ExecutionFailure(Box<ExecutionFailure>),

    #[error("engine stream for {working_dir} broke: {reason}")]
    StreamRead { working_dir: String, reason: String },

    #[error("engine call cancelled")]
    Cancelled,

    #[error("engine registry is shut down")]
    RegistryClosed,

    #[error("invalid engine source {source_ref:?}: {reason}")]
    InvalidSource { source_ref: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EngineError::Io {
            context: context.into(),
            source,
        }
    }

    /// The captured failure when the engine reported a non-zero result code.
    pub fn execution_failure(&self) -> Option<&ExecutionFailure> {
        match self {
            EngineError::ExecutionFailure(failure) => Some(failure),
            _ => None,
        }
    }

    /// A copy for callers that observed someone else's failure. I/O sources
    /// keep their kind and message.
    pub(crate) fn duplicate(&self) -> EngineError {
        fn copy_io(err: &std::io::Error) -> std::io::Error {
            std::io::Error::new(err.kind(), err.to_string())
        }
        match self {
            EngineError::Download { url, reason } => EngineError::Download {
                url: url.clone(),
                reason: reason.clone(),
            },
            EngineError::LatestVersion { url, reason } => EngineError::LatestVersion {
                url: url.clone(),
                reason: reason.clone(),
            },
            EngineError::SignatureInvalid { manifest } => EngineError::SignatureInvalid {
                manifest: manifest.clone(),
            },
            EngineError::ChecksumEntryMissing { artifact, manifest } => {
                EngineError::ChecksumEntryMissing {
                    artifact: artifact.clone(),
                    manifest: manifest.clone(),
                }
            }
            EngineError::ChecksumMismatch {
                artifact,
                expected,
                actual,
            } => EngineError::ChecksumMismatch {
                artifact: artifact.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            },
            EngineError::MalformedManifest { manifest, reason } => {
                EngineError::MalformedManifest {
                    manifest: manifest.clone(),
                    reason: reason.clone(),
                }
            }
            EngineError::VerificationIo { path, source } => EngineError::VerificationIo {
                path: path.clone(),
                source: copy_io(source),
            },
            EngineError::Extraction { archive, reason } => EngineError::Extraction {
                archive: archive.clone(),
                reason: reason.clone(),
            },
            EngineError::Spawn { engine, source } => EngineError::Spawn {
                engine: engine.clone(),
                source: copy_io(source),
            },
            EngineError::Handshake { engine, reason } => EngineError::Handshake {
                engine: engine.clone(),
                reason: reason.clone(),
            },
            EngineError::InitFailed {
                working_dir,
                reason,
            } => EngineError::InitFailed {
                working_dir: working_dir.clone(),
                reason: reason.clone(),
            },
            EngineError::ExecutionFailure(failure) => {
                EngineError::ExecutionFailure(failure.clone())
            }
            EngineError::StreamRead {
                working_dir,
                reason,
            } => EngineError::StreamRead {
                working_dir: working_dir.clone(),
                reason: reason.clone(),
            },
            EngineError::Cancelled => EngineError::Cancelled,
            EngineError::RegistryClosed => EngineError::RegistryClosed,
            EngineError::InvalidSource { source_ref, reason } => EngineError::InvalidSource {
                source_ref: source_ref.clone(),
                reason: reason.clone(),
            },
            EngineError::Io { context, source } => EngineError::Io {
                context: context.clone(),
                source: copy_io(source),
            },
        }
    }

    /// Supply-chain integrity failures; these are never retried or bypassed.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            EngineError::SignatureInvalid { .. }
                | EngineError::ChecksumEntryMissing { .. }
                | EngineError::ChecksumMismatch { .. }
                | EngineError::MalformedManifest { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
