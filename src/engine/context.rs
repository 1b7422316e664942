//! Per-run engine state.
//!
//! An [`EngineContext`] owns everything that must not leak between
//! independent runs: the instance registry, the download locks and the
//! version cache. `run` and `shutdown` live in the invoker module.
use super::descriptor::{EngineDescriptor, Platform};
use super::download::Downloader;
use super::error::EngineResult;
use super::fetch::{Fetcher, HttpFetcher};
use super::host::{ProcessHost, SessionHost};
use super::registry::InstanceRegistry;
use super::stream::OutputSink;
use super::verify::Verifier;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default engine log level passed to spawned engines.
pub const DEFAULT_ENGINE_LOG_LEVEL: &str = "info";

/// Cooperative cancellation flag shared between a caller and its calls.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Switches that control how engines are obtained and run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub enabled: bool,
    pub cache_path: PathBuf,
    pub skip_check: bool,
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_path: default_cache_root(),
            skip_check: false,
            log_level: DEFAULT_ENGINE_LOG_LEVEL.to_string(),
        }
    }
}

/// `~/.cache/iacrun/plugins/iac-engine`
pub fn default_cache_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".cache")
        .join("iacrun")
        .join("plugins")
        .join("iac-engine")
}

/// One command to run in one working directory.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub working_dir: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub allocate_pseudo_tty: bool,
    pub env: BTreeMap<String, String>,
    pub stdout: OutputSink,
    pub stderr: OutputSink,
}

impl ExecutionOptions {
    /// Options writing to the process's own stdout and stderr.
    pub fn new(working_dir: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            working_dir: working_dir.into(),
            command: command.into(),
            args: Vec::new(),
            allocate_pseudo_tty: false,
            env: BTreeMap::new(),
            stdout: OutputSink::stdout(),
            stderr: OutputSink::stderr(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_sinks(mut self, stdout: OutputSink, stderr: OutputSink) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn with_pseudo_tty(mut self, allocate: bool) -> Self {
        self.allocate_pseudo_tty = allocate;
        self
    }

    /// Registry key: the working directory as given.
    pub fn working_dir_key(&self) -> String {
        self.working_dir.display().to_string()
    }
}

/// Engine state scoped to one orchestrator run.
pub struct EngineContext {
    pub(crate) descriptor: EngineDescriptor,
    pub(crate) settings: EngineSettings,
    pub(crate) downloader: Downloader,
    pub(crate) host: Arc<dyn SessionHost>,
    pub(crate) registry: InstanceRegistry,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("descriptor", &self.descriptor)
            .field("settings", &self.settings)
            .field("downloader", &self.downloader)
            .field("live_instances", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    /// Context with the HTTP fetcher, the embedded release key and child
    /// process hosting.
    pub fn new(descriptor: EngineDescriptor, settings: EngineSettings) -> EngineResult<Self> {
        Self::builder(descriptor).settings(settings).build()
    }

    pub fn builder(descriptor: EngineDescriptor) -> EngineContextBuilder {
        EngineContextBuilder {
            descriptor,
            settings: EngineSettings::default(),
            fetcher: None,
            verifier: None,
            host: None,
            platform: None,
            release_api: None,
        }
    }

    pub fn descriptor(&self) -> &EngineDescriptor {
        &self.descriptor
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn cache_root(&self) -> &Path {
        self.downloader.cache_root()
    }

    /// Number of live engine sessions.
    pub fn live_instances(&self) -> usize {
        self.registry.len()
    }
}

/// Builder for [`EngineContext`]; every collaborator has a production default.
pub struct EngineContextBuilder {
    descriptor: EngineDescriptor,
    settings: EngineSettings,
    fetcher: Option<Arc<dyn Fetcher>>,
    verifier: Option<Verifier>,
    host: Option<Arc<dyn SessionHost>>,
    platform: Option<Platform>,
    release_api: Option<String>,
}

impl EngineContextBuilder {
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn host(mut self, host: Arc<dyn SessionHost>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn release_api(mut self, api_base: impl Into<String>) -> Self {
        self.release_api = Some(api_base.into());
        self
    }

    pub fn build(self) -> EngineResult<EngineContext> {
        let verifier = match self.verifier {
            Some(verifier) => verifier,
            None => Verifier::embedded()?,
        };
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpFetcher::new()));
        let mut downloader = Downloader::new(self.settings.cache_path.clone(), fetcher, verifier)
            .skip_verification(self.settings.skip_check);
        if let Some(platform) = self.platform {
            downloader = downloader.with_platform(platform);
        }
        if let Some(api_base) = self.release_api {
            downloader = downloader.with_release_api(api_base);
        }
        if self.settings.skip_check {
            tracing::warn!("engine signature and checksum verification is disabled");
        }
        Ok(EngineContext {
            descriptor: self.descriptor,
            settings: self.settings,
            downloader,
            host: self
                .host
                .unwrap_or_else(|| Arc::new(ProcessHost::default())),
            registry: InstanceRegistry::new(),
        })
    }
}
