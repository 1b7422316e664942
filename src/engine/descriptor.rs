//! Engine descriptors and the artifact naming convention shared with
//! published engine releases.
//!
//! Published engines follow a fixed layout so that any release can be fetched
//! from the descriptor alone:
//!
//! ```text
//! https://{host}/{owner}/{repo}/releases/download/{version}/
//!     terragrunt-iac-{name}_{type}_{version}_{os}_{arch}.zip
//!     terragrunt-iac-{name}_{type}_{version}_SHA256SUMS
//!     terragrunt-iac-{name}_{type}_{version}_SHA256SUMS.sig
//! ```
use super::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Prefix of every published engine artifact.
pub const ARTIFACT_PREFIX: &str = "terragrunt-iac-";
/// Prefix trimmed from repository names when deriving the engine name.
pub const NAME_PREFIX_TRIM: &str = "terragrunt-";
/// Host used for bare `owner/repo` sources.
pub const DEFAULT_SOURCE_HOST: &str = "github.com";
/// Engine type used when the descriptor leaves it empty.
pub const DEFAULT_ENGINE_TYPE: &str = "tofu";
/// Version string meaning "resolve the newest release".
pub const LATEST_VERSION: &str = "latest";

/// Identifies which engine to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineDescriptor {
    pub source: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "type", default = "default_engine_type")]
    pub engine_type: String,
    #[serde(default)]
    pub meta: BTreeMap<String, serde_json::Value>,
}

fn default_engine_type() -> String {
    DEFAULT_ENGINE_TYPE.to_string()
}

impl EngineDescriptor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            version: String::new(),
            engine_type: default_engine_type(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_type(mut self, engine_type: impl Into<String>) -> Self {
        self.engine_type = engine_type.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// True when the version still needs a release lookup.
    pub fn needs_latest(&self) -> bool {
        let version = self.version.trim();
        version.is_empty() || version == LATEST_VERSION
    }

    /// Classify the source string.
    pub fn source_kind(&self) -> EngineResult<SourceKind> {
        SourceKind::parse(&self.source)
    }
}

/// Where an engine comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// An engine binary already present on disk.
    LocalFile(PathBuf),
    /// A raw artifact URL; no checksum or signature side files exist.
    Url(String),
    /// A release repository such as `github.com/acme/fast-engine`.
    Repository(RepositoryRef),
}

/// A repository hosting engine releases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    pub host: String,
    pub owner: String,
    pub repo: String,
}

impl RepositoryRef {
    /// `https://{host}/{owner}/{repo}`
    pub fn base_url(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.owner, self.repo)
    }

    pub fn release_download_url(&self, version: &str, file_name: &str) -> String {
        format!("{}/releases/download/{version}/{file_name}", self.base_url())
    }
}

impl SourceKind {
    pub fn parse(source: &str) -> EngineResult<SourceKind> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(invalid(source, "source is empty"));
        }
        let local = expand_home(trimmed);
        if local.is_file() {
            return Ok(SourceKind::LocalFile(local));
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            return Ok(SourceKind::Url(trimmed.to_string()));
        }
        if is_path_like(trimmed) {
            return Err(invalid(
                source,
                &format!("local engine file not found: {}", local.display()),
            ));
        }

        let segments: Vec<&str> = trimmed
            .trim_end_matches('/')
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        match segments.as_slice() {
            [owner, repo] => Ok(SourceKind::Repository(RepositoryRef {
                host: DEFAULT_SOURCE_HOST.to_string(),
                owner: owner.to_string(),
                repo: repo.to_string(),
            })),
            [host, owner, repo] if is_host(host) => {
                Ok(SourceKind::Repository(RepositoryRef {
                    host: host.to_string(),
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                }))
            }
            _ => Err(invalid(
                source,
                "expected a local file, an http(s) URL, or owner/repo",
            )),
        }
    }

    /// Engine name used in cache paths and artifact names.
    pub fn engine_name(&self) -> String {
        let raw = match self {
            SourceKind::LocalFile(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            SourceKind::Url(url) => strip_archive_extension(last_segment(url)).to_string(),
            SourceKind::Repository(repo) => repo.repo.clone(),
        };
        raw.strip_prefix(NAME_PREFIX_TRIM)
            .map(str::to_string)
            .unwrap_or(raw)
    }
}

fn invalid(source: &str, reason: &str) -> EngineError {
    EngineError::InvalidSource {
        source_ref: source.to_string(),
        reason: reason.to_string(),
    }
}

/// `~/x` relative to the home directory; anything else as given.
fn expand_home(source: &str) -> PathBuf {
    match source.strip_prefix("~/") {
        Some(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => PathBuf::from(source),
        },
        None => PathBuf::from(source),
    }
}

/// Sources that can only mean a file on disk.
fn is_path_like(source: &str) -> bool {
    source.starts_with('/')
        || source.starts_with('~')
        || source.starts_with('\\')
        || source
            .split(['/', '\\'])
            .any(|segment| segment == "." || segment == "..")
}

fn is_host(segment: &str) -> bool {
    segment.contains('.')
        && !segment.starts_with('.')
        && !segment.ends_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
}

fn last_segment(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(without_query)
}

fn strip_archive_extension(name: &str) -> &str {
    for ext in [".tar.gz", ".tgz", ".zip", ".gz", ".tar"] {
        if let Some(stripped) = name.strip_suffix(ext) {
            return stripped;
        }
    }
    name
}

/// Operating system and architecture in the naming used by release assets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn current() -> Self {
        Self::from_rust(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_rust(os: &str, arch: &str) -> Self {
        let os = match os {
            "macos" => "darwin",
            other => other,
        };
        let arch = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            other => other,
        };
        Self {
            os: os.to_string(),
            arch: arch.to_string(),
        }
    }
}

/// File names and cache locations for one resolved engine release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    pub engine_name: String,
    pub engine_type: String,
    pub version: String,
    pub platform: Platform,
}

impl ArtifactLayout {
    /// `{type}` and `{version}` must already be resolved.
    pub fn new(engine_name: &str, engine_type: &str, version: &str, platform: Platform) -> Self {
        Self {
            engine_name: engine_name.to_string(),
            engine_type: engine_type.to_string(),
            version: version.to_string(),
            platform,
        }
    }

    /// `terragrunt-iac-{name}_{type}_{version}_{os}_{arch}`
    pub fn artifact_name(&self) -> String {
        format!(
            "{ARTIFACT_PREFIX}{}_{}_{}_{}_{}",
            self.engine_name,
            self.engine_type,
            self.version,
            self.platform.os,
            self.platform.arch
        )
    }

    pub fn download_name(&self) -> String {
        format!("{}.zip", self.artifact_name())
    }

    pub fn checksums_name(&self) -> String {
        format!(
            "{ARTIFACT_PREFIX}{}_{}_{}_SHA256SUMS",
            self.engine_name, self.engine_type, self.version
        )
    }

    pub fn signature_name(&self) -> String {
        format!("{}.sig", self.checksums_name())
    }

    /// `{root}/{name}/{type}/{version}/{os}/{arch}`
    pub fn cache_dir(&self, cache_root: &Path) -> PathBuf {
        cache_root
            .join(&self.engine_name)
            .join(&self.engine_type)
            .join(&self.version)
            .join(&self.platform.os)
            .join(&self.platform.arch)
    }

    pub fn artifact_path(&self, cache_root: &Path) -> PathBuf {
        self.cache_dir(cache_root).join(self.artifact_name())
    }
}
