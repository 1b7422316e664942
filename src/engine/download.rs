//! Engine artifact download and installation into the local cache.
//!
//! `ensure_available` is idempotent: once the final artifact exists it is
//! returned without touching the network or taking a lock. Concurrent
//! callers for the same artifact serialize on a per-path lock, and the second
//! caller finds the artifact already installed.
use super::archive::{self, ArchiveKind};
use super::descriptor::{
    ArtifactLayout, EngineDescriptor, Platform, RepositoryRef, SourceKind, DEFAULT_SOURCE_HOST,
    LATEST_VERSION,
};
use super::error::{EngineError, EngineResult};
use super::fetch::{latest_release_url, Fetcher, DEFAULT_RELEASE_API};
use super::verify::Verifier;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One mutex per final artifact path.
#[derive(Debug, Default)]
pub struct DownloadLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl DownloadLocks {
    pub fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_default()
            .value()
            .clone()
    }
}

/// Resolved "latest" tags keyed by lookup URL.
#[derive(Debug, Default)]
pub struct VersionCache {
    tags: DashMap<String, String>,
}

impl VersionCache {
    pub fn get(&self, url: &str) -> Option<String> {
        self.tags.get(url).map(|tag| tag.value().clone())
    }

    pub fn insert(&self, url: String, tag: String) {
        self.tags.insert(url, tag);
    }
}

/// Where a descriptor's artifact lives locally.
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub source: SourceKind,
    /// `None` for local files, which are used in place.
    pub layout: Option<ArtifactLayout>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DownloadItem {
    url: String,
    file_name: String,
}

/// Files to fetch for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DownloadPlan {
    artifact: DownloadItem,
    /// Checksum manifest and signature; absent for raw URL sources.
    side_files: Option<(DownloadItem, DownloadItem)>,
}

impl DownloadPlan {
    fn for_source(source: &SourceKind, layout: &ArtifactLayout) -> Option<Self> {
        match source {
            SourceKind::LocalFile(_) => None,
            SourceKind::Url(url) => Some(Self {
                artifact: DownloadItem {
                    url: url.clone(),
                    file_name: layout.download_name(),
                },
                side_files: None,
            }),
            SourceKind::Repository(repo) => {
                let item = |file_name: String| DownloadItem {
                    url: repo.release_download_url(&layout.version, &file_name),
                    file_name,
                };
                Some(Self {
                    artifact: item(layout.download_name()),
                    side_files: Some((
                        item(layout.checksums_name()),
                        item(layout.signature_name()),
                    )),
                })
            }
        }
    }
}

/// Fetches, verifies and installs engine artifacts under a cache root.
pub struct Downloader {
    cache_root: PathBuf,
    release_api: String,
    platform: Platform,
    skip_verify: bool,
    fetcher: Arc<dyn Fetcher>,
    verifier: Verifier,
    locks: DownloadLocks,
    versions: VersionCache,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("cache_root", &self.cache_root)
            .field("release_api", &self.release_api)
            .field("platform", &self.platform)
            .field("skip_verify", &self.skip_verify)
            .finish_non_exhaustive()
    }
}

impl Downloader {
    pub fn new(
        cache_root: impl Into<PathBuf>,
        fetcher: Arc<dyn Fetcher>,
        verifier: Verifier,
    ) -> Self {
        Self {
            cache_root: cache_root.into(),
            release_api: DEFAULT_RELEASE_API.to_string(),
            platform: Platform::current(),
            skip_verify: false,
            fetcher,
            verifier,
            locks: DownloadLocks::default(),
            versions: VersionCache::default(),
        }
    }

    pub fn skip_verification(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_release_api(mut self, api_base: impl Into<String>) -> Self {
        self.release_api = api_base.into();
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Resolve the version and local path without downloading anything.
    pub fn resolve(&self, descriptor: &EngineDescriptor) -> EngineResult<ResolvedArtifact> {
        let source = descriptor.source_kind()?;
        if let SourceKind::LocalFile(path) = &source {
            return Ok(ResolvedArtifact {
                path: path.clone(),
                source,
                layout: None,
            });
        }
        let version = self.resolve_version(&source, descriptor)?;
        let layout = ArtifactLayout::new(
            &source.engine_name(),
            &descriptor.engine_type,
            &version,
            self.platform.clone(),
        );
        Ok(ResolvedArtifact {
            path: layout.artifact_path(&self.cache_root),
            source,
            layout: Some(layout),
        })
    }

    fn resolve_version(
        &self,
        source: &SourceKind,
        descriptor: &EngineDescriptor,
    ) -> EngineResult<String> {
        if !descriptor.needs_latest() {
            return Ok(descriptor.version.trim().to_string());
        }
        let SourceKind::Repository(repo) = source else {
            return Ok(LATEST_VERSION.to_string());
        };
        let url = self.latest_url(repo);
        if let Some(tag) = self.versions.get(&url) {
            return Ok(tag);
        }
        let tag = self.fetcher.latest_tag(&url)?;
        tracing::info!(url = %url, tag = %tag, "resolved latest engine release");
        self.versions.insert(url, tag.clone());
        Ok(tag)
    }

    fn latest_url(&self, repo: &RepositoryRef) -> String {
        if repo.host == DEFAULT_SOURCE_HOST {
            latest_release_url(&self.release_api, &repo.owner, &repo.repo)
        } else {
            latest_release_url(&format!("https://{}/api/v3", repo.host), &repo.owner, &repo.repo)
        }
    }

    /// Make the engine binary for `descriptor` available locally.
    pub fn ensure_available(&self, descriptor: &EngineDescriptor) -> EngineResult<PathBuf> {
        let resolved = self.resolve(descriptor)?;
        let Some(layout) = resolved.layout.clone() else {
            return Ok(resolved.path);
        };
        let Some(plan) = DownloadPlan::for_source(&resolved.source, &layout) else {
            return Ok(resolved.path);
        };
        let final_path = resolved.path;
        if final_path.is_file() {
            tracing::debug!(artifact = %final_path.display(), "engine already cached");
            return Ok(final_path);
        }

        let lock = self.locks.lock_for(&final_path);
        let _guard = lock.lock();
        if final_path.is_file() {
            return Ok(final_path);
        }

        let cache_dir = layout.cache_dir(&self.cache_root);
        fs::create_dir_all(&cache_dir)
            .map_err(|err| EngineError::io(format!("create {}", cache_dir.display()), err))?;
        let staging = tempfile::Builder::new()
            .prefix(".download-")
            .tempdir_in(&cache_dir)
            .map_err(|err| {
                EngineError::io(format!("create staging dir in {}", cache_dir.display()), err)
            })?;

        let artifact = staging.path().join(&plan.artifact.file_name);
        self.fetcher.fetch_to_file(&plan.artifact.url, &artifact)?;
        match &plan.side_files {
            Some((checksums, signature)) => {
                let checksums_path = staging.path().join(&checksums.file_name);
                let signature_path = staging.path().join(&signature.file_name);
                self.fetcher.fetch_to_file(&checksums.url, &checksums_path)?;
                self.fetcher.fetch_to_file(&signature.url, &signature_path)?;
                if self.skip_verify {
                    tracing::warn!(artifact = %artifact.display(), "engine verification skipped");
                } else {
                    self.verifier.verify(&artifact, &checksums_path, &signature_path)?;
                    tracing::debug!(artifact = %artifact.display(), "engine verified");
                }
            }
            None => {
                tracing::warn!(
                    url = %plan.artifact.url,
                    "engine downloaded from a raw URL has no checksums; skipping verification"
                );
            }
        }

        install(&artifact, &cache_dir, &final_path, &layout.artifact_name())?;
        tracing::info!(artifact = %final_path.display(), "engine installed");
        Ok(final_path)
    }
}

/// Move a verified download into place, unpacking archives first.
fn install(
    staged: &Path,
    cache_dir: &Path,
    final_path: &Path,
    artifact_name: &str,
) -> EngineResult<()> {
    match archive::detect(staged)? {
        ArchiveKind::Plain => rename(staged, final_path)?,
        _ => {
            let unpack = tempfile::Builder::new()
                .prefix(".extract-")
                .tempdir_in(cache_dir)
                .map_err(|err| {
                    EngineError::io(
                        format!("create extraction dir in {}", cache_dir.display()),
                        err,
                    )
                })?;
            archive::extract(staged, unpack.path(), artifact_name)?;
            let files = archive::regular_files(unpack.path())?;
            match files.as_slice() {
                [single] => rename(single, final_path)?,
                _ => move_entries(unpack.path(), cache_dir)?,
            }
        }
    }
    if !final_path.is_file() {
        return Err(EngineError::Extraction {
            archive: staged.to_path_buf(),
            reason: format!("archive did not contain {artifact_name}"),
        });
    }
    make_executable(final_path)
}

fn move_entries(from: &Path, to: &Path) -> EngineResult<()> {
    let entries = fs::read_dir(from)
        .map_err(|err| EngineError::io(format!("read {}", from.display()), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| EngineError::io(format!("read {}", from.display()), err))?;
        let dest = to.join(entry.file_name());
        if dest.is_dir() {
            fs::remove_dir_all(&dest)
                .map_err(|err| EngineError::io(format!("replace {}", dest.display()), err))?;
        }
        rename(&entry.path(), &dest)?;
    }
    Ok(())
}

fn rename(from: &Path, to: &Path) -> EngineResult<()> {
    fs::rename(from, to)
        .map_err(|err| EngineError::io(format!("move {} to {}", from.display(), to.display()), err))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> EngineResult<()> {
    archive::set_mode(path, 0o755)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> EngineResult<()> {
    Ok(())
}

#[cfg(test)]
#[path = "download_tests.rs"]
mod tests;
