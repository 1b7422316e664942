//! HTTP transport for engine releases.
//!
//! The downloader only needs two operations, so the transport is a small
//! trait; tests substitute an in-memory implementation.
use super::error::{EngineError, EngineResult};
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

/// Default timeout for a single release request.
const DEFAULT_TIMEOUT_SECS: u64 = 300;
/// Default release metadata API base.
pub const DEFAULT_RELEASE_API: &str = "https://api.github.com";

/// Fetches engine release files.
pub trait Fetcher: Send + Sync {
    /// Download `url` into `dest`, replacing any existing file.
    fn fetch_to_file(&self, url: &str, dest: &Path) -> EngineResult<()>;

    /// Resolve the tag name of the newest release from a metadata URL.
    fn latest_tag(&self, url: &str) -> EngineResult<String>;
}

#[derive(Debug, Deserialize)]
struct ReleaseMetadata {
    tag_name: String,
}

/// `ureq`-backed [`Fetcher`].
#[derive(Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
    timeout: Duration,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .user_agent(concat!("iacrun/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            agent: config.into(),
            timeout,
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch_to_file(&self, url: &str, dest: &Path) -> EngineResult<()> {
        let download_err = |reason: String| EngineError::Download {
            url: url.to_string(),
            reason,
        };
        tracing::debug!(url, dest = %dest.display(), "downloading");
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|err| download_err(err.to_string()))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| download_err(format!("create {}: {err}", parent.display())))?;
        }
        let mut file = File::create(dest)
            .map_err(|err| download_err(format!("create {}: {err}", dest.display())))?;
        let mut reader = response.into_body().into_reader();
        io::copy(&mut reader, &mut file)
            .map_err(|err| download_err(format!("write {}: {err}", dest.display())))?;
        file.flush()
            .map_err(|err| download_err(format!("flush {}: {err}", dest.display())))?;
        Ok(())
    }

    fn latest_tag(&self, url: &str) -> EngineResult<String> {
        let latest_err = |reason: String| EngineError::LatestVersion {
            url: url.to_string(),
            reason,
        };
        let mut response = self
            .agent
            .get(url)
            .header("Accept", "application/vnd.github+json")
            .call()
            .map_err(|err| latest_err(err.to_string()))?;
        let metadata: ReleaseMetadata = response
            .body_mut()
            .read_json()
            .map_err(|err| latest_err(err.to_string()))?;
        let tag = metadata.tag_name.trim().to_string();
        if tag.is_empty() {
            return Err(latest_err("release has an empty tag_name".to_string()));
        }
        Ok(tag)
    }
}

/// `{api}/repos/{owner}/{repo}/releases/latest`
pub fn latest_release_url(api_base: &str, owner: &str, repo: &str) -> String {
    format!(
        "{}/repos/{owner}/{repo}/releases/latest",
        api_base.trim_end_matches('/')
    )
}
