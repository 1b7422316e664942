use super::*;
use crate::engine::archive::tests::write_zip;
use crate::util::sha256_hex;
use ed25519_dalek::{Signer, SigningKey};
use std::collections::HashMap;
use std::thread;

const RELEASE_BASE: &str = "https://github.com/acme/fast-engine/releases/download/v2.3.0";
const LATEST_URL: &str = "https://api.github.com/repos/acme/fast-engine/releases/latest";
const ARTIFACT: &str = "terragrunt-iac-fast-engine_iac_v2.3.0_linux_amd64";
const MANIFEST: &str = "terragrunt-iac-fast-engine_iac_v2.3.0_SHA256SUMS";

#[derive(Default)]
struct MockFetcher {
    files: HashMap<String, Vec<u8>>,
    tags: HashMap<String, String>,
    fetched: Mutex<Vec<String>>,
    lookups: Mutex<Vec<String>>,
}

impl MockFetcher {
    fn with_file(mut self, url: &str, bytes: Vec<u8>) -> Self {
        self.files.insert(url.to_string(), bytes);
        self
    }

    fn with_tag(mut self, url: &str, tag: &str) -> Self {
        self.tags.insert(url.to_string(), tag.to_string());
        self
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }
}

impl Fetcher for MockFetcher {
    fn fetch_to_file(&self, url: &str, dest: &Path) -> EngineResult<()> {
        self.fetched.lock().push(url.to_string());
        let bytes = self.files.get(url).ok_or_else(|| EngineError::Download {
            url: url.to_string(),
            reason: "404 Not Found".to_string(),
        })?;
        fs::write(dest, bytes)
            .map_err(|err| EngineError::io(format!("write {}", dest.display()), err))
    }

    fn latest_tag(&self, url: &str) -> EngineResult<String> {
        self.lookups.lock().push(url.to_string());
        self.tags.get(url).cloned().ok_or_else(|| EngineError::LatestVersion {
            url: url.to_string(),
            reason: "404 Not Found".to_string(),
        })
    }
}

fn signing_key() -> SigningKey {
    SigningKey::from_bytes(&[7u8; 32])
}

fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("engine.zip");
    write_zip(&path, entries);
    fs::read(&path).expect("read zip")
}

/// Fetcher serving a signed v2.3.0 release whose zip holds `entries`.
fn signed_release(entries: &[(&str, &[u8])]) -> MockFetcher {
    let archive = zip_bytes(entries);
    let manifest = format!("{}  {ARTIFACT}.zip\n", sha256_hex(&archive));
    let signature = signing_key().sign(manifest.as_bytes()).to_bytes().to_vec();
    MockFetcher::default()
        .with_tag(LATEST_URL, "v2.3.0")
        .with_file(&format!("{RELEASE_BASE}/{ARTIFACT}.zip"), archive)
        .with_file(&format!("{RELEASE_BASE}/{MANIFEST}"), manifest.into_bytes())
        .with_file(&format!("{RELEASE_BASE}/{MANIFEST}.sig"), signature)
}

fn downloader(cache: &Path, fetcher: &Arc<MockFetcher>) -> Downloader {
    let fetcher: Arc<dyn Fetcher> = fetcher.clone();
    Downloader::new(cache, fetcher, Verifier::with_key(signing_key().verifying_key()))
        .with_platform(Platform::from_rust("linux", "x86_64"))
}

fn fast_engine() -> EngineDescriptor {
    EngineDescriptor::new("acme/fast-engine")
        .with_version("latest")
        .with_type("iac")
}

#[test]
fn latest_release_is_resolved_verified_and_extracted() {
    let cache = tempfile::tempdir().expect("tempdir");
    let fetcher = Arc::new(signed_release(&[(ARTIFACT, b"#!/bin/sh\necho engine\n")]));
    let path = downloader(cache.path(), &fetcher)
        .ensure_available(&fast_engine())
        .expect("engine installed");

    assert_eq!(*fetcher.lookups.lock(), vec![LATEST_URL.to_string()]);
    assert_eq!(
        fetcher.fetched(),
        vec![
            format!("{RELEASE_BASE}/{ARTIFACT}.zip"),
            format!("{RELEASE_BASE}/{MANIFEST}"),
            format!("{RELEASE_BASE}/{MANIFEST}.sig"),
        ]
    );
    assert!(path.ends_with(
        "fast-engine/iac/v2.3.0/linux/amd64/terragrunt-iac-fast-engine_iac_v2.3.0_linux_amd64"
    ));
    assert_eq!(fs::read(&path).expect("read"), b"#!/bin/sh\necho engine\n");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "artifact is executable");
    }
}

#[test]
fn second_call_reuses_cached_artifact() {
    let cache = tempfile::tempdir().expect("tempdir");
    let fetcher = Arc::new(signed_release(&[(ARTIFACT, b"engine")]));
    let downloader = downloader(cache.path(), &fetcher);
    let first = downloader.ensure_available(&fast_engine()).expect("first");
    let second = downloader.ensure_available(&fast_engine()).expect("second");
    assert_eq!(first, second);
    assert_eq!(fetcher.fetched().len(), 3);
    assert_eq!(fetcher.lookups.lock().len(), 1, "latest tag is cached");
}

#[test]
fn concurrent_callers_download_once() {
    let cache = tempfile::tempdir().expect("tempdir");
    let fetcher = Arc::new(signed_release(&[(ARTIFACT, b"engine")]));
    let downloader = downloader(cache.path(), &fetcher);
    let descriptor = fast_engine().with_version("v2.3.0");
    let paths: Vec<PathBuf> = thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|_| scope.spawn(|| downloader.ensure_available(&descriptor)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("join").expect("ensure"))
            .collect()
    });
    assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(fetcher.fetched().len(), 3);
    assert!(fetcher.lookups.lock().is_empty(), "explicit version needs no lookup");
}

#[test]
fn failed_verification_installs_nothing() {
    let cache = tempfile::tempdir().expect("tempdir");
    let mut release = signed_release(&[(ARTIFACT, b"engine")]);
    let url = format!("{RELEASE_BASE}/{ARTIFACT}.zip");
    let tampered = zip_bytes(&[(ARTIFACT, b"evil engine")]);
    release.files.insert(url, tampered);
    let fetcher = Arc::new(release);
    let downloader = downloader(cache.path(), &fetcher);

    let err = downloader
        .ensure_available(&fast_engine())
        .expect_err("tampered artifact");
    assert!(matches!(err, EngineError::ChecksumMismatch { .. }), "{err}");
    assert!(err.is_integrity_failure());
    let resolved = downloader.resolve(&fast_engine()).expect("resolve");
    assert!(!resolved.path.exists());
    let leftovers = archive::regular_files(cache.path()).expect("walk cache");
    assert!(leftovers.is_empty(), "staging removed: {leftovers:?}");
}

#[test]
fn skip_verification_accepts_unsigned_release() {
    let cache = tempfile::tempdir().expect("tempdir");
    let mut release = signed_release(&[(ARTIFACT, b"engine")]);
    release
        .files
        .insert(format!("{RELEASE_BASE}/{MANIFEST}.sig"), vec![0u8; 64]);
    let fetcher = Arc::new(release);
    let path = downloader(cache.path(), &fetcher)
        .skip_verification(true)
        .ensure_available(&fast_engine())
        .expect("verification skipped");
    assert!(path.is_file());
}

#[test]
fn missing_side_file_is_download_error() {
    let cache = tempfile::tempdir().expect("tempdir");
    let mut release = signed_release(&[(ARTIFACT, b"engine")]);
    release.files.remove(&format!("{RELEASE_BASE}/{MANIFEST}.sig"));
    let fetcher = Arc::new(release);
    let err = downloader(cache.path(), &fetcher)
        .ensure_available(&fast_engine())
        .expect_err("no signature");
    assert!(matches!(err, EngineError::Download { ref url, .. } if url.ends_with(".sig")), "{err}");
}

#[test]
fn multi_file_archive_lands_in_cache_dir() {
    let cache = tempfile::tempdir().expect("tempdir");
    let fetcher = Arc::new(signed_release(&[
        (ARTIFACT, b"engine"),
        ("LICENSE", b"MIT"),
    ]));
    let path = downloader(cache.path(), &fetcher)
        .ensure_available(&fast_engine())
        .expect("installed");
    assert_eq!(fs::read(&path).expect("read"), b"engine");
    assert!(path.with_file_name("LICENSE").is_file());
}

#[test]
fn archive_without_the_engine_is_extraction_error() {
    let cache = tempfile::tempdir().expect("tempdir");
    let fetcher = Arc::new(signed_release(&[("README", b"a"), ("docs/b", b"b")]));
    let err = downloader(cache.path(), &fetcher)
        .ensure_available(&fast_engine())
        .expect_err("engine missing from archive");
    assert!(matches!(err, EngineError::Extraction { .. }), "{err}");
}

#[test]
fn local_file_is_used_in_place() {
    let cache = tempfile::tempdir().expect("tempdir");
    let local = cache.path().join("my-engine");
    fs::write(&local, b"engine").expect("write");
    let fetcher = Arc::new(MockFetcher::default());
    let path = downloader(cache.path(), &fetcher)
        .ensure_available(&EngineDescriptor::new(local.display().to_string()))
        .expect("local");
    assert_eq!(path, local);
    assert!(fetcher.fetched().is_empty());
}

#[test]
fn raw_url_source_is_fetched_without_side_files() {
    let cache = tempfile::tempdir().expect("tempdir");
    let url = "https://cdn.example.com/engines/terragrunt-custom";
    let fetcher = Arc::new(MockFetcher::default().with_file(url, b"#!/bin/sh\n".to_vec()));
    let path = downloader(cache.path(), &fetcher)
        .ensure_available(&EngineDescriptor::new(url))
        .expect("raw url");
    assert_eq!(fetcher.fetched(), vec![url.to_string()]);
    assert!(path
        .ends_with("custom/tofu/latest/linux/amd64/terragrunt-iac-custom_tofu_latest_linux_amd64"));
    assert_eq!(fs::read(&path).expect("read"), b"#!/bin/sh\n");
}

#[test]
fn latest_lookup_failure_is_reported() {
    let cache = tempfile::tempdir().expect("tempdir");
    let fetcher = Arc::new(MockFetcher::default());
    let err = downloader(cache.path(), &fetcher)
        .ensure_available(&fast_engine())
        .expect_err("no release");
    assert!(matches!(err, EngineError::LatestVersion { .. }), "{err}");
}

#[test]
fn download_locks_are_per_path() {
    let locks = DownloadLocks::default();
    let a = locks.lock_for(Path::new("/cache/a"));
    let again = locks.lock_for(Path::new("/cache/a"));
    let b = locks.lock_for(Path::new("/cache/b"));
    assert!(Arc::ptr_eq(&a, &again));
    assert!(!Arc::ptr_eq(&a, &b));
}
