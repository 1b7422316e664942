//! Artifact verification against a signed checksum manifest.
//!
//! The manifest signature is checked before any digest comparison, so a
//! tampered manifest is never trusted even when it happens to match.
use super::error::{EngineError, EngineResult};
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Release signing key for published engines (Ed25519, hex).
pub const TRUSTED_PUBLIC_KEY_HEX: &str =
    "999c64e2b370eb54e987fdb24ce468db03fa69157d852e89e56f706155c51342";

/// Verifies engine artifacts against one trusted signing key.
#[derive(Debug, Clone)]
pub struct Verifier {
    key: VerifyingKey,
}

impl Verifier {
    /// Verifier bound to the embedded release key.
    pub fn embedded() -> EngineResult<Self> {
        let key = parse_public_key(TRUSTED_PUBLIC_KEY_HEX)?;
        Ok(Self { key })
    }

    pub fn with_key(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Check `artifact` against `manifest` and its detached `signature`.
    pub fn verify(&self, artifact: &Path, manifest: &Path, signature: &Path) -> EngineResult<()> {
        let manifest_bytes = read(manifest)?;
        let signature_bytes = read(signature)?;

        let signature_value = decode_signature(&signature_bytes).ok_or_else(|| {
            EngineError::SignatureInvalid {
                manifest: manifest.to_path_buf(),
            }
        })?;
        self.key
            .verify(&manifest_bytes, &signature_value)
            .map_err(|_| EngineError::SignatureInvalid {
                manifest: manifest.to_path_buf(),
            })?;

        let file_name = artifact
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entries = parse_manifest(&String::from_utf8_lossy(&manifest_bytes));
        let expected_hex = entries
            .get(&file_name)
            .ok_or_else(|| EngineError::ChecksumEntryMissing {
                artifact: file_name.clone(),
                manifest: manifest.to_path_buf(),
            })?;
        let expected = decode_digest(expected_hex).ok_or_else(|| EngineError::MalformedManifest {
            manifest: manifest.to_path_buf(),
            reason: format!("entry for {file_name} is not a sha256 digest: {expected_hex:?}"),
        })?;

        let actual = file_sha256(artifact)?;
        if expected != actual {
            return Err(EngineError::ChecksumMismatch {
                artifact: artifact.to_path_buf(),
                expected: expected_hex.to_string(),
                actual: hex::encode(actual),
            });
        }
        Ok(())
    }
}

fn read(path: &Path) -> EngineResult<Vec<u8>> {
    fs::read(path).map_err(|source| EngineError::VerificationIo {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_public_key(text: &str) -> EngineResult<VerifyingKey> {
    let array: [u8; PUBLIC_KEY_LENGTH] = hex::decode(text.trim())
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| EngineError::InvalidSource {
            source_ref: text.to_string(),
            reason: "public key must be 32 bytes of hex".to_string(),
        })?;
    VerifyingKey::from_bytes(&array).map_err(|err| EngineError::InvalidSource {
        source_ref: text.to_string(),
        reason: err.to_string(),
    })
}

fn decode_digest(text: &str) -> Option<[u8; 32]> {
    hex::decode(text).ok()?.try_into().ok()
}

/// Signatures ship either as 64 raw bytes or as hex text.
fn decode_signature(bytes: &[u8]) -> Option<Signature> {
    if bytes.len() == SIGNATURE_LENGTH {
        return Signature::from_slice(bytes).ok();
    }
    let text = std::str::from_utf8(bytes).ok()?;
    let decoded = hex::decode(text.trim()).ok()?;
    Signature::from_slice(&decoded).ok()
}

/// Parse `sha256sum` output: `<hex>  <name>` or `<hex> *<name>` per line.
pub fn parse_manifest(text: &str) -> BTreeMap<String, String> {
    let mut entries = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((digest, name)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let name = name.trim_start().trim_start_matches('*');
        if name.is_empty() {
            continue;
        }
        entries.insert(name.to_string(), digest.to_ascii_lowercase());
    }
    entries
}

/// Stream a file through SHA-256.
pub fn file_sha256(path: &Path) -> EngineResult<[u8; 32]> {
    let mut file = File::open(path).map_err(|source| EngineError::VerificationIo {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|source| EngineError::VerificationIo {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::sha256_hex;
    use ed25519_dalek::{Signer, SigningKey};
    use std::path::PathBuf;

    struct Release {
        _dir: tempfile::TempDir,
        artifact: PathBuf,
        manifest: PathBuf,
        signature: PathBuf,
    }

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    fn release(manifest_for: impl Fn(&str) -> String) -> Release {
        let dir = tempfile::tempdir().expect("tempdir");
        let artifact = dir.path().join("engine_v1_linux_amd64.zip");
        let payload = b"engine payload".to_vec();
        fs::write(&artifact, &payload).expect("write artifact");
        let manifest_text = manifest_for(&sha256_hex(&payload));
        let manifest = dir.path().join("SHA256SUMS");
        fs::write(&manifest, &manifest_text).expect("write manifest");
        let signature = dir.path().join("SHA256SUMS.sig");
        let sig = signing_key().sign(manifest_text.as_bytes());
        fs::write(&signature, sig.to_bytes()).expect("write signature");
        Release {
            _dir: dir,
            artifact,
            manifest,
            signature,
        }
    }

    fn verifier() -> Verifier {
        Verifier::with_key(signing_key().verifying_key())
    }

    fn good_manifest(digest: &str) -> String {
        format!("{digest}  engine_v1_linux_amd64.zip\n0000  other_file.zip\n")
    }

    #[test]
    fn embedded_key_parses() {
        assert!(Verifier::embedded().is_ok());
    }

    #[test]
    fn accepts_valid_release() {
        let r = release(good_manifest);
        verifier()
            .verify(&r.artifact, &r.manifest, &r.signature)
            .expect("valid release verifies");
    }

    #[test]
    fn accepts_hex_encoded_signature() {
        let r = release(good_manifest);
        let raw = fs::read(&r.signature).expect("read sig");
        fs::write(&r.signature, format!("{}\n", hex::encode(raw))).expect("rewrite sig");
        verifier()
            .verify(&r.artifact, &r.manifest, &r.signature)
            .expect("hex signature verifies");
    }

    #[test]
    fn flipped_artifact_byte_is_checksum_mismatch() {
        let r = release(good_manifest);
        let mut bytes = fs::read(&r.artifact).expect("read");
        bytes[0] ^= 0x01;
        fs::write(&r.artifact, bytes).expect("write");
        let err = verifier()
            .verify(&r.artifact, &r.manifest, &r.signature)
            .expect_err("tampered artifact");
        assert!(matches!(err, EngineError::ChecksumMismatch { .. }), "{err}");
    }

    #[test]
    fn flipped_signature_byte_is_signature_invalid() {
        let r = release(good_manifest);
        let mut bytes = fs::read(&r.signature).expect("read");
        bytes[10] ^= 0x01;
        fs::write(&r.signature, bytes).expect("write");
        let err = verifier()
            .verify(&r.artifact, &r.manifest, &r.signature)
            .expect_err("tampered signature");
        assert!(matches!(err, EngineError::SignatureInvalid { .. }), "{err}");
    }

    #[test]
    fn signature_checked_before_checksum() {
        let r = release(good_manifest);
        fs::write(&r.artifact, b"different").expect("write");
        let other = Verifier::with_key(SigningKey::from_bytes(&[9u8; 32]).verifying_key());
        let err = other
            .verify(&r.artifact, &r.manifest, &r.signature)
            .expect_err("wrong key");
        assert!(matches!(err, EngineError::SignatureInvalid { .. }), "{err}");
    }

    #[test]
    fn missing_entry_is_reported() {
        let r = release(|digest| format!("{digest}  some_other_artifact.zip\n"));
        let err = verifier()
            .verify(&r.artifact, &r.manifest, &r.signature)
            .expect_err("missing entry");
        assert!(
            matches!(
                err,
                EngineError::ChecksumEntryMissing { ref artifact, .. }
                    if artifact == "engine_v1_linux_amd64.zip"
            ),
            "{err}"
        );
    }

    #[test]
    fn malformed_digest_is_reported_as_such() {
        let r = release(|_| "not-hex-at-all  engine_v1_linux_amd64.zip\n".to_string());
        let err = verifier()
            .verify(&r.artifact, &r.manifest, &r.signature)
            .expect_err("malformed entry");
        assert!(matches!(err, EngineError::MalformedManifest { .. }), "{err}");
        assert!(err.to_string().contains("not-hex-at-all"), "{err}");
        assert!(err.is_integrity_failure());

        let short = release(|_| "abcd  engine_v1_linux_amd64.zip\n".to_string());
        let err = verifier()
            .verify(&short.artifact, &short.manifest, &short.signature)
            .expect_err("short digest");
        assert!(matches!(err, EngineError::MalformedManifest { .. }), "{err}");
    }

    #[test]
    fn missing_side_file_is_io_error() {
        let r = release(good_manifest);
        fs::remove_file(&r.signature).expect("remove");
        let err = verifier()
            .verify(&r.artifact, &r.manifest, &r.signature)
            .expect_err("missing signature");
        assert!(matches!(err, EngineError::VerificationIo { .. }), "{err}");
    }

    #[test]
    fn manifest_parser_handles_binary_marker_and_comments() {
        let entries = parse_manifest("# comment\nABCD *engine.zip\n\nbeef  tool.tar.gz\n");
        assert_eq!(entries.get("engine.zip").map(String::as_str), Some("abcd"));
        assert_eq!(entries.get("tool.tar.gz").map(String::as_str), Some("beef"));
    }
}
