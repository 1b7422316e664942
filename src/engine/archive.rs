//! Archive detection and safe extraction for downloaded engine artifacts.
//!
//! The format is decided from the leading bytes, never from the file name.
//! Every entry path is normalised lexically and must stay inside the
//! extraction directory before anything is written for it.
use super::error::{EngineError, EngineResult};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;

/// Format of a downloaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    /// Gzip stream; may wrap a tar archive or a single file.
    Gzip,
    Tar,
    /// Not an archive: the file is the engine itself.
    Plain,
}

impl ArchiveKind {
    pub fn from_header(header: &[u8]) -> Self {
        if header.starts_with(ZIP_MAGIC) || header.starts_with(ZIP_EMPTY_MAGIC) {
            return ArchiveKind::Zip;
        }
        if header.starts_with(GZIP_MAGIC) {
            return ArchiveKind::Gzip;
        }
        if is_tar_header(header) {
            return ArchiveKind::Tar;
        }
        ArchiveKind::Plain
    }
}

fn is_tar_header(header: &[u8]) -> bool {
    header.len() >= TAR_MAGIC_OFFSET + TAR_MAGIC.len()
        && &header[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
}

/// Sniff the archive kind of a file on disk.
pub fn detect(path: &Path) -> EngineResult<ArchiveKind> {
    let file = File::open(path)
        .map_err(|err| EngineError::io(format!("open {}", path.display()), err))?;
    let mut header = Vec::with_capacity(512);
    file.take(512)
        .read_to_end(&mut header)
        .map_err(|err| EngineError::io(format!("read {}", path.display()), err))?;
    Ok(ArchiveKind::from_header(&header))
}

/// Extract `archive` into `dest`, which must already exist.
///
/// `single_file_name` names the output when the archive is a bare gzip stream
/// rather than a tar.
pub fn extract(archive: &Path, dest: &Path, single_file_name: &str) -> EngineResult<()> {
    let kind = detect(archive)?;
    tracing::debug!(archive = %archive.display(), ?kind, "extracting engine archive");
    match kind {
        ArchiveKind::Zip => extract_zip(archive, dest),
        ArchiveKind::Tar => {
            let file = open(archive)?;
            extract_tar(archive, BufReader::new(file), dest)
        }
        ArchiveKind::Gzip => extract_gzip(archive, dest, single_file_name),
        ArchiveKind::Plain => Err(extraction(archive, "not an archive")),
    }
}

fn open(path: &Path) -> EngineResult<File> {
    File::open(path).map_err(|err| EngineError::io(format!("open {}", path.display()), err))
}

fn extraction(archive: &Path, reason: impl Into<String>) -> EngineError {
    EngineError::Extraction {
        archive: archive.to_path_buf(),
        reason: reason.into(),
    }
}

/// Resolve an entry name under `dest`, rejecting anything that escapes it.
pub fn safe_join(dest: &Path, entry_name: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(entry_name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if relative.as_os_str().is_empty() {
        return None;
    }
    let joined = dest.join(relative);
    joined.starts_with(dest).then_some(joined)
}

fn extract_zip(archive: &Path, dest: &Path) -> EngineResult<()> {
    let file = open(archive)?;
    let mut zip = zip::ZipArchive::new(BufReader::new(file))
        .map_err(|err| extraction(archive, err.to_string()))?;
    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|err| extraction(archive, err.to_string()))?;
        let name = entry.name().to_string();
        let target = safe_join(dest, &name)
            .ok_or_else(|| extraction(archive, format!("entry {name:?} escapes the destination")))?;
        if entry.is_dir() {
            create_dir(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            create_dir(parent)?;
        }
        let mut out = File::create(&target)
            .map_err(|err| EngineError::io(format!("create {}", target.display()), err))?;
        io::copy(&mut entry, &mut out)
            .map_err(|err| extraction(archive, format!("write {}: {err}", target.display())))?;
        apply_unix_mode(&target, entry.unix_mode())?;
    }
    Ok(())
}

fn extract_tar(archive: &Path, reader: impl Read, dest: &Path) -> EngineResult<()> {
    let mut tar = tar::Archive::new(reader);
    let entries = tar
        .entries()
        .map_err(|err| extraction(archive, err.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| extraction(archive, err.to_string()))?;
        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let target = safe_join(dest, &name)
            .ok_or_else(|| extraction(archive, format!("entry {name:?} escapes the destination")))?;
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            create_dir(&target)?;
            continue;
        }
        if !entry_type.is_file() {
            tracing::debug!(entry = %name, "skipping non-regular archive entry");
            continue;
        }
        if let Some(parent) = target.parent() {
            create_dir(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|err| extraction(archive, format!("write {}: {err}", target.display())))?;
    }
    Ok(())
}

fn extract_gzip(archive: &Path, dest: &Path, single_file_name: &str) -> EngineResult<()> {
    let mut decoder = GzDecoder::new(BufReader::new(open(archive)?));
    let mut head = vec![0u8; 512];
    let filled = read_up_to(&mut decoder, &mut head)
        .map_err(|err| extraction(archive, err.to_string()))?;
    head.truncate(filled);
    let chained = io::Cursor::new(head.clone()).chain(decoder);
    if is_tar_header(&head) {
        return extract_tar(archive, chained, dest);
    }

    let target = safe_join(dest, single_file_name)
        .ok_or_else(|| extraction(archive, format!("invalid output name {single_file_name:?}")))?;
    let mut out = File::create(&target)
        .map_err(|err| EngineError::io(format!("create {}", target.display()), err))?;
    let mut chained = chained;
    io::copy(&mut chained, &mut out)
        .map_err(|err| extraction(archive, format!("write {}: {err}", target.display())))?;
    Ok(())
}

fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn create_dir(path: &Path) -> EngineResult<()> {
    fs::create_dir_all(path)
        .map_err(|err| EngineError::io(format!("create {}", path.display()), err))
}

#[cfg(unix)]
fn apply_unix_mode(path: &Path, mode: Option<u32>) -> EngineResult<()> {
    match mode {
        Some(mode) => set_mode(path, mode & 0o777),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn apply_unix_mode(_path: &Path, _mode: Option<u32>) -> EngineResult<()> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_mode(path: &Path, mode: u32) -> EngineResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| EngineError::io(format!("chmod {}", path.display()), err))
}

/// Regular files directly or transitively under `root`.
pub(crate) fn regular_files(root: &Path) -> EngineResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = fs::read_dir(root)
        .map_err(|err| EngineError::io(format!("read {}", root.display()), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| EngineError::io(format!("read {}", root.display()), err))?;
        let file_type = entry
            .file_type()
            .map_err(|err| EngineError::io(format!("inspect {}", entry.path().display()), err))?;
        if file_type.is_dir() {
            files.extend(regular_files(&entry.path())?);
        } else if file_type.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
