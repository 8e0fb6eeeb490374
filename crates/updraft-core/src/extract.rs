//! Archive extraction into the staging area.
//!
//! Runs only after the artifact's signature has verified: no archive byte is
//! parsed before it is authenticated, which is why extraction is a separate
//! pass over the staged file rather than pipelined with the download.
//! Handles tar.gz, tar.zst, and zip; every entry path is sanitized against
//! traversal before any write.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::ZipArchive;
use zstd::stream::Decoder as ZstdDecoder;

/// Extraction failures.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The artifact's extension names no supported archive format.
    #[error("Unsupported archive format: {0}")]
    UnsupportedFormat(String),

    /// The archive is structurally unsafe or corrupt.
    #[error("Archive error: {0}")]
    Archive(String),
}

/// Supported artifact archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Gzip-compressed tarball (`.tar.gz`, `.tgz`).
    TarGz,
    /// Zstd-compressed tarball (`.tar.zst`).
    TarZst,
    /// Zip archive (`.zip`).
    Zip,
}

impl ArchiveFormat {
    /// Detects the format from the artifact filename.
    pub fn detect(path: &Path) -> Result<Self, ExtractError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if name.ends_with(".tar.zst") {
            Ok(Self::TarZst)
        } else if name.ends_with(".zip") {
            Ok(Self::Zip)
        } else {
            Err(ExtractError::UnsupportedFormat(name))
        }
    }
}

/// Information about an extracted file.
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    /// Path relative to the extraction root.
    pub relative_path: PathBuf,
    /// Absolute path on disk.
    pub absolute_path: PathBuf,
    /// Whether this is an executable.
    pub is_executable: bool,
}

/// Extracts a staged archive into `dest_dir`, reporting fractional progress.
///
/// Progress is measured over compressed input bytes for tarballs and over
/// the entry count for zips; both end at `1.0`. Blocking; callers run this
/// under `spawn_blocking`.
pub fn extract_archive(
    archive_path: &Path,
    dest_dir: &Path,
    progress: impl Fn(f64),
) -> Result<Vec<ExtractedFile>, ExtractError> {
    match ArchiveFormat::detect(archive_path)? {
        ArchiveFormat::TarGz => {
            let total = fs::metadata(archive_path)?.len();
            let reader = CountingReader::new(BufReader::new(File::open(archive_path)?), total, progress);
            extract_tar(flate2::read::GzDecoder::new(reader), dest_dir)
        }
        ArchiveFormat::TarZst => {
            let total = fs::metadata(archive_path)?.len();
            let reader = CountingReader::new(BufReader::new(File::open(archive_path)?), total, progress);
            extract_tar(ZstdDecoder::new(reader)?, dest_dir)
        }
        ArchiveFormat::Zip => extract_zip(archive_path, dest_dir, progress),
    }
}

/// Wraps a reader, reporting the fraction of `total` bytes consumed.
struct CountingReader<R, F> {
    inner: R,
    read: u64,
    total: u64,
    progress: F,
}

impl<R, F> CountingReader<R, F> {
    fn new(inner: R, total: u64, progress: F) -> Self {
        Self {
            inner,
            read: 0,
            total,
            progress,
        }
    }
}

impl<R: Read, F: Fn(f64)> Read for CountingReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.read += n as u64;
        if self.total > 0 {
            (self.progress)((self.read as f64 / self.total as f64).min(1.0));
        }
        Ok(n)
    }
}

/// Extract a tar stream to a destination directory.
fn extract_tar<R: Read>(reader: R, dest_dir: &Path) -> Result<Vec<ExtractedFile>, ExtractError> {
    use std::path::Component;

    fs::create_dir_all(dest_dir)?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    let mut extracted_files = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?;

        if entry.header().entry_type().is_dir() {
            continue;
        }

        // Sanitize against path traversal
        if entry_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ExtractError::Archive(format!(
                "Invalid path in archive: {}",
                entry_path.display()
            )));
        }

        let relative_path: PathBuf = entry_path.components().collect();
        let absolute_path = dest_dir.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)?;
        }

        entry.unpack(&absolute_path)?;

        let is_executable = entry
            .header()
            .mode()
            .map(|m| m & 0o111 != 0)
            .unwrap_or(false);

        extracted_files.push(ExtractedFile {
            relative_path,
            absolute_path,
            is_executable,
        });
    }

    Ok(extracted_files)
}

/// Extract a zip archive to a destination directory.
fn extract_zip(
    archive_path: &Path,
    dest_dir: &Path,
    progress: impl Fn(f64),
) -> Result<Vec<ExtractedFile>, ExtractError> {
    fs::create_dir_all(dest_dir)?;

    let file = File::open(archive_path)?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| ExtractError::Archive(e.to_string()))?;
    let total = archive.len();
    let mut extracted_files = Vec::new();

    for index in 0..total {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ExtractError::Archive(e.to_string()))?;

        // enclosed_name already rejects traversal outside the root
        let Some(relative_path) = entry.enclosed_name() else {
            return Err(ExtractError::Archive(format!(
                "Invalid path in archive: {}",
                entry.name()
            )));
        };

        if entry.is_dir() {
            progress((index + 1) as f64 / total as f64);
            continue;
        }

        let absolute_path = dest_dir.join(&relative_path);
        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&absolute_path)?;
        io::copy(&mut entry, &mut out)?;

        let is_executable = entry.unix_mode().map(|m| m & 0o111 != 0).unwrap_or(false);
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&absolute_path, fs::Permissions::from_mode(mode))?;
        }

        extracted_files.push(ExtractedFile {
            relative_path,
            absolute_path,
            is_executable,
        });
        progress((index + 1) as f64 / total as f64);
    }

    Ok(extracted_files)
}
