// src/archive/mod.rs

//! Archive creation and extraction with integrity verification
//!
//! Packages are gzip-compressed tar archives. The manifest is serialized
//! before the archive is opened and written as the first entry of a
//! single sequential pass. A finalized archive is never reopened in
//! append mode; no API for appending exists here, and extraction rejects
//! archives carrying trailing data after the gzip stream (the signature
//! of an append-after-finalize write).
//!
//! Entry names use forward-slash separators regardless of host platform,
//! and entries are stored sorted by path with normalized mtimes so that
//! rebuilding the same content yields the same archive.

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::package::manifest::{Manifest, ManifestFile, MANIFEST_NAME};
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Fallback mtime for archive entries when SOURCE_DATE_EPOCH is unset
/// (2024-01-01 00:00:00 UTC)
const DEFAULT_MTIME: u64 = 1704067200;

/// A file to be stored in an archive
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path inside the archive, forward-slash separated
    pub archive_path: String,
    /// Location of the content on disk
    pub disk_path: PathBuf,
}

/// Result of extracting an archive
#[derive(Debug)]
pub struct ExtractionResult {
    /// The embedded manifest, verified against the extracted content
    pub manifest: Manifest,
    /// Files written under the destination, archive-relative
    pub files: Vec<ManifestFile>,
}

/// Normalized mtime for archive entries, honoring SOURCE_DATE_EPOCH
fn entry_mtime() -> u64 {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_MTIME)
}

/// Decide whether a path is excluded by the given patterns.
///
/// Matching is glob/path-segment based, not substring based:
/// - a glob pattern (`*.pyc`) matches if it matches the final path
///   segment or the whole path, so `a/b/mod.pyc` is excluded by `*.pyc`
/// - a bare name (`__pycache__`) matches if it equals any path segment
///
/// Invalid patterns are non-fatal; they match nothing and log a warning.
pub fn should_exclude(path: &str, patterns: &[String]) -> bool {
    let normalized = path.replace('\\', "/");
    let segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    let basename = segments.last().copied().unwrap_or("");

    for raw in patterns {
        let pattern = raw.trim();
        if pattern.is_empty() {
            continue;
        }

        if pattern.contains(['*', '?', '[']) {
            match glob::Pattern::new(pattern) {
                Ok(compiled) => {
                    if compiled.matches(basename) || compiled.matches(&normalized) {
                        return true;
                    }
                }
                Err(e) => {
                    warn!("ignoring invalid exclusion pattern {:?}: {}", pattern, e);
                }
            }
        } else if segments.iter().any(|s| *s == pattern) {
            return true;
        }
    }
    false
}

/// Create a package archive in a single write pass.
///
/// The manifest must be fully built before this is called; it becomes
/// the first entry. Files matching an exclusion pattern are skipped.
/// Returns the output path on success.
pub fn create(
    files: &[SourceFile],
    manifest: &Manifest,
    exclude_patterns: &[String],
    output: &Path,
) -> Result<PathBuf> {
    // Finalize manifest content before the archive is opened for writing
    let manifest_json = manifest.to_json()?;
    let mtime = entry_mtime();

    let mut sorted: Vec<&SourceFile> = files
        .iter()
        .filter(|f| !should_exclude(&f.archive_path, exclude_patterns))
        .collect();
    sorted.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    let out_file = File::create(output)
        .map_err(|e| Error::Archive(format!("cannot create {}: {e}", output.display())))?;
    let encoder = GzEncoder::new(out_file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_entry(
        &mut builder,
        MANIFEST_NAME,
        manifest_json.as_bytes(),
        0o644,
        mtime,
    )?;

    for source in sorted {
        let content = fs::read(&source.disk_path).map_err(|e| {
            Error::Archive(format!("cannot read {}: {e}", source.disk_path.display()))
        })?;
        let mode = file_mode(&source.disk_path).unwrap_or(0o644);
        append_entry(&mut builder, &source.archive_path, &content, mode, mtime)?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::Archive(format!("archive finalize failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| Error::Archive(format!("gzip finalize failed: {e}")))?;

    debug!("wrote archive {}", output.display());
    Ok(output.to_path_buf())
}

fn append_entry<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    content: &[u8],
    mode: u32,
    mtime: u64,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(mode);
    header.set_size(content.len() as u64);
    header.set_mtime(mtime);
    header.set_cksum();
    builder
        .append_data(&mut header, path, content)
        .map_err(|e| Error::Archive(format!("failed to write entry {path}: {e}")))?;
    Ok(())
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Option<u32> {
    None
}

/// Extract and verify an archive into `dest`.
///
/// The archive is decompressed into a scratch directory next to `dest`;
/// per-file checksums and the aggregate checksum are verified against
/// the embedded manifest before anything reaches `dest`. On any
/// integrity or format failure `dest` is left untouched.
///
/// `dest` must not already exist; the verified tree is moved into place
/// with a single rename.
pub fn extract(archive_path: &Path, dest: &Path) -> Result<ExtractionResult> {
    if dest.exists() {
        return Err(Error::Archive(format!(
            "extraction destination {} already exists",
            dest.display()
        )));
    }

    let mut decoder = open_strict(archive_path)?;

    // Scratch area in the destination's parent so the final move is a
    // same-filesystem rename
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let scratch = tempfile::Builder::new()
        .prefix(".consign-extract-")
        .tempdir_in(parent)?;

    let (manifest, extracted) = unpack_entries(&mut decoder, scratch.path())?;
    finish_strict(decoder, archive_path)?;
    verify_extracted(&manifest, &extracted, scratch.path())?;

    // All checks passed; publish the scratch tree as the destination
    let scratch_path = scratch.keep();
    fs::rename(&scratch_path, dest).map_err(|e| {
        // Best effort cleanup; the scratch dir is no longer auto-deleted
        let _ = fs::remove_dir_all(&scratch_path);
        Error::Io(e)
    })?;

    debug!(
        "extracted {} file(s) from {} into {}",
        extracted.len(),
        archive_path.display(),
        dest.display()
    );

    Ok(ExtractionResult {
        files: manifest.files.clone(),
        manifest,
    })
}

/// Read only the embedded manifest from an archive, without writing
/// anything to disk.
pub fn read_manifest(archive_path: &Path) -> Result<Manifest> {
    let mut decoder = open_strict(archive_path)?;
    let mut manifest = None;
    {
        let mut archive = tar::Archive::new(&mut decoder);
        for entry in archive
            .entries()
            .map_err(|e| Error::Archive(format!("malformed archive: {e}")))?
        {
            let mut entry = entry.map_err(|e| Error::Archive(format!("malformed archive: {e}")))?;
            let path = entry
                .path()
                .map_err(|e| Error::Archive(format!("bad entry path: {e}")))?
                .to_string_lossy()
                .trim_start_matches("./")
                .to_string();
            if path == MANIFEST_NAME {
                let mut content = Vec::new();
                entry.read_to_end(&mut content)?;
                manifest = Some(Manifest::from_json(&content)?);
                break;
            }
        }
    }
    finish_strict(decoder, archive_path)?;
    manifest.ok_or_else(|| {
        Error::Archive(format!(
            "{} has no embedded manifest",
            archive_path.display()
        ))
    })
}

/// Open an archive as a streaming gzip decoder, checking the magic
/// bytes up front. The archive is never loaded whole into memory.
fn open_strict(archive_path: &Path) -> Result<GzDecoder<BufReader<File>>> {
    let file = File::open(archive_path)
        .map_err(|e| Error::Archive(format!("cannot read {}: {e}", archive_path.display())))?;
    let mut reader = BufReader::new(file);
    let head = reader.fill_buf()?;
    if head.len() < 2 || head[0] != 0x1f || head[1] != 0x8b {
        return Err(Error::Archive(format!(
            "{} is not a gzip archive",
            archive_path.display()
        )));
    }
    Ok(GzDecoder::new(reader))
}

/// Drain the remainder of the gzip member (the tar reader stops at the
/// end-of-archive marker) and reject anything left in the file behind
/// the compressed stream. Trailing bytes mean the file was written to
/// after the archive was finalized, which corrupts this format.
fn finish_strict(mut decoder: GzDecoder<BufReader<File>>, origin: &Path) -> Result<()> {
    let mut sink = [0u8; 8192];
    loop {
        let n = decoder.read(&mut sink).map_err(|e| {
            Error::Archive(format!("corrupt gzip stream in {}: {e}", origin.display()))
        })?;
        if n == 0 {
            break;
        }
    }
    let mut rest = decoder.into_inner();
    if !rest.fill_buf()?.is_empty() {
        return Err(Error::Archive(format!(
            "{} has trailing data after the compressed stream; \
             the archive was modified after finalization",
            origin.display()
        )));
    }
    Ok(())
}

/// Unpack tar entries into the scratch directory, returning the parsed
/// manifest and the (path, checksum, size) of every extracted file.
fn unpack_entries<R: Read>(reader: R, scratch: &Path) -> Result<(Manifest, Vec<ManifestFile>)> {
    let mut archive = tar::Archive::new(reader);
    let mut manifest: Option<Manifest> = None;
    let mut extracted = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| Error::Archive(format!("malformed archive: {e}")))?
    {
        let mut entry = entry.map_err(|e| Error::Archive(format!("malformed archive: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| Error::Archive(format!("bad entry path: {e}")))?
            .to_string_lossy()
            .to_string();
        let rel = sanitize_entry_path(&raw_path)?;

        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(scratch.join(&rel))?;
            continue;
        }
        if !entry.header().entry_type().is_file() {
            // Symlinks and specials are not part of the package format
            warn!("skipping non-regular archive entry {:?}", raw_path);
            continue;
        }

        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;

        if rel == MANIFEST_NAME {
            manifest = Some(Manifest::from_json(&content)?);
            // The manifest lands in the tree too (installed trees carry
            // it for version queries) but stays out of the verified set
            fs::write(scratch.join(&rel), &content)?;
            continue;
        }

        let target = scratch.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(mode) = entry.header().mode() {
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o7777));
            }
        }

        extracted.push(ManifestFile {
            path: rel,
            size: content.len() as u64,
            checksum: hash::hash_bytes(HashAlgorithm::Sha256, &content),
        });
    }

    let manifest =
        manifest.ok_or_else(|| Error::Archive("archive has no embedded manifest".to_string()))?;
    Ok((manifest, extracted))
}

/// Reject absolute paths and parent-directory traversal in entry names
fn sanitize_entry_path(raw: &str) -> Result<String> {
    let trimmed = raw.trim_start_matches("./");
    if trimmed.is_empty() {
        return Err(Error::Archive("empty entry path".to_string()));
    }
    if trimmed.starts_with('/') || trimmed.split('/').any(|seg| seg == "..") {
        return Err(Error::Archive(format!("unsafe entry path {raw:?}")));
    }
    Ok(trimmed.to_string())
}

/// Compare the extracted file set against the manifest: every listed
/// file must be present with the recorded checksum, nothing extra may
/// appear (scripts are listed in the manifest's file list too), and the
/// aggregate checksum must match.
fn verify_extracted(manifest: &Manifest, extracted: &[ManifestFile], _scratch: &Path) -> Result<()> {
    manifest.verify_aggregate()?;

    let mut expected: Vec<&ManifestFile> = manifest.files.iter().collect();
    expected.sort_by(|a, b| a.path.cmp(&b.path));
    let mut actual: Vec<&ManifestFile> = extracted.iter().collect();
    actual.sort_by(|a, b| a.path.cmp(&b.path));

    if expected.len() != actual.len() {
        return Err(Error::Integrity {
            path: "<archive>".to_string(),
            expected: format!("{} file(s)", expected.len()),
            actual: format!("{} file(s)", actual.len()),
        });
    }

    for (want, got) in expected.iter().zip(actual.iter()) {
        if want.path != got.path {
            return Err(Error::Integrity {
                path: got.path.clone(),
                expected: want.path.clone(),
                actual: got.path.clone(),
            });
        }
        if want.checksum != got.checksum {
            return Err(Error::Integrity {
                path: want.path.clone(),
                expected: want.checksum.clone(),
                actual: got.checksum.clone(),
            });
        }
    }
    Ok(())
}
