// src/package/manifest.rs

//! Package manifest: the embedded record of a package's contents
//!
//! A manifest is created once per package, serialized to JSON, and
//! written as the first entry of the archive. It is never modified
//! afterward; changing a manifest means rebuilding the whole archive.

use crate::error::{Error, Result};
use crate::hash;
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Archive entry name for the embedded manifest
pub const MANIFEST_NAME: &str = "manifest.json";

/// One file recorded in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Archive-relative path, forward-slash separated
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// SHA-256 of the file content
    pub checksum: String,
}

/// The embedded package manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub package_name: String,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub platform: String,
    pub files: Vec<ManifestFile>,
    /// SHA-256 over the sorted (path, checksum) pairs
    pub aggregate_checksum: String,
    /// Install/uninstall scripts shipped inside the archive
    pub scripts: Vec<String>,
}

/// Creation timestamp, pinned by SOURCE_DATE_EPOCH when set so that
/// rebuilding the same content yields a byte-identical archive
fn creation_time() -> DateTime<Utc> {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

impl Manifest {
    /// Build a manifest from collected file entries.
    ///
    /// Entries are sorted by path and the aggregate checksum is computed
    /// here, before the archive is opened for writing.
    pub fn new(
        package_name: &str,
        version: Version,
        platform: &str,
        mut files: Vec<ManifestFile>,
        scripts: Vec<String>,
    ) -> Self {
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let pairs: Vec<(String, String)> = files
            .iter()
            .map(|f| (f.path.clone(), f.checksum.clone()))
            .collect();
        let aggregate_checksum = hash::aggregate(&pairs);

        Self {
            package_name: package_name.to_string(),
            version,
            created_at: creation_time(),
            platform: platform.to_string(),
            files,
            aggregate_checksum,
            scripts,
        }
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a manifest from JSON bytes
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::Archive(format!("malformed manifest: {e}")))
    }

    /// Recompute the aggregate checksum from the file list and compare
    /// it with the recorded one.
    pub fn verify_aggregate(&self) -> Result<()> {
        let pairs: Vec<(String, String)> = self
            .files
            .iter()
            .map(|f| (f.path.clone(), f.checksum.clone()))
            .collect();
        let actual = hash::aggregate(&pairs);
        if actual == self.aggregate_checksum {
            Ok(())
        } else {
            Err(Error::Integrity {
                path: format!("{} manifest", self.package_name),
                expected: self.aggregate_checksum.clone(),
                actual,
            })
        }
    }

    /// Artifact file name for this manifest: `<name>-v<version>.tar.gz`
    pub fn archive_file_name(&self) -> String {
        format!("{}-v{}.tar.gz", self.package_name, self.version)
    }
}
