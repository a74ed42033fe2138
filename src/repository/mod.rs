// src/repository/mod.rs

//! Local package repository
//!
//! Stores built artifacts under a root directory and keeps a single
//! JSON index file mapping package id to record. The index is the unit
//! of durability: it is rewritten whole through a temp-file rename, and
//! a present-but-corrupt index is a fatal error, never silently replaced
//! with an empty one.

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::paths;
use crate::version::Version;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Repository-side metadata for one stored package.
///
/// Records are immutable: a new version of a package gets a new record,
/// and records disappear only through an explicit [`PackageRepository::prune`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRecord {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub platform: String,
    /// Artifact location inside the repository
    pub archive_path: PathBuf,
    /// SHA-256 of the artifact file
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub dependencies: Vec<String>,
}

impl PackageRecord {
    /// Deterministic record id: `<name>-v<version>`
    pub fn make_id(name: &str, version: &Version) -> String {
        format!("{name}-v{version}")
    }
}

/// Filter for [`PackageRepository::list`]
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub name: Option<String>,
    pub platform: Option<String>,
    /// Inclusive version bounds, compared by semver precedence
    pub min_version: Option<Version>,
    pub max_version: Option<Version>,
}

/// On-disk index shape
#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    records: BTreeMap<String, PackageRecord>,
}

/// A local, file-backed package repository
#[derive(Debug)]
pub struct PackageRepository {
    root: PathBuf,
    index: Mutex<Index>,
}

impl PackageRepository {
    /// Open a repository at `root`, creating the layout if absent.
    ///
    /// A missing index file means a fresh repository and is initialized
    /// explicitly; an unreadable or unparseable index is fatal.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(paths::packages_dir(&root))?;

        let index_file = paths::index_path(&root);
        let index = if index_file.exists() {
            let content = fs::read(&index_file).map_err(|e| {
                Error::Repository(format!("cannot read index {}: {e}", index_file.display()))
            })?;
            serde_json::from_slice(&content).map_err(|e| {
                Error::Repository(format!(
                    "index {} is corrupt: {e}; refusing to continue",
                    index_file.display()
                ))
            })?
        } else {
            debug!("initializing empty index at {}", index_file.display());
            let empty = Index::default();
            persist_index(&root, &empty)?;
            empty
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store an artifact in the repository.
    ///
    /// The package's embedded manifest supplies identity and platform;
    /// the artifact checksum is computed here. Artifact placement and the
    /// index append are one logical transaction: if persisting the index
    /// fails the copied artifact is removed again, so the index never
    /// points at a missing file.
    pub fn store(&self, package_path: &Path, dependencies: Vec<String>) -> Result<PackageRecord> {
        let manifest = crate::archive::read_manifest(package_path)?;
        let id = PackageRecord::make_id(&manifest.package_name, &manifest.version);
        let checksum = hash::hash_file(HashAlgorithm::Sha256, package_path)?;

        let mut index = self
            .index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if index.records.contains_key(&id) {
            return Err(Error::Repository(format!(
                "package {id} is already stored; records are immutable"
            )));
        }

        // Cross-process exclusion for the placement + index write pair
        let lock_file = File::create(self.root.join("repository.lock"))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| Error::Repository(format!("cannot lock repository: {e}")))?;

        let file_name = manifest.archive_file_name();
        let stored_path = paths::packages_dir(&self.root).join(&file_name);
        fs::copy(package_path, &stored_path)?;
        // The copy must match what we hashed
        if let Err(e) = hash::verify_file(&stored_path, &checksum, HashAlgorithm::Sha256) {
            let _ = fs::remove_file(&stored_path);
            return Err(e);
        }

        let record = PackageRecord {
            id: id.clone(),
            name: manifest.package_name.clone(),
            version: manifest.version.clone(),
            platform: manifest.platform.clone(),
            archive_path: stored_path.clone(),
            checksum,
            created_at: Utc::now(),
            dependencies,
        };

        index.records.insert(id.clone(), record.clone());
        if let Err(e) = persist_index(&self.root, &index) {
            // Roll the logical transaction back
            index.records.remove(&id);
            let _ = fs::remove_file(&stored_path);
            return Err(e);
        }

        FileExt::unlock(&lock_file)?;
        info!("stored {id} ({file_name})");
        Ok(record)
    }

    /// List records, optionally filtered. Ordering is deterministic:
    /// name ascending, then version descending within a name.
    pub fn list(&self, filter: Option<&RecordFilter>) -> Vec<PackageRecord> {
        let index = self
            .index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut records: Vec<PackageRecord> = index
            .records
            .values()
            .filter(|r| {
                filter.is_none_or(|f| {
                    f.name.as_ref().is_none_or(|n| &r.name == n)
                        && f.platform.as_ref().is_none_or(|p| &r.platform == p)
                        && f.min_version
                            .as_ref()
                            .is_none_or(|v| r.version.compare(v) != std::cmp::Ordering::Less)
                        && f.max_version
                            .as_ref()
                            .is_none_or(|v| r.version.compare(v) != std::cmp::Ordering::Greater)
                })
            })
            .cloned()
            .collect();

        records.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| b.version.compare(&a.version))
        });
        records
    }

    /// Case-insensitive substring search over package names
    pub fn search(&self, query: &str) -> Vec<PackageRecord> {
        let needle = query.to_lowercase();
        self.list(None)
            .into_iter()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .collect()
    }

    /// Fetch one record by id
    pub fn get(&self, id: &str) -> Result<PackageRecord> {
        let index = self
            .index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        index
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("package {id}")))
    }

    /// Resolve a package by name and exact version
    pub fn resolve(&self, name: &str, version: &Version) -> Result<PackageRecord> {
        self.get(&PackageRecord::make_id(name, version))
    }

    /// The newest stored version of a package, by semver precedence
    pub fn latest(&self, name: &str) -> Option<PackageRecord> {
        self.list(Some(&RecordFilter {
            name: Some(name.to_string()),
            ..Default::default()
        }))
        .into_iter()
        .next()
    }

    /// Remove a record and its artifact. The only way records leave the
    /// repository.
    pub fn prune(&self, id: &str) -> Result<()> {
        let mut index = self
            .index
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let record = index
            .records
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("package {id}")))?;

        if let Err(e) = persist_index(&self.root, &index) {
            index.records.insert(id.to_string(), record);
            return Err(e);
        }
        if record.archive_path.exists() {
            fs::remove_file(&record.archive_path)?;
        }
        info!("pruned {id}");
        Ok(())
    }

    /// Verify a stored artifact still matches its recorded checksum
    pub fn verify(&self, id: &str) -> Result<()> {
        let record = self.get(id)?;
        hash::verify_file(&record.archive_path, &record.checksum, HashAlgorithm::Sha256)
    }
}

/// Rewrite the whole index through a temp file and rename
fn persist_index(root: &Path, index: &Index) -> Result<()> {
    let index_file = paths::index_path(root);
    let tmp = index_file.with_extension("json.tmp");
    let content = serde_json::to_vec_pretty(index)
        .map_err(|e| Error::Repository(format!("cannot encode index: {e}")))?;
    fs::write(&tmp, content)
        .map_err(|e| Error::Repository(format!("cannot write index: {e}")))?;
    fs::rename(&tmp, &index_file)
        .map_err(|e| Error::Repository(format!("cannot replace index: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{self, SourceFile};
    use crate::package::manifest::{Manifest, ManifestFile};
    use tempfile::TempDir;

    fn build_artifact(dir: &Path, name: &str, version: &str) -> PathBuf {
        let src = dir.join(format!("{name}-{version}-src"));
        fs::create_dir_all(&src).unwrap();
        let payload = format!("{name} {version}");
        fs::write(src.join("app.py"), &payload).unwrap();

        let sources = vec![SourceFile {
            archive_path: "src/app.py".to_string(),
            disk_path: src.join("app.py"),
        }];
        let manifest = Manifest::new(
            name,
            Version::parse(version).unwrap(),
            "raspberry-pi",
            vec![ManifestFile {
                path: "src/app.py".to_string(),
                size: payload.len() as u64,
                checksum: hash::sha256(payload.as_bytes()),
            }],
            vec![],
        );
        let out = dir.join(manifest.archive_file_name());
        archive::create(&sources, &manifest, &[], &out).unwrap();
        out
    }

    #[test]
    fn test_store_and_get() {
        let dir = TempDir::new().unwrap();
        let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
        let artifact = build_artifact(dir.path(), "gtach", "0.1.0");

        let record = repo.store(&artifact, vec![]).unwrap();
        assert_eq!(record.id, "gtach-v0.1.0");
        assert!(record.archive_path.exists());

        let fetched = repo.get("gtach-v0.1.0").unwrap();
        assert_eq!(fetched.checksum, record.checksum);
    }

    #[test]
    fn test_store_rejects_duplicate() {
        let dir = TempDir::new().unwrap();
        let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
        let artifact = build_artifact(dir.path(), "gtach", "0.1.0");

        repo.store(&artifact, vec![]).unwrap();
        let err = repo.store(&artifact, vec![]).unwrap_err();
        assert!(matches!(err, Error::Repository(_)));
    }

    #[test]
    fn test_list_ordering_version_descending() {
        let dir = TempDir::new().unwrap();
        let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
        for v in ["0.1.0", "0.3.0", "0.2.0", "0.3.0-alpha.1"] {
            let artifact = build_artifact(dir.path(), "gtach", v);
            repo.store(&artifact, vec![]).unwrap();
        }

        let records = repo.list(None);
        let versions: Vec<String> = records.iter().map(|r| r.version.to_string()).collect();
        assert_eq!(versions, vec!["0.3.0", "0.3.0-alpha.1", "0.2.0", "0.1.0"]);
        assert_eq!(repo.latest("gtach").unwrap().version.to_string(), "0.3.0");
    }

    #[test]
    fn test_filter_and_search() {
        let dir = TempDir::new().unwrap();
        let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
        for (n, v) in [("gtach", "0.1.0"), ("other", "1.0.0")] {
            let artifact = build_artifact(dir.path(), n, v);
            repo.store(&artifact, vec![]).unwrap();
        }

        let filtered = repo.list(Some(&RecordFilter {
            name: Some("gtach".to_string()),
            ..Default::default()
        }));
        assert_eq!(filtered.len(), 1);

        assert_eq!(repo.search("TACH").len(), 1);
        assert_eq!(repo.search("zzz").len(), 0);
    }

    #[test]
    fn test_filter_version_range() {
        let dir = TempDir::new().unwrap();
        let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
        for v in ["0.1.0", "0.2.0", "0.3.0-alpha.1", "0.3.0"] {
            let artifact = build_artifact(dir.path(), "gtach", v);
            repo.store(&artifact, vec![]).unwrap();
        }

        let bounded = repo.list(Some(&RecordFilter {
            min_version: Some(Version::parse("0.2.0").unwrap()),
            max_version: Some(Version::parse("0.3.0-alpha.1").unwrap()),
            ..Default::default()
        }));
        let versions: Vec<String> = bounded.iter().map(|r| r.version.to_string()).collect();
        assert_eq!(versions, vec!["0.3.0-alpha.1", "0.2.0"]);
    }

    #[test]
    fn test_get_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
        assert!(matches!(repo.get("nope-v1.0.0"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_corrupt_index_is_fatal() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        {
            let _ = PackageRepository::open(&root).unwrap();
        }
        fs::write(paths::index_path(&root), b"{ this is not json").unwrap();

        let err = PackageRepository::open(&root).unwrap_err();
        assert!(matches!(err, Error::Repository(_)));
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("repo");
        {
            let repo = PackageRepository::open(&root).unwrap();
            let artifact = build_artifact(dir.path(), "gtach", "0.1.0");
            repo.store(&artifact, vec!["python3".to_string()]).unwrap();
        }

        let repo = PackageRepository::open(&root).unwrap();
        let record = repo.get("gtach-v0.1.0").unwrap();
        assert_eq!(record.dependencies, vec!["python3".to_string()]);
        repo.verify("gtach-v0.1.0").unwrap();
    }

    #[test]
    fn test_prune_removes_record_and_artifact() {
        let dir = TempDir::new().unwrap();
        let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
        let artifact = build_artifact(dir.path(), "gtach", "0.1.0");
        let record = repo.store(&artifact, vec![]).unwrap();

        repo.prune(&record.id).unwrap();
        assert!(!record.archive_path.exists());
        assert!(matches!(repo.get(&record.id), Err(Error::NotFound(_))));
    }
}
