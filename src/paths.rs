// src/paths.rs
//! Centralized path derivation for consign state directories

use std::path::{Path, PathBuf};

/// Default state root on the target host
pub const DEFAULT_STATE_ROOT: &str = "/var/lib/consign";

/// Repository root under the state root
pub fn repository_dir(state_root: &Path) -> PathBuf {
    state_root.join("repository")
}

/// Repository index file
pub fn index_path(repository_dir: &Path) -> PathBuf {
    repository_dir.join("index.json")
}

/// Stored artifacts inside the repository
pub fn packages_dir(repository_dir: &Path) -> PathBuf {
    repository_dir.join("packages")
}

/// Per-session staging areas for updates
pub fn staging_dir(state_root: &Path) -> PathBuf {
    state_root.join("staging")
}

/// Per-session backups of the live install
pub fn backup_dir(state_root: &Path) -> PathBuf {
    state_root.join("backup")
}

/// Lock file guarding update sessions against a live install
pub fn update_lock_path(state_root: &Path) -> PathBuf {
    state_root.join("update.lock")
}
