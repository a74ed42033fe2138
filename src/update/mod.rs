// src/update/mod.rs

//! Staged update engine
//!
//! Applies a repository package to a live install directory through a
//! backup / stage / validate / atomic-swap sequence. The live tree is
//! never modified in place: the new tree is extracted and validated in
//! a staging directory first, and the commit is a pair of renames. Any
//! failure after staging triggers a rollback that restores the backup.

use crate::archive;
use crate::error::{Error, Result};
use crate::paths;
use crate::repository::{PackageRecord, PackageRepository};
use crate::version::{CompatPolicy, Version};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Phases of an update session, in the order they are entered.
///
/// Terminal phases are `Committed`, `RolledBack` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePhase {
    Idle,
    Fetching,
    Staged,
    Validating,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl UpdatePhase {
    pub fn name(&self) -> &'static str {
        match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Fetching => "fetching",
            UpdatePhase::Staged => "staged",
            UpdatePhase::Validating => "validating",
            UpdatePhase::Committed => "committed",
            UpdatePhase::RollingBack => "rolling-back",
            UpdatePhase::RolledBack => "rolled-back",
            UpdatePhase::Failed => "failed",
        }
    }
}

/// Outcome of a validation hook run against the staged tree
#[derive(Debug, Clone)]
pub struct HookVerdict {
    pub passed: bool,
    pub detail: String,
}

impl HookVerdict {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Validation run against a staged tree before commit.
///
/// A hook sees the fully extracted staging directory and decides whether
/// the update may proceed. Returning `Err` and returning a failed verdict
/// both abort the update and roll back.
pub trait ValidationHook: Send + Sync {
    fn validate(&self, staged: &Path) -> Result<HookVerdict>;
}

/// Hook that checks the staged tree is structurally complete:
/// manifest present and every manifest entry on disk with a matching
/// checksum. Used when no caller-supplied hook is given.
pub struct ManifestHook;

impl ValidationHook for ManifestHook {
    fn validate(&self, staged: &Path) -> Result<HookVerdict> {
        let manifest_path = staged.join(crate::package::MANIFEST_NAME);
        if !manifest_path.exists() {
            return Ok(HookVerdict::fail("staged tree has no manifest"));
        }
        let manifest = crate::package::Manifest::from_json(&fs::read(&manifest_path)?)?;
        for entry in &manifest.files {
            let on_disk = staged.join(&entry.path);
            if !on_disk.is_file() {
                return Ok(HookVerdict::fail(format!("missing file {}", entry.path)));
            }
            if let Err(e) = crate::hash::verify_file(
                &on_disk,
                &entry.checksum,
                crate::hash::HashAlgorithm::Sha256,
            ) {
                return Ok(HookVerdict::fail(format!("{}: {e}", entry.path)));
            }
        }
        Ok(HookVerdict::pass(format!(
            "{} file(s) verified",
            manifest.files.len()
        )))
    }
}

/// Hook that shells out to an external command with the staging
/// directory as its single argument. Exit status zero passes.
pub struct CommandHook {
    command: String,
}

impl CommandHook {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl ValidationHook for CommandHook {
    fn validate(&self, staged: &Path) -> Result<HookVerdict> {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(format!("{} \"$1\"", self.command))
            .arg("hook")
            .arg(staged)
            .status()?;
        if status.success() {
            Ok(HookVerdict::pass(format!("{} exited 0", self.command)))
        } else {
            Ok(HookVerdict::fail(format!(
                "{} exited {}",
                self.command,
                status.code().map_or("signal".to_string(), |c| c.to_string())
            )))
        }
    }
}

/// Report returned by a successful [`UpdateManager::apply`]
#[derive(Debug, Clone)]
pub struct UpdateReport {
    pub package: String,
    pub from_version: Option<Version>,
    pub to_version: Version,
    pub phase: UpdatePhase,
}

/// Drives update sessions for one install directory.
///
/// Concurrency is handled at two levels: an instance mutex serializes
/// sessions within the process, and an fs2 exclusive file lock excludes
/// other processes for the whole session.
pub struct UpdateManager<'a> {
    repository: &'a PackageRepository,
    state_root: PathBuf,
    install_dir: PathBuf,
    policy: CompatPolicy,
    session_lock: Mutex<()>,
}

impl<'a> UpdateManager<'a> {
    pub fn new(
        repository: &'a PackageRepository,
        state_root: impl Into<PathBuf>,
        install_dir: impl Into<PathBuf>,
        policy: CompatPolicy,
    ) -> Self {
        Self {
            repository,
            state_root: state_root.into(),
            install_dir: install_dir.into(),
            policy,
            session_lock: Mutex::new(()),
        }
    }

    /// Version of the currently installed tree, read from its manifest.
    /// `None` when nothing is installed yet.
    pub fn installed_version(&self) -> Result<Option<Version>> {
        let manifest_path = self.install_dir.join(crate::package::MANIFEST_NAME);
        if !manifest_path.exists() {
            return Ok(None);
        }
        let manifest = crate::package::Manifest::from_json(&fs::read(&manifest_path)?)?;
        Ok(Some(manifest.version))
    }

    /// Apply `name` at `target` to the install directory.
    ///
    /// Compatibility is checked before any filesystem mutation. The
    /// sequence after that is: back up the live tree, extract the
    /// package into staging, run the hook, then commit with two renames.
    /// Every failure past staging rolls back to the backup; a rollback
    /// that itself fails reports both surviving trees so nothing is lost.
    pub fn apply(
        &self,
        name: &str,
        target: &Version,
        hook: &dyn ValidationHook,
    ) -> Result<UpdateReport> {
        let _session = self
            .session_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let lock_path = paths::update_lock_path(&self.state_root);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_file = File::create(&lock_path)?;
        lock_file.try_lock_exclusive().map_err(|_| {
            Error::SessionActive(format!(
                "another update session holds {}",
                lock_path.display()
            ))
        })?;

        // The lock is released when lock_file drops; an explicit unlock
        // could fail and mask the session's real outcome
        self.run_session(name, target, hook)
    }

    fn run_session(
        &self,
        name: &str,
        target: &Version,
        hook: &dyn ValidationHook,
    ) -> Result<UpdateReport> {
        let mut phase = UpdatePhase::Idle;
        debug!(phase = phase.name(), "update session start");

        // Resolve and gate before touching the filesystem
        let record = self.repository.resolve(name, target)?;
        let current = self.installed_version()?;
        if let Some(current) = &current {
            if let Some(reason) = crate::version::incompatibility_reason(current, target, self.policy) {
                return Err(Error::Incompatible {
                    current: current.to_string(),
                    target: target.to_string(),
                    reason,
                });
            }
        }

        phase = UpdatePhase::Fetching;
        debug!(phase = phase.name(), id = %record.id, "fetching artifact");
        self.repository.verify(&record.id)?;

        let session_id = Uuid::new_v4();
        let backup = self.backup_live(session_id)?;

        let staging = paths::staging_dir(&self.state_root).join(session_id.to_string());
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent)?;
        }

        match self.stage_and_commit(&record, &staging, hook, &mut phase) {
            Ok(()) => {
                let _ = fs::remove_dir_all(&staging);
                if let Some(backup) = &backup {
                    discard_backup(backup);
                }
                info!(
                    package = name,
                    to = %target,
                    "update committed"
                );
                Ok(UpdateReport {
                    package: name.to_string(),
                    from_version: current,
                    to_version: target.clone(),
                    phase: UpdatePhase::Committed,
                })
            }
            Err(cause) => {
                warn!(
                    phase = phase.name(),
                    error = %cause,
                    "update failed, rolling back"
                );
                let _ = fs::remove_dir_all(&staging);
                self.rollback(backup.as_deref(), target, cause)
            }
        }
    }

    fn stage_and_commit(
        &self,
        record: &PackageRecord,
        staging: &Path,
        hook: &dyn ValidationHook,
        phase: &mut UpdatePhase,
    ) -> Result<()> {
        archive::extract(&record.archive_path, staging)?;
        *phase = UpdatePhase::Staged;
        debug!(phase = phase.name(), staging = %staging.display(), "package staged");

        *phase = UpdatePhase::Validating;
        let verdict = hook.validate(staging)?;
        if !verdict.passed {
            return Err(Error::Validation(format!(
                "validation hook rejected staged tree: {}",
                verdict.detail
            )));
        }
        debug!(phase = phase.name(), detail = %verdict.detail, "validation passed");

        // Commit: two renames, no window where the install path is a
        // partially written tree
        if let Some(parent) = self.install_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        let retired = self
            .install_dir
            .with_extension(format!("retired.{}", std::process::id()));
        let had_live = self.install_dir.exists();
        if had_live {
            fs::rename(&self.install_dir, &retired)?;
        }
        if let Err(e) = fs::rename(staging, &self.install_dir) {
            // Put the old tree back before reporting
            if had_live {
                fs::rename(&retired, &self.install_dir)?;
            }
            return Err(e.into());
        }
        if had_live {
            fs::remove_dir_all(&retired)?;
        }
        *phase = UpdatePhase::Committed;
        Ok(())
    }

    /// Copy the live tree into the backup area. Returns `None` when
    /// there is nothing installed to back up.
    fn backup_live(&self, session_id: Uuid) -> Result<Option<PathBuf>> {
        if !self.install_dir.exists() {
            return Ok(None);
        }
        let backup = paths::backup_dir(&self.state_root).join(session_id.to_string());
        if let Some(parent) = backup.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_tree(&self.install_dir, &backup)?;
        debug!(backup = %backup.display(), "live tree backed up");
        Ok(Some(backup))
    }

    fn rollback(
        &self,
        backup: Option<&Path>,
        target: &Version,
        cause: Error,
    ) -> Result<UpdateReport> {
        let Some(backup) = backup else {
            // Nothing was installed before; leaving no live tree restores
            // the prior state exactly
            let _ = fs::remove_dir_all(&self.install_dir);
            return Err(Error::UpdateRolledBack {
                target: target.to_string(),
                reason: cause.to_string(),
            });
        };

        let restore = || -> Result<()> {
            if self.install_dir.exists() {
                fs::remove_dir_all(&self.install_dir)?;
            }
            copy_tree(backup, &self.install_dir)?;
            Ok(())
        };

        match restore() {
            Ok(()) => {
                info!("rollback complete, previous install restored");
                discard_backup(backup);
                Err(Error::UpdateRolledBack {
                    target: target.to_string(),
                    reason: cause.to_string(),
                })
            }
            Err(restore_err) => {
                error!(
                    backup = %backup.display(),
                    error = %restore_err,
                    "rollback failed, backup left in place"
                );
                Err(Error::RollbackFailure {
                    live: self.install_dir.clone(),
                    backup: backup.to_path_buf(),
                    reason: format!("{cause}; restore failed: {restore_err}"),
                })
            }
        }
    }
}

/// Remove a session backup once the session reached a terminal state.
/// The backup outlives the session only on a failed rollback, where
/// preserving it is the point; here a deletion failure is logged and
/// never escalated past an already-finished update.
fn discard_backup(backup: &Path) {
    if let Err(e) = fs::remove_dir_all(backup) {
        warn!(
            backup = %backup.display(),
            error = %e,
            "could not discard session backup"
        );
    }
}

/// Recursive copy preserving unix permission bits
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Validation(format!("walk {}: {e}", from.display())))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::Validation(format!("strip prefix: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &dest)?;
        }
        // Symlinks and special files are not part of package trees
    }
    Ok(())
}
