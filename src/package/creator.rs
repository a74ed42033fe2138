// src/package/creator.rs

//! Package creation pipeline
//!
//! A linear pipeline with no branching on success:
//!
//! ```text
//! Validate -> Workspace -> Collect -> Copy -> Render -> Scripts
//!          -> Manifest -> Archive -> (optional) Verify
//! ```
//!
//! Any phase failure aborts the rest, the workspace tempdir is dropped
//! on every exit path, and the caller receives a single error wrapped
//! with the phase name and carrying the original cause.

use crate::archive::{self, SourceFile};
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::package::config::{resolve_under, PackageConfig};
use crate::package::manifest::{Manifest, ManifestFile};
use crate::package::scripts;
use crate::template::{self, TemplateValue};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Creates packages for one project.
///
/// A single creation lock serializes `create_package` calls on the same
/// instance; each call still gets its own isolated workspace, so
/// concurrent calls can never share scratch state.
pub struct PackageCreator {
    project_root: PathBuf,
    creation_lock: Mutex<()>,
}

impl PackageCreator {
    /// Create a creator rooted at an explicit project directory
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            creation_lock: Mutex::new(()),
        }
    }

    /// Create a creator by resolving the project root upward from `start`
    pub fn discover(start: &Path) -> Result<Self> {
        let root = crate::package::config::resolve_project_root(start)?;
        Ok(Self::new(root))
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Build one package archive. Returns the path of the written
    /// artifact, named `<name>-v<version>.tar.gz`.
    pub fn create_package(
        &self,
        config: &PackageConfig,
        output: Option<&Path>,
    ) -> Result<PathBuf> {
        let _guard = self
            .creation_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        info!(
            "creating package {} v{} for {}",
            config.name, config.version, config.target_platform
        );

        // Validate
        config
            .check_source_dirs(&self.project_root)
            .map_err(|e| Error::in_phase("validate", e))?;

        // Workspace: isolated per call, removed on drop
        let workspace = tempfile::Builder::new()
            .prefix("consign-build-")
            .tempdir()
            .map_err(|e| Error::in_phase("workspace", e.into()))?;

        // Collect
        let collected = self
            .collect_sources(config)
            .map_err(|e| Error::in_phase("collect", e))?;
        debug!("collected {} source file(s)", collected.len());

        // Copy into the workspace; sources are never mutated
        copy_into_workspace(&collected, workspace.path())
            .map_err(|e| Error::in_phase("copy", e))?;

        // Render configuration templates
        self.render_templates(config, workspace.path())
            .map_err(|e| Error::in_phase("render", e))?;

        // Generate install scripts
        let script_names = if config.create_install_script {
            scripts::generate(config, workspace.path())
                .map_err(|e| Error::in_phase("scripts", e))?
        } else {
            Vec::new()
        };

        // Build the manifest from the workspace tree
        let manifest = build_manifest(config, workspace.path(), script_names)
            .map_err(|e| Error::in_phase("manifest", e))?;

        // Archive: manifest first, one sequential write pass
        let output_path = match output {
            Some(p) => p.to_path_buf(),
            None => resolve_under(&self.project_root, &config.output_dir)
                .join(manifest.archive_file_name()),
        };
        let workspace_files = enumerate_workspace(workspace.path())?;
        archive::create(&workspace_files, &manifest, &[], &output_path)
            .map_err(|e| Error::in_phase("archive", e))?;

        // Verify: round-trip the artifact through extraction
        if config.verify_integrity {
            self.verify_artifact(&output_path)
                .map_err(|e| Error::in_phase("verify", e))?;
        }

        info!("wrote {}", output_path.display());
        Ok(output_path)
    }

    /// Enumerate source files under the configured directories, applying
    /// exclusion patterns. Archive paths keep the source directory name
    /// as their first segment and use forward slashes.
    fn collect_sources(&self, config: &PackageConfig) -> Result<Vec<SourceFile>> {
        let mut files = Vec::new();

        for dir in &config.source_dirs {
            let base = resolve_under(&self.project_root, dir);
            let prefix = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "src".to_string());

            for entry in WalkDir::new(&base)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let rel = entry
                    .path()
                    .strip_prefix(&base)
                    .expect("walkdir yields children of its root");
                let archive_path = format!(
                    "{prefix}/{}",
                    rel.to_string_lossy().replace('\\', "/")
                );

                if archive::should_exclude(&archive_path, &config.exclude_patterns) {
                    continue;
                }
                files.push(SourceFile {
                    archive_path,
                    disk_path: entry.path().to_path_buf(),
                });
            }
        }

        files.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));
        Ok(files)
    }

    /// Render every configured template directory into `workspace/config`
    fn render_templates(&self, config: &PackageConfig, workspace: &Path) -> Result<()> {
        let variables = standard_variables(config);
        let out_dir = workspace.join("config");
        let mut rendered = Vec::new();
        let mut saw_templates = false;

        for dir in &config.config_template_dirs {
            let full = resolve_under(&self.project_root, dir);
            if !full.is_dir() {
                debug!("template directory {} absent, skipping", full.display());
                continue;
            }
            saw_templates = true;
            rendered.extend(template::render_all(&full, &out_dir, &variables)?);
        }

        // Platforms that ship templates must produce the full output set
        if saw_templates {
            template::check_required_outputs(&rendered, &config.target_platform)?;
        }
        Ok(())
    }

    fn verify_artifact(&self, artifact: &Path) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix("consign-verify-")
            .tempdir()?;
        let dest = scratch.path().join("tree");
        let result = archive::extract(artifact, &dest)?;
        debug!(
            "verified {} file(s) in {}",
            result.files.len(),
            artifact.display()
        );
        Ok(())
    }
}

/// The variable set every template can rely on
fn standard_variables(config: &PackageConfig) -> BTreeMap<String, TemplateValue> {
    let mut vars = BTreeMap::new();
    vars.insert(
        "APP_NAME".to_string(),
        TemplateValue::Str(config.name.clone()),
    );
    vars.insert(
        "VERSION".to_string(),
        TemplateValue::Str(config.version.to_string()),
    );
    vars.insert(
        "PLATFORM".to_string(),
        TemplateValue::Str(config.target_platform.clone()),
    );
    vars.insert(
        "INSTALL_PREFIX".to_string(),
        TemplateValue::Str(format!("/opt/{}", config.name)),
    );
    vars.insert("DEBUG".to_string(), TemplateValue::Bool(false));
    vars
}

fn copy_into_workspace(files: &[SourceFile], workspace: &Path) -> Result<()> {
    for file in files {
        let target = workspace.join(&file.archive_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&file.disk_path, &target)?;
    }
    Ok(())
}

/// Enumerate the finished workspace tree as archive sources
fn enumerate_workspace(workspace: &Path) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(workspace)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .expect("walkdir yields children of its root");
        files.push(SourceFile {
            archive_path: rel.to_string_lossy().replace('\\', "/"),
            disk_path: entry.path().to_path_buf(),
        });
    }
    files.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));
    Ok(files)
}

/// Hash the workspace tree and assemble the manifest. Per-file checksums
/// are computed on a worker pool; results are merged sorted by path so
/// the subsequent archive pass stays deterministic.
fn build_manifest(
    config: &PackageConfig,
    workspace: &Path,
    script_names: Vec<String>,
) -> Result<Manifest> {
    let files = enumerate_workspace(workspace)?;

    let mut entries: Vec<ManifestFile> = files
        .par_iter()
        .map(|f| -> Result<ManifestFile> {
            let size = fs::metadata(&f.disk_path)?.len();
            let checksum = hash::hash_file(HashAlgorithm::Sha256, &f.disk_path)?;
            Ok(ManifestFile {
                path: f.archive_path.clone(),
                size,
                checksum,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    entries.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(Manifest::new(
        &config.name,
        config.version.clone(),
        &config.target_platform,
        entries,
        script_names,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn project_with_sources() -> TempDir {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("obd")).unwrap();
        fs::write(src.join("main.py"), b"entry\n").unwrap();
        fs::write(src.join("obd/reader.py"), b"reader\n").unwrap();
        fs::write(src.join("obd/reader.pyc"), b"bytecode\n").unwrap();
        fs::write(dir.path().join("consign.toml"), "[package]\nname=\"gtach\"\n").unwrap();
        dir
    }

    fn config(version: &str) -> PackageConfig {
        PackageConfig::new(
            "gtach",
            Version::parse(version).unwrap(),
            "raspberry-pi",
            vec![PathBuf::from("src")],
            vec!["*.pyc".to_string(), "__pycache__".to_string()],
            vec![PathBuf::from("templates")],
            PathBuf::from("dist"),
            true,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_create_package_end_to_end() {
        let project = project_with_sources();
        let creator = PackageCreator::new(project.path());

        let artifact = creator.create_package(&config("0.1.0"), None).unwrap();
        assert!(artifact.ends_with("dist/gtach-v0.1.0.tar.gz"));
        assert!(artifact.exists());

        let manifest = archive::read_manifest(&artifact).unwrap();
        assert_eq!(manifest.package_name, "gtach");
        let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"src/main.py"));
        assert!(paths.contains(&"src/obd/reader.py"));
        assert!(paths.contains(&"install.sh"));
        assert!(!paths.iter().any(|p| p.ends_with(".pyc")));
    }

    #[test]
    fn test_manifests_idempotent_modulo_timestamp() {
        let project = project_with_sources();
        let creator = PackageCreator::new(project.path());
        let cfg = config("0.1.0");

        let out1 = project.path().join("one.tar.gz");
        let out2 = project.path().join("two.tar.gz");
        creator.create_package(&cfg, Some(&out1)).unwrap();
        creator.create_package(&cfg, Some(&out2)).unwrap();

        let mut m1 = archive::read_manifest(&out1).unwrap();
        let mut m2 = archive::read_manifest(&out2).unwrap();
        m1.created_at = m2.created_at;
        assert_eq!(m1.files, m2.files);
        assert_eq!(m1.aggregate_checksum, m2.aggregate_checksum);
        assert_eq!(m1.scripts, m2.scripts);
    }

    #[test]
    fn test_validate_failure_names_phase() {
        let project = TempDir::new().unwrap();
        fs::write(project.path().join("consign.toml"), "x").unwrap();
        let creator = PackageCreator::new(project.path());

        // src/ does not exist
        let err = creator.create_package(&config("0.1.0"), None).unwrap_err();
        assert!(err.to_string().contains("validate phase failed"));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_render_failure_aborts_creation() {
        let project = project_with_sources();
        let templates = project.path().join("templates");
        fs::create_dir_all(&templates).unwrap();
        // references an unknown variable
        fs::write(templates.join("app.json"), r#"{"x": "${NOPE}"}"#).unwrap();

        let creator = PackageCreator::new(project.path());
        let err = creator.create_package(&config("0.1.0"), None).unwrap_err();
        assert!(err.to_string().contains("render phase failed"));
        // no artifact was produced
        assert!(!project.path().join("dist/gtach-v0.1.0.tar.gz").exists());
    }

    #[test]
    fn test_templates_render_into_config_dir() {
        let project = project_with_sources();
        let templates = project.path().join("templates");
        fs::create_dir_all(&templates).unwrap();
        fs::write(
            templates.join("app.json.tmpl"),
            r#"{"app": "${APP_NAME}", "debug": ${DEBUG}}"#,
        )
        .unwrap();
        fs::write(
            templates.join("gtach.service.tmpl"),
            "[Unit]\nDescription=${APP_NAME} ${VERSION}\n",
        )
        .unwrap();
        fs::write(templates.join("app.env.tmpl"), "PREFIX=${INSTALL_PREFIX}\n").unwrap();

        let creator = PackageCreator::new(project.path());
        let artifact = creator.create_package(&config("0.1.0"), None).unwrap();

        let manifest = archive::read_manifest(&artifact).unwrap();
        let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"config/app.json"));
        assert!(paths.contains(&"config/gtach.service"));
        assert!(paths.contains(&"config/app.env"));
    }

    #[test]
    fn test_concurrent_creation_on_shared_instance() {
        let project = project_with_sources();
        let creator = Arc::new(PackageCreator::new(project.path()));
        let out_dir = Arc::new(project.path().join("out"));
        fs::create_dir_all(out_dir.as_path()).unwrap();

        let mut handles = Vec::new();
        for i in 0..4 {
            let creator = Arc::clone(&creator);
            let out_dir = Arc::clone(&out_dir);
            handles.push(std::thread::spawn(move || {
                let cfg = config("0.1.0");
                let out = out_dir.join(format!("pkg-{i}.tar.gz"));
                creator.create_package(&cfg, Some(&out)).unwrap();
                out
            }));
        }

        let mut aggregates = Vec::new();
        for handle in handles {
            let out = handle.join().unwrap();
            // independently verifiable
            let scratch = TempDir::new().unwrap();
            let result = archive::extract(&out, &scratch.path().join("x")).unwrap();
            aggregates.push(result.manifest.aggregate_checksum);
        }
        // no cross-contamination: all builds saw the same inputs
        assert!(aggregates.windows(2).all(|w| w[0] == w[1]));
    }
}
