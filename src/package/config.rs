// src/package/config.rs

//! Package build configuration
//!
//! The configuration is an explicit struct with a single validation pass
//! at construction time. It is typically loaded from a `consign.toml`
//! at the project root, with the version supplied per invocation.

use crate::error::{Error, Result};
use crate::version::Version;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const CONFIG_NAME: &str = "consign.toml";

/// Project marker files, checked in order during root resolution
const ROOT_MARKERS: &[&str] = &[CONFIG_NAME, ".git"];

/// Validated configuration for one package creation call
#[derive(Debug, Clone)]
pub struct PackageConfig {
    pub name: String,
    pub version: Version,
    pub target_platform: String,
    /// Source directories, relative to the project root
    pub source_dirs: Vec<PathBuf>,
    pub exclude_patterns: Vec<String>,
    /// Template directories, relative to the project root
    pub config_template_dirs: Vec<PathBuf>,
    /// Where the finished archive goes, relative to the project root
    pub output_dir: PathBuf,
    /// Re-extract and re-hash the archive after writing it
    pub verify_integrity: bool,
    /// Generate install/uninstall scripts into the package
    pub create_install_script: bool,
}

/// On-disk shape of consign.toml
#[derive(Debug, Deserialize)]
struct ConfigFile {
    package: PackageSection,
    #[serde(default)]
    build: BuildSection,
}

#[derive(Debug, Deserialize)]
struct PackageSection {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default = "default_platform")]
    target_platform: String,
}

#[derive(Debug, Deserialize, Default)]
struct BuildSection {
    #[serde(default = "default_source_dirs")]
    source_dirs: Vec<PathBuf>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
    #[serde(default = "default_template_dirs")]
    config_template_dirs: Vec<PathBuf>,
    #[serde(default = "default_output_dir")]
    output_dir: PathBuf,
    #[serde(default = "default_true")]
    verify_integrity: bool,
    #[serde(default = "default_true")]
    create_install_script: bool,
}

fn default_platform() -> String {
    "raspberry-pi".to_string()
}

fn default_source_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("src")]
}

fn default_template_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("templates")]
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_true() -> bool {
    true
}

impl PackageConfig {
    /// Load configuration from a consign.toml, with `version` overriding
    /// any version recorded in the file. A version must come from one of
    /// the two; it is never auto-generated.
    pub fn from_file(path: &Path, version: Option<&str>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        let parsed: ConfigFile = toml::from_str(&content)
            .map_err(|e| Error::Validation(format!("bad config {}: {e}", path.display())))?;

        let version_str = version
            .map(str::to_string)
            .or(parsed.package.version)
            .ok_or_else(|| {
                Error::Validation(
                    "no version supplied: pass --version or set package.version".to_string(),
                )
            })?;

        Self::new(
            &parsed.package.name,
            Version::parse(&version_str)?,
            &parsed.package.target_platform,
            parsed.build.source_dirs,
            parsed.build.exclude_patterns,
            parsed.build.config_template_dirs,
            parsed.build.output_dir,
            parsed.build.verify_integrity,
            parsed.build.create_install_script,
        )
    }

    /// Build and validate a configuration in one pass
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        version: Version,
        target_platform: &str,
        source_dirs: Vec<PathBuf>,
        exclude_patterns: Vec<String>,
        config_template_dirs: Vec<PathBuf>,
        output_dir: PathBuf,
        verify_integrity: bool,
        create_install_script: bool,
    ) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(Error::Validation("package name must not be empty".to_string()));
        }
        if name.contains(['/', '\\']) || name.contains(char::is_whitespace) {
            return Err(Error::Validation(format!(
                "package name '{name}' contains path separators or whitespace"
            )));
        }
        if target_platform.trim().is_empty() {
            return Err(Error::Validation("target platform must not be empty".to_string()));
        }
        if source_dirs.is_empty() {
            return Err(Error::Validation(
                "at least one source directory is required".to_string(),
            ));
        }

        Ok(Self {
            name: name.to_string(),
            version,
            target_platform: target_platform.to_string(),
            source_dirs,
            exclude_patterns,
            config_template_dirs,
            output_dir,
            verify_integrity,
            create_install_script,
        })
    }

    /// Check that every configured source directory exists under the
    /// resolved project root.
    pub fn check_source_dirs(&self, project_root: &Path) -> Result<()> {
        for dir in &self.source_dirs {
            let full = resolve_under(project_root, dir);
            if !full.is_dir() {
                return Err(Error::Validation(format!(
                    "source directory {} does not exist",
                    full.display()
                )));
            }
        }
        Ok(())
    }
}

/// Join a possibly-relative path onto the project root
pub fn resolve_under(project_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    }
}

/// Resolve the project root by walking upward from `start` until a
/// directory containing a recognized marker is found.
///
/// The walk is purely ancestor-based, so the result is identical whether
/// invoked from the project root or a deeply nested subdirectory, and a
/// caller's scratch directory is never mistaken for the root while a
/// real marker exists above it.
pub fn resolve_project_root(start: &Path) -> Result<PathBuf> {
    let start = start
        .canonicalize()
        .map_err(|e| Error::Validation(format!("cannot resolve {}: {e}", start.display())))?;

    for dir in start.ancestors() {
        for marker in ROOT_MARKERS {
            if dir.join(marker).exists() {
                return Ok(dir.to_path_buf());
            }
        }
    }

    Err(Error::Validation(format!(
        "no project marker ({}) found above {}",
        ROOT_MARKERS.join(", "),
        start.display()
    )))
}
