// tests/common/mod.rs

//! Shared fixtures: a minimal project tree the way a real deployment
//! project would look on disk.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Scaffold a project with consign.toml, sources and templates.
/// Returns the temp dir holding it and the project root path.
pub fn scaffold_project(name: &str, version: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join(name);
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join("templates")).unwrap();

    fs::write(
        root.join("consign.toml"),
        format!(
            r#"[package]
name = "{name}"
version = "{version}"
target_platform = "raspberry-pi"

[build]
source_dirs = ["src"]
exclude_patterns = ["*.pyc", "__pycache__"]
config_template_dirs = ["templates"]
output_dir = "dist"
"#
        ),
    )
    .unwrap();

    fs::write(
        root.join("src/main.py"),
        format!("VERSION = \"{version}\"\nprint(VERSION)\n"),
    )
    .unwrap();
    fs::write(root.join("src/display.py"), "class Display:\n    pass\n").unwrap();
    // Noise that exclusion patterns should drop
    fs::write(root.join("src/main.pyc"), b"\x00bytecode").unwrap();
    fs::create_dir_all(root.join("src/__pycache__")).unwrap();
    fs::write(root.join("src/__pycache__/main.cpython-311.pyc"), b"\x00").unwrap();

    fs::write(
        root.join("templates/settings.json.tmpl"),
        r#"{"app": "${APP_NAME}", "version": "${VERSION}", "debug": ${DEBUG}}"#,
    )
    .unwrap();
    fs::write(
        root.join("templates/app.service.tmpl"),
        "[Unit]\nDescription=${APP_NAME}\n\n[Service]\nExecStart=${INSTALL_PREFIX}/src/main.py\n",
    )
    .unwrap();
    fs::write(
        root.join("templates/app.env.tmpl"),
        "APP_NAME=${APP_NAME}\nPLATFORM=${PLATFORM}\n",
    )
    .unwrap();

    (dir, root)
}

/// Bump the version recorded in an existing project's consign.toml and
/// source so a rebuild produces a genuinely different tree.
pub fn bump_project(root: &Path, version: &str) {
    let config = fs::read_to_string(root.join("consign.toml")).unwrap();
    let mut out = String::new();
    for line in config.lines() {
        if line.starts_with("version = ") {
            out.push_str(&format!("version = \"{version}\"\n"));
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    fs::write(root.join("consign.toml"), out).unwrap();
    fs::write(
        root.join("src/main.py"),
        format!("VERSION = \"{version}\"\nprint(VERSION)\n"),
    )
    .unwrap();
}
