// src/package/scripts.rs

//! Install script generation
//!
//! Packages ship self-contained POSIX shell scripts so the target host
//! can install or remove the payload without any tooling beyond tar.
//! Scripts are generated into the creation workspace and listed in the
//! manifest; they are never executed here.

use crate::error::Result;
use crate::package::config::PackageConfig;
use std::fs;
use std::path::Path;

/// Names of the generated scripts, in generation order
pub const SCRIPT_NAMES: &[&str] = &["install.sh", "uninstall.sh"];

/// Generate install/uninstall scripts into `workspace`.
///
/// Returns the archive-relative names of the scripts written.
pub fn generate(config: &PackageConfig, workspace: &Path) -> Result<Vec<String>> {
    let install = install_script(config);
    let uninstall = uninstall_script(config);

    write_executable(&workspace.join("install.sh"), &install)?;
    write_executable(&workspace.join("uninstall.sh"), &uninstall)?;

    Ok(SCRIPT_NAMES.iter().map(|s| s.to_string()).collect())
}

fn write_executable(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

fn install_script(config: &PackageConfig) -> String {
    format!(
        r#"#!/bin/sh
# install.sh for {name} v{version} ({platform})
set -eu

PREFIX="${{PREFIX:-/opt/{name}}}"
HERE="$(cd "$(dirname "$0")" && pwd)"

echo "Installing {name} v{version} to $PREFIX"
mkdir -p "$PREFIX"
for entry in "$HERE"/*; do
    base="$(basename "$entry")"
    case "$base" in
        install.sh|uninstall.sh|manifest.json) continue ;;
    esac
    cp -R "$entry" "$PREFIX/"
done
cp "$HERE/manifest.json" "$PREFIX/manifest.json"

if [ -f "$PREFIX/config/{name}.service" ] && [ -d /etc/systemd/system ]; then
    cp "$PREFIX/config/{name}.service" /etc/systemd/system/
    systemctl daemon-reload || true
fi

echo "Installed {name} v{version}"
"#,
        name = config.name,
        version = config.version,
        platform = config.target_platform,
    )
}

fn uninstall_script(config: &PackageConfig) -> String {
    format!(
        r#"#!/bin/sh
# uninstall.sh for {name} v{version}
set -eu

PREFIX="${{PREFIX:-/opt/{name}}}"

if [ -f "/etc/systemd/system/{name}.service" ]; then
    systemctl stop {name} 2>/dev/null || true
    systemctl disable {name} 2>/dev/null || true
    rm -f "/etc/systemd/system/{name}.service"
    systemctl daemon-reload || true
fi

rm -rf "$PREFIX"
echo "Removed {name} v{version}"
"#,
        name = config.name,
        version = config.version,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn config() -> PackageConfig {
        PackageConfig::new(
            "gtach",
            Version::parse("0.1.0-alpha.1").unwrap(),
            "raspberry-pi",
            vec![PathBuf::from("src")],
            vec![],
            vec![],
            PathBuf::from("dist"),
            true,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_generate_writes_both_scripts() {
        let dir = TempDir::new().unwrap();
        let names = generate(&config(), dir.path()).unwrap();
        assert_eq!(names, vec!["install.sh", "uninstall.sh"]);
        assert!(dir.path().join("install.sh").exists());
        assert!(dir.path().join("uninstall.sh").exists());
    }

    #[test]
    fn test_scripts_mention_package_identity() {
        let install = install_script(&config());
        assert!(install.contains("gtach v0.1.0-alpha.1"));
        assert!(install.starts_with("#!/bin/sh"));
        assert!(install.contains("set -eu"));
    }

    #[cfg(unix)]
    #[test]
    fn test_scripts_are_executable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        generate(&config(), dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join("install.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
