// tests/workflow.rs

//! Full deployment workflow: build a package from a project tree, store
//! it in a repository, install it, upgrade it, and exercise rollback.

mod common;

use consign::package::{PackageConfig, PackageCreator, CONFIG_NAME};
use consign::repository::PackageRepository;
use consign::update::{HookVerdict, ManifestHook, UpdateManager, UpdatePhase, ValidationHook};
use consign::version::{CompatPolicy, Version};
use consign::{archive, paths, Error};
use std::fs;
use std::path::Path;

fn build(root: &Path, version: Option<&str>) -> std::path::PathBuf {
    let config = PackageConfig::from_file(&root.join(CONFIG_NAME), version).unwrap();
    let creator = PackageCreator::new(root);
    creator.create_package(&config, None).unwrap()
}

#[test]
fn test_build_produces_complete_artifact() {
    let (_dir, root) = common::scaffold_project("gtach", "0.1.0");
    let artifact = build(&root, None);

    assert!(artifact.ends_with("dist/gtach-v0.1.0.tar.gz"));
    let manifest = archive::read_manifest(&artifact).unwrap();
    assert_eq!(manifest.package_name, "gtach");
    assert_eq!(manifest.version.to_string(), "0.1.0");
    assert_eq!(manifest.platform, "raspberry-pi");

    let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    // Sources survive, rendered configs and scripts are present,
    // bytecode noise is gone
    assert!(paths.contains(&"src/main.py"));
    assert!(paths.contains(&"src/display.py"));
    assert!(paths.contains(&"config/settings.json"));
    assert!(paths.contains(&"config/app.service"));
    assert!(paths.contains(&"config/app.env"));
    assert!(paths.contains(&"install.sh"));
    assert!(paths.contains(&"uninstall.sh"));
    assert!(!paths.iter().any(|p| p.contains("pyc") || p.contains("__pycache__")));
}

#[test]
fn test_rendered_json_config_is_valid() {
    let (_dir, root) = common::scaffold_project("gtach", "0.1.0");
    let artifact = build(&root, None);

    let scratch = tempfile::tempdir().unwrap();
    let dest = scratch.path().join("tree");
    archive::extract(&artifact, &dest).unwrap();

    let settings: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dest.join("config/settings.json")).unwrap())
            .unwrap();
    assert_eq!(settings["app"], "gtach");
    assert_eq!(settings["version"], "0.1.0");
    // Bool substitution must stay a JSON bool, not a string
    assert_eq!(settings["debug"], serde_json::Value::Bool(false));
}

#[test]
fn test_create_store_install_upgrade() {
    let (dir, root) = common::scaffold_project("gtach", "0.1.0");
    let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
    let state_root = dir.path().join("state");
    let install_dir = dir.path().join("opt/gtach");

    let v1 = build(&root, None);
    repo.store(&v1, vec![]).unwrap();

    common::bump_project(&root, "0.2.0");
    let v2 = build(&root, None);
    repo.store(&v2, vec![]).unwrap();

    let manager = UpdateManager::new(&repo, &state_root, &install_dir, CompatPolicy::default());

    let report = manager
        .apply("gtach", &Version::parse("0.1.0").unwrap(), &ManifestHook)
        .unwrap();
    assert_eq!(report.phase, UpdatePhase::Committed);
    assert!(
        fs::read_to_string(install_dir.join("src/main.py"))
            .unwrap()
            .contains("0.1.0")
    );
    assert_eq!(
        manager.installed_version().unwrap().unwrap().to_string(),
        "0.1.0"
    );

    let report = manager
        .apply("gtach", &Version::parse("0.2.0").unwrap(), &ManifestHook)
        .unwrap();
    assert_eq!(report.from_version.unwrap().to_string(), "0.1.0");
    assert!(
        fs::read_to_string(install_dir.join("src/main.py"))
            .unwrap()
            .contains("0.2.0")
    );

    // Committed sessions leave no backup or staging trees behind
    let leftover = |dir: std::path::PathBuf| {
        dir.read_dir().map(|mut d| d.next().is_some()).unwrap_or(false)
    };
    assert!(!leftover(paths::backup_dir(&state_root)));
    assert!(!leftover(paths::staging_dir(&state_root)));
}

#[test]
fn test_fresh_install_under_new_prefix() {
    let (dir, root) = common::scaffold_project("gtach", "0.1.0");
    let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
    let state_root = dir.path().join("state");
    // No component of the install path exists before the first apply
    let install_dir = dir.path().join("target/hosts/pi/opt/gtach");

    let artifact = build(&root, None);
    repo.store(&artifact, vec![]).unwrap();

    let manager = UpdateManager::new(&repo, &state_root, &install_dir, CompatPolicy::default());
    manager
        .apply("gtach", &Version::parse("0.1.0").unwrap(), &ManifestHook)
        .unwrap();

    assert!(install_dir.join("src/main.py").exists());
    assert!(install_dir.join("config/settings.json").exists());
}

struct Sabotage;

impl ValidationHook for Sabotage {
    fn validate(&self, staged: &Path) -> consign::Result<HookVerdict> {
        // Damage the staged tree, then let the structural check find it
        fs::remove_file(staged.join("src/display.py"))?;
        ManifestHook.validate(staged)
    }
}

#[test]
fn test_damaged_staging_rolls_back() {
    let (dir, root) = common::scaffold_project("gtach", "0.1.0");
    let repo = PackageRepository::open(dir.path().join("repo")).unwrap();
    let state_root = dir.path().join("state");
    let install_dir = dir.path().join("opt/gtach");

    let v1 = build(&root, None);
    repo.store(&v1, vec![]).unwrap();
    common::bump_project(&root, "0.2.0");
    let v2 = build(&root, None);
    repo.store(&v2, vec![]).unwrap();

    let manager = UpdateManager::new(&repo, &state_root, &install_dir, CompatPolicy::default());
    manager
        .apply("gtach", &Version::parse("0.1.0").unwrap(), &ManifestHook)
        .unwrap();

    let err = manager
        .apply("gtach", &Version::parse("0.2.0").unwrap(), &Sabotage)
        .unwrap_err();
    assert!(matches!(err, Error::UpdateRolledBack { .. }));
    assert_eq!(err.exit_code(), 5);

    // Previous install fully restored, including rendered configs
    assert_eq!(
        manager.installed_version().unwrap().unwrap().to_string(),
        "0.1.0"
    );
    assert!(install_dir.join("config/settings.json").exists());
    assert!(install_dir.join("install.sh").exists());
}

#[test]
fn test_rebuilds_of_same_tree_are_equivalent() {
    let (_dir, root) = common::scaffold_project("gtach", "0.1.0");
    let first = build(&root, None);
    let renamed = first.with_file_name("first.tar.gz");
    fs::rename(&first, &renamed).unwrap();
    let second = build(&root, None);

    // Identical content modulo the creation timestamp
    let mut m1 = archive::read_manifest(&renamed).unwrap();
    let m2 = archive::read_manifest(&second).unwrap();
    m1.created_at = m2.created_at;
    assert_eq!(m1.files, m2.files);
    assert_eq!(m1.aggregate_checksum, m2.aggregate_checksum);
    assert_eq!(m1.scripts, m2.scripts);
}

#[test]
fn test_version_override_wins_over_config() {
    let (_dir, root) = common::scaffold_project("gtach", "0.1.0");
    let artifact = build(&root, Some("0.5.0"));
    assert!(artifact.ends_with("dist/gtach-v0.5.0.tar.gz"));
    let manifest = archive::read_manifest(&artifact).unwrap();
    assert_eq!(manifest.version.to_string(), "0.5.0");
}
