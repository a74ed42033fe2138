// src/package/mod.rs

//! Package configuration, manifest, and creation pipeline

pub mod config;
pub mod creator;
pub mod manifest;
pub mod scripts;

pub use config::{resolve_project_root, PackageConfig, CONFIG_NAME};
pub use creator::PackageCreator;
pub use manifest::{Manifest, ManifestFile, MANIFEST_NAME};
