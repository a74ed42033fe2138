// src/lib.rs

//! Consign Deployment Engine
//!
//! Packaging and staged updates for applications deployed to
//! resource-constrained single-board targets.
//!
//! # Architecture
//!
//! - Deterministic archives: sorted entries, fixed mtimes, manifest
//!   finalized before the archive is opened
//! - File-level tracking: SHA-256 per file plus an order-independent
//!   aggregate checksum over the whole tree
//! - Staged updates: backup, stage, validate, then an atomic rename
//!   swap with rollback on any failure
//! - Local repository: JSON index rewritten whole through temp-file
//!   renames, immutable records

pub mod archive;
mod error;
pub mod hash;
pub mod package;
pub mod paths;
pub mod repository;
pub mod template;
pub mod update;
pub mod version;

pub use error::{Error, Result};
pub use hash::HashAlgorithm;
pub use package::{Manifest, PackageConfig, PackageCreator};
pub use repository::{PackageRecord, PackageRepository};
pub use template::{TemplateFormat, TemplateValue};
pub use update::{HookVerdict, UpdateManager, UpdatePhase, ValidationHook};
pub use version::{CompatPolicy, Version};
