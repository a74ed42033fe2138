// src/version/mod.rs

//! Semantic version parsing, comparison, and upgrade compatibility
//!
//! Versions follow the strict `MAJOR.MINOR.PATCH[-PRERELEASE][+BUILD]`
//! grammar. Build metadata is preserved in string form but ignored for
//! ordering, per the semver specification.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed semantic version. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(semver::Version);

impl Version {
    /// Parse a version string with the strict semver grammar.
    ///
    /// Rejects non-numeric major/minor/patch, leading zeros, and empty
    /// prerelease segments. Malformed input returns a typed validation
    /// error, never a panic.
    pub fn parse(s: &str) -> Result<Self> {
        let inner = semver::Version::parse(s.trim())
            .map_err(|e| Error::Validation(format!("invalid version '{s}': {e}")))?;
        Ok(Self(inner))
    }

    pub fn major(&self) -> u64 {
        self.0.major
    }

    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// The prerelease component, if any (e.g. "alpha.1")
    pub fn prerelease(&self) -> Option<&str> {
        if self.0.pre.is_empty() {
            None
        } else {
            Some(self.0.pre.as_str())
        }
    }

    /// Build metadata, if any. Preserved for display, never compared.
    pub fn build(&self) -> Option<&str> {
        if self.0.build.is_empty() {
            None
        } else {
            Some(self.0.build.as_str())
        }
    }

    /// Three-way comparison per semver precedence rules.
    ///
    /// Numeric fields compare numerically; a version with a prerelease
    /// ranks below the same version without one; prerelease segments
    /// compare per semver rules. Build metadata is ignored.
    pub fn compare(&self, other: &Version) -> Ordering {
        self.0.cmp_precedence(&other.0)
    }
}

// Total ordering stays consistent with Eq (build metadata included as
// a final tiebreak); precedence comparison is `compare`.
impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Policy governing whether an update is permitted
#[derive(Debug, Clone, Copy, Default)]
pub struct CompatPolicy {
    /// Permit updates that change the major version. Off by default;
    /// major bumps require an explicit operator override.
    pub allow_major_jump: bool,
}

/// Check whether `target` is an allowed upgrade from `current`.
///
/// Default policy: same major line and monotonic (`target >= current`).
/// A major bump needs `allow_major_jump`; downgrades are never allowed.
pub fn is_compatible(current: &Version, target: &Version, policy: CompatPolicy) -> bool {
    if target.compare(current) == Ordering::Less {
        return false;
    }
    if target.major() != current.major() {
        return policy.allow_major_jump;
    }
    true
}

/// Explain why an update is not permitted. `None` means it is allowed.
pub fn incompatibility_reason(
    current: &Version,
    target: &Version,
    policy: CompatPolicy,
) -> Option<String> {
    if target.compare(current) == Ordering::Less {
        return Some("downgrades are not permitted".to_string());
    }
    if target.major() != current.major() && !policy.allow_major_jump {
        return Some(format!(
            "major version change {} -> {} requires an explicit override",
            current.major(),
            target.major()
        ));
    }
    None
}
