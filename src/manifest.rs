//! Release Manifests
//!
//! The on-disk metadata describing one published Atrium release:
//! version, target platform, artifact location, checksum and detached
//! signature. Manifests are produced offline by the release pipeline;
//! this server only reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Supported build targets. Fixed set; anything else in a manifest is a
/// load-time parse failure, and anything else in a request is a 404.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "windows-x64")]
    WindowsX64,
    #[serde(rename = "macos-x64")]
    MacosX64,
    #[serde(rename = "macos-arm64")]
    MacosArm64,
    #[serde(rename = "linux-x64")]
    LinuxX64,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::WindowsX64,
        Platform::MacosX64,
        Platform::MacosArm64,
        Platform::LinuxX64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WindowsX64 => "windows-x64",
            Platform::MacosX64 => "macos-x64",
            Platform::MacosArm64 => "macos-arm64",
            Platform::LinuxX64 => "linux-x64",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "windows-x64" => Ok(Platform::WindowsX64),
            "macos-x64" => Ok(Platform::MacosX64),
            "macos-arm64" => Ok(Platform::MacosArm64),
            "linux-x64" => Ok(Platform::LinuxX64),
            other => Err(ManifestError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Strict `MAJOR.MINOR.PATCH` semantic version. "Latest" is decided by
/// comparing these, never by file mtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for SemVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SemVer {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ManifestError::InvalidVersion(s.to_string());
        let mut parts = s.split('.');
        let major = parts.next().ok_or_else(bad)?;
        let minor = parts.next().ok_or_else(bad)?;
        let patch = parts.next().ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }
        // Components must be plain ASCII digits; u32::parse alone would
        // accept a leading '+'.
        for p in [major, minor, patch] {
            if p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()) {
                return Err(bad());
            }
        }
        Ok(SemVer {
            major: major.parse().map_err(|_| bad())?,
            minor: minor.parse().map_err(|_| bad())?,
            patch: patch.parse().map_err(|_| bad())?,
        })
    }
}

/// Manifest parse/validation errors. All of these disqualify a manifest at
/// catalog-load time; none of them are visible to HTTP clients.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("invalid version string: {0}")]
    InvalidVersion(String),
}

/// One published release, as stored in a `*.manifest.json` file next to its
/// artifact in the release directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    /// Semantic version string, unique per platform.
    pub version: String,
    pub platform: Platform,
    /// Artifact location, relative to the release directory.
    pub artifact_path: String,
    /// Lowercase hex SHA-256 of the artifact, computed at publish time.
    pub checksum: String,
    /// Hex ed25519 detached signature over the signing message.
    pub signature: String,
    pub published_at: DateTime<Utc>,
    /// Explicit CDN mirror URL for this artifact, overriding the template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdn_url: Option<String>,
    /// Set to `false` while an artifact is not yet mirrored; the server then
    /// streams it directly even in CDN mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirrored: Option<bool>,
}

impl ReleaseManifest {
    /// The canonical byte string the release pipeline signs. Covers exactly
    /// the `(version, platform, checksum)` tuple, so changing any one of
    /// them invalidates the signature.
    pub fn signing_message(&self) -> String {
        format!("{}\n{}\n{}", self.version, self.platform, self.checksum)
    }

    pub fn semver(&self) -> Result<SemVer, ManifestError> {
        self.version.parse()
    }
}
