//! Domain metadata supplied by the orchestrator for one publish run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Which tag vocabulary the builders emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// Current vocabulary.
    #[default]
    Current,
    /// Backward-compatible vocabulary used by older indexers.
    Legacy,
}

/// Release channel; defaults to `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Main,
    Beta,
    Nightly,
    Dev,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Main => "main",
            Channel::Beta => "beta",
            Channel::Nightly => "nightly",
            Channel::Dev => "dev",
        };
        f.write_str(s)
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main" | "" => Ok(Channel::Main),
            "beta" => Ok(Channel::Beta),
            "nightly" => Ok(Channel::Nightly),
            "dev" => Ok(Channel::Dev),
            other => Err(Error::Validation(format!("unknown channel: {other}"))),
        }
    }
}

/// Application-level metadata for the kind 32267 event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMetadata {
    /// Reverse-DNS style identifier, e.g. `com.example.app`.
    pub identifier: String,
    pub name: String,
    pub description: String,
    pub summary: String,
    pub website: String,
    pub license: String,
    /// Source repository reference (single; first wins when scraped).
    pub repository: String,
    /// Free-form category tags.
    pub tags: Vec<String>,
    pub icon_url: String,
    pub image_urls: Vec<String>,
    /// Platform identifiers the app supports.
    pub platforms: Vec<String>,
    /// Emit the legacy tag vocabulary for this app.
    pub legacy_format: bool,
}

/// Release-level metadata for the kind 30063 event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseMetadata {
    pub identifier: String,
    pub version: String,
    pub version_code: u64,
    pub changelog: String,
    pub channel: Channel,
    /// Legacy-only release page URL.
    pub release_url: String,
    /// Legacy-only commit hash.
    pub commit: String,
}

/// Per-file metadata for a kind 1063 asset event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetMetadata {
    /// Defaults to the app identifier; override for multi-variant apps.
    pub identifier: String,
    pub version: String,
    pub sha256: String,
    pub size: u64,
    pub download_urls: Vec<String>,
    /// Signing certificate fingerprint.
    pub cert_fingerprint: String,
    pub min_platform_version: String,
    pub target_platform_version: String,
    pub platforms: Vec<String>,
    pub filename: String,
    /// Variant label distinguishing builds of the same version.
    pub variant: String,
    pub commit: String,
    pub permissions: Vec<String>,
    /// Supported protocol extensions (e.g. NIP identifiers).
    pub protocol_extensions: Vec<String>,
    /// Oldest version an installed copy may upgrade from.
    pub min_allowed_version: String,
}

/// Platform identifiers substituted when an artifact carries no
/// architecture-specific native components.
pub const GENERIC_PLATFORMS: [&str; 4] = [
    "android-arm64-v8a",
    "android-armeabi-v7a",
    "android-x86",
    "android-x86_64",
];
