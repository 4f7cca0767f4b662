use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Processor architecture of a device or of a release asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Abi {
    #[serde(rename = "arm64-v8a")]
    Arm64V8a,
    #[serde(rename = "armeabi-v7a")]
    ArmeabiV7a,
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "x86")]
    X86,
}

impl Abi {
    pub const ALL: [Abi; 4] = [Abi::Arm64V8a, Abi::ArmeabiV7a, Abi::X86_64, Abi::X86];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Arm64V8a => "arm64-v8a",
            Self::ArmeabiV7a => "armeabi-v7a",
            Self::X86_64 => "x86_64",
            Self::X86 => "x86",
        }
    }

    #[must_use]
    pub fn is_64_bit(self) -> bool {
        matches!(self, Self::Arm64V8a | Self::X86_64)
    }
}

impl fmt::Display for Abi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Abi {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Abi::ALL
            .into_iter()
            .find(|abi| abi.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown architecture: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepoCoordinates {
    pub owner: &'static str,
    pub name: &'static str,
}

impl fmt::Display for RepoCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Container format of a downloadable artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Apk,
    Zip,
}

impl ArtifactFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Apk => "apk",
            Self::Zip => "zip",
        }
    }
}

/// Asset-name pattern for one supported architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetRule {
    pub abi: Abi,
    pub pattern: &'static str,
}

/// Static description of one tracked application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub id: &'static str,
    pub package: &'static str,
    pub display_name: &'static str,
    pub repository: RepoCoordinates,
    pub assets: &'static [AssetRule],
    /// Regex whose first capture group is the version inside a release tag.
    pub tag_pattern: &'static str,
    /// Lowercase SHA-256 hex of the expected signer certificate. Packages of
    /// an app without one are never downloaded.
    pub signing_fingerprint: Option<&'static str>,
    pub format: ArtifactFormat,
    /// Marks the updater's own package, which must install last.
    pub self_update: bool,
}

impl AppDescriptor {
    pub fn supported_abis(&self) -> impl Iterator<Item = Abi> + '_ {
        self.assets.iter().map(|rule| rule.abi)
    }

    #[must_use]
    pub fn asset_pattern(&self, abi: Abi) -> Option<&'static str> {
        self.assets
            .iter()
            .find(|rule| rule.abi == abi)
            .map(|rule| rule.pattern)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    pub download_url: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub tag: String,
    pub prerelease: bool,
    pub published_at: DateTime<Utc>,
    pub assets: Vec<Asset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    UseCache,
    ForceNetwork,
}

/// Result of checking one app against its latest release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub app_id: String,
    pub installed_version: Option<String>,
    pub latest_version: String,
    pub is_update_available: bool,
    pub publish_date: DateTime<Utc>,
    pub abi: Abi,
    pub asset: Asset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
}

impl DownloadProgress {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some(self.downloaded as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Success,
    NeedsUserInteraction,
    Failed { code: i32, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    Unavailable,
    Metered,
    Unmetered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConditions {
    pub network: NetworkState,
    pub battery_low: bool,
    pub idle: bool,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    #[error("Tag '{tag}' does not match pattern '{pattern}'")]
    TagMismatch { tag: String, pattern: String },
    #[error("Invalid tag pattern '{pattern}': {details}")]
    InvalidPattern { pattern: String, details: String },
    #[error("Invalid version segment '{segment}' in '{input}'")]
    InvalidSegment { input: String, segment: String },
    #[error("Empty version string")]
    Empty,
}
