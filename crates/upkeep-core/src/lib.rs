//! Update engine building blocks that do not depend on the host binary:
//! - Release discovery against the GitHub releases API, with a response cache.
//! - Architecture-aware asset selection.
//! - Structural version comparison of release tags.
//! - Artifact downloads with progress, caching and integrity checks.

mod asset;
mod download;
mod integrity;
mod release;
mod signature;
mod version;

#[cfg(any(test, feature = "test-util"))]
pub mod test_server;

/// Architecture ordering and asset matching.
pub use asset::{AssetMatcher, SelectedAsset, architecture_order, select_asset};
/// Artifact download pipeline.
pub use download::{
    DownloadHandle, DownloadManager, DownloadOutcome, DownloadRequest, DownloadState,
};
/// Post-download checks shared with callers that inspect cached files.
pub use integrity::{sha256_hex, verify_archive, verify_size};
/// GitHub release source and release search.
pub use release::{GitHubRelease, GithubReleaseClient, find_release};
/// Signature-block fingerprinting.
pub use signature::ArchiveSignatureInspector;
/// Release tag normalization and comparison.
pub use version::{ReleaseVersion, is_newer, normalize_tag};
