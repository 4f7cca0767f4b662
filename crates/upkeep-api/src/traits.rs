use async_trait::async_trait;
use std::path::Path;

use crate::error::UpdateError;
use crate::types::{
    AppDescriptor, CacheMode, InstallOutcome, ReleaseInfo, RepoCoordinates, SystemConditions,
    UpdateStatus,
};

/// Remote repository holding the releases of an app.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Releases ordered most recent first, `page_count` pages deep.
    async fn fetch_releases(
        &self,
        repo: &RepoCoordinates,
        page_count: u32,
        cache_mode: CacheMode,
    ) -> Result<Vec<ReleaseInfo>, UpdateError>;

    async fn fetch_latest(
        &self,
        repo: &RepoCoordinates,
        cache_mode: CacheMode,
    ) -> Result<ReleaseInfo, UpdateError>;
}

#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, app: &AppDescriptor, file: &Path, version: &str) -> InstallOutcome;
}

#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn conditions(&self) -> SystemConditions;
}

pub trait PackageInspector: Send + Sync {
    /// Lowercase SHA-256 hex identifying the signer of the package at `path`,
    /// or `None` for an unsigned package.
    fn signing_fingerprint(&self, path: &Path) -> Result<Option<String>, UpdateError>;
}

pub trait InstalledApps: Send + Sync {
    /// Installed version name, or `None` when the app is not installed.
    fn installed_version(&self, app: &AppDescriptor) -> Option<String>;
}

/// User-visible reporting. Rendering is up to the implementation.
pub trait Notifier: Send + Sync {
    fn update_available(&self, statuses: &[UpdateStatus]);
    fn app_failed(&self, app: &AppDescriptor, error: &UpdateError);
    fn retries_exhausted(&self, reason: &str);
    fn installed(&self, app: &AppDescriptor, version: &str);
    fn needs_user_interaction(&self, app: &AppDescriptor, file: &Path);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;

    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReleaseSource for CountingSource {
        async fn fetch_releases(
            &self,
            repo: &RepoCoordinates,
            page_count: u32,
            cache_mode: CacheMode,
        ) -> Result<Vec<ReleaseInfo>, UpdateError> {
            let mut releases = Vec::new();
            for _ in 0..page_count {
                releases.push(self.fetch_latest(repo, cache_mode).await?);
            }
            Ok(releases)
        }

        async fn fetch_latest(
            &self,
            _repo: &RepoCoordinates,
            _cache_mode: CacheMode,
        ) -> Result<ReleaseInfo, UpdateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ReleaseInfo {
                tag: format!("v1.0.{call}"),
                prerelease: false,
                published_at: Utc::now(),
                assets: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn release_source_is_object_safe() {
        let source: Box<dyn ReleaseSource> = Box::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let repo = RepoCoordinates {
            owner: "o",
            name: "r",
        };

        let releases = source
            .fetch_releases(&repo, 2, CacheMode::UseCache)
            .await
            .expect("fake source should not fail");

        assert_eq!(releases.len(), 2);
        assert_eq!(releases[1].tag, "v1.0.1");
    }
}
