use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;
use upkeep_api::{
    Abi, AppDescriptor, CacheMode, InstalledApps, PackageInspector, ReleaseSource, UpdateError,
    UpdateStatus,
};
use upkeep_core::{
    AssetMatcher, DownloadManager, DownloadRequest, architecture_order, find_release, is_newer,
    normalize_tag,
};

/// Per-app update steps: find the newest release for this device, compare it
/// with the installed version, then fetch and verify its package.
pub struct Coordinator {
    source: Arc<dyn ReleaseSource>,
    downloads: DownloadManager,
    inspector: Arc<dyn PackageInspector>,
    installed: Arc<dyn InstalledApps>,
    device_abis: Vec<Abi>,
    prefer_32bit: bool,
    page_count: u32,
    fingerprint_overrides: HashMap<String, String>,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn ReleaseSource>,
        downloads: DownloadManager,
        inspector: Arc<dyn PackageInspector>,
        installed: Arc<dyn InstalledApps>,
        device_abis: Vec<Abi>,
    ) -> Self {
        Self {
            source,
            downloads,
            inspector,
            installed,
            device_abis,
            prefer_32bit: false,
            page_count: 3,
            fingerprint_overrides: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_prefer_32bit(mut self, prefer_32bit: bool) -> Self {
        self.prefer_32bit = prefer_32bit;
        self
    }

    #[must_use]
    pub fn with_page_count(mut self, page_count: u32) -> Self {
        self.page_count = page_count.max(1);
        self
    }

    #[must_use]
    pub fn with_fingerprint_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.fingerprint_overrides = overrides;
        self
    }

    pub fn installed_version(&self, app: &AppDescriptor) -> Option<String> {
        self.installed.installed_version(app)
    }

    pub fn architecture_order(&self, app: &AppDescriptor) -> Result<Vec<Abi>, UpdateError> {
        architecture_order(app, &self.device_abis, self.prefer_32bit)
    }

    fn expected_fingerprint<'a>(&'a self, app: &'a AppDescriptor) -> Option<&'a str> {
        self.fingerprint_overrides
            .get(app.id)
            .map(String::as_str)
            .or(app.signing_fingerprint)
            .filter(|fingerprint| !fingerprint.trim().is_empty())
    }

    /// Compare the newest usable release of `app` with the installed version.
    ///
    /// An app that is not installed always has an update available.
    pub async fn check_for_update(
        &self,
        app: &AppDescriptor,
        cache_mode: CacheMode,
    ) -> Result<UpdateStatus, UpdateError> {
        let matcher = AssetMatcher::for_app(app, &self.device_abis, self.prefer_32bit)?;
        let selected = find_release(
            self.source.as_ref(),
            &app.repository,
            self.page_count,
            cache_mode,
            &matcher,
        )
        .await?;

        let latest_version = normalize_tag(&selected.release.tag, app.tag_pattern)?;
        let installed_version = self.installed.installed_version(app);
        let is_update_available = match &installed_version {
            Some(installed) => is_newer(&selected.release.tag, installed, app.tag_pattern)?,
            None => true,
        };

        debug!(
            "{}: installed {}, latest {latest_version} ({})",
            app.id,
            installed_version.as_deref().unwrap_or("none"),
            selected.abi
        );

        Ok(UpdateStatus {
            app_id: app.id.to_string(),
            installed_version,
            latest_version,
            is_update_available,
            publish_date: selected.release.published_at,
            abi: selected.abi,
            asset: selected.asset,
        })
    }

    fn request_for(app: &AppDescriptor, status: &UpdateStatus) -> DownloadRequest {
        DownloadRequest {
            app_id: app.id.to_string(),
            version: status.latest_version.clone(),
            url: status.asset.download_url.clone(),
            expected_size: status.asset.size,
            format: app.format,
        }
    }

    pub fn is_cached(&self, app: &AppDescriptor, status: &UpdateStatus) -> bool {
        self.downloads
            .cached_artifact(&Self::request_for(app, status))
            .is_some()
    }

    pub fn clear_cache(&self, app: &AppDescriptor) -> Result<(), UpdateError> {
        self.downloads.remove_cached(app.id)
    }

    /// Download the package `status` points at and check who signed it.
    ///
    /// A package signed by anyone else is deleted and reported as
    /// [`UpdateError::SignatureMismatch`]. Without a known signer nothing is
    /// downloaded.
    pub async fn acquire_update(
        &self,
        app: &AppDescriptor,
        status: &UpdateStatus,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, UpdateError> {
        let Some(expected) = self.expected_fingerprint(app) else {
            return Err(UpdateError::InvalidConfiguration {
                app: app.id.to_string(),
                details: "no signing fingerprint; set one under signing_fingerprints".to_string(),
            });
        };

        let mut handle = self
            .downloads
            .download(Self::request_for(app, status), cancel.clone());

        let mut logged_decile = None;
        while let Some(progress) = handle.next().await {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let decile = progress.percent().map(|percent| (percent / 10.0) as u8);
            if decile.is_some() && decile != logged_decile {
                logged_decile = decile;
                debug!(
                    "{}: {} of {} bytes",
                    app.id,
                    progress.downloaded,
                    status.asset.size
                );
            }
        }
        let path = handle.finish().await?;

        let inspector = Arc::clone(&self.inspector);
        let package = path.clone();
        let fingerprint = tokio::task::spawn_blocking(move || {
            inspector.signing_fingerprint(&package)
        })
        .await
        .unwrap_or_else(|error| {
            Err(UpdateError::Internal {
                details: format!("signature check failed to run: {error}"),
            })
        });

        let verdict = match fingerprint {
            Ok(Some(actual)) if actual.eq_ignore_ascii_case(expected) => Ok(path),
            Ok(actual) => Err(UpdateError::SignatureMismatch {
                app: app.id.to_string(),
                expected: expected.to_string(),
                actual: actual.unwrap_or_else(|| "unsigned".to_string()),
            }),
            Err(error) => Err(error),
        };

        if verdict.is_err()
            && let Err(error) = self.clear_cache(app)
        {
            warn!("Could not discard rejected package of {}: {error}", app.id);
        }
        if verdict.is_ok() {
            info!("{} {} verified", app.id, status.latest_version);
        }
        verdict
    }
}
