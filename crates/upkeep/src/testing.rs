//! Hand-written fakes for the collaborator traits.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use upkeep_api::{
    Abi, AppDescriptor, ArtifactFormat, Asset, AssetRule, CacheMode, InstallOutcome,
    InstalledApps, Installer, NetworkState, Notifier, PackageInspector, ReleaseInfo,
    ReleaseSource, RepoCoordinates, SystemConditions, SystemProbe, UpdateError, UpdateStatus,
};

pub const FINGERPRINT: &str = "e1ee5cd076d7b0dc84cb2b45fb78b86df2eb39a3b6c56ba3dc292a5e0c3b9504";

pub const ARM64_BROWSER: &[AssetRule] = &[
    AssetRule {
        abi: Abi::Arm64V8a,
        pattern: r"^arm64_ChromePublic\.apk$",
    },
    AssetRule {
        abi: Abi::ArmeabiV7a,
        pattern: r"^arm_ChromePublic\.apk$",
    },
];

pub const ARM64_UPDATER: &[AssetRule] = &[AssetRule {
    abi: Abi::Arm64V8a,
    pattern: r"^updater\.apk$",
}];

pub const BROMITE: AppDescriptor = AppDescriptor {
    id: "bromite",
    package: "org.bromite.bromite",
    display_name: "Bromite",
    repository: RepoCoordinates {
        owner: "bromite",
        name: "bromite",
    },
    assets: ARM64_BROWSER,
    tag_pattern: r"^v?(\d+(?:\.\d+)*)$",
    signing_fingerprint: Some(FINGERPRINT),
    format: ArtifactFormat::Apk,
    self_update: false,
};

pub const UPDATER: AppDescriptor = AppDescriptor {
    id: "updater",
    package: "org.example.updater",
    display_name: "Updater",
    repository: RepoCoordinates {
        owner: "example",
        name: "updater",
    },
    assets: ARM64_UPDATER,
    tag_pattern: r"^v?(\d+(?:\.\d+)*)$",
    signing_fingerprint: Some(FINGERPRINT),
    format: ArtifactFormat::Apk,
    self_update: true,
};

/// A small archive shaped like a signed APK.
pub fn apk_bytes() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    writer
        .start_file("AndroidManifest.xml", options)
        .expect("entry starts");
    writer.write_all(b"<manifest/>").expect("entry is written");
    writer
        .start_file("META-INF/CERT.RSA", options)
        .expect("entry starts");
    writer.write_all(b"signature").expect("entry is written");
    writer
        .finish()
        .expect("zip archive should be finalized")
        .into_inner()
}

pub fn release(tag: &str, asset_name: &str, url: &str, size: u64) -> ReleaseInfo {
    ReleaseInfo {
        tag: tag.to_string(),
        prerelease: false,
        published_at: Utc.with_ymd_and_hms(2022, 3, 29, 21, 36, 18).unwrap(),
        assets: vec![Asset {
            name: asset_name.to_string(),
            download_url: url.to_string(),
            size,
        }],
    }
}

/// Serves one canned release per repository.
#[derive(Default)]
pub struct FakeSource {
    latest: Mutex<HashMap<String, Result<ReleaseInfo, UpdateError>>>,
    calls: AtomicUsize,
}

impl FakeSource {
    pub fn with(self, repo: &RepoCoordinates, result: Result<ReleaseInfo, UpdateError>) -> Self {
        self.latest
            .lock()
            .expect("fake source lock")
            .insert(repo.to_string(), result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lookup(&self, repo: &RepoCoordinates) -> Result<ReleaseInfo, UpdateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.latest
            .lock()
            .expect("fake source lock")
            .get(&repo.to_string())
            .cloned()
            .unwrap_or_else(|| Err(UpdateError::network_request("fake", "unknown repository")))
    }
}

#[async_trait]
impl ReleaseSource for FakeSource {
    async fn fetch_releases(
        &self,
        repo: &RepoCoordinates,
        _page_count: u32,
        _cache_mode: CacheMode,
    ) -> Result<Vec<ReleaseInfo>, UpdateError> {
        self.lookup(repo).map(|release| vec![release])
    }

    async fn fetch_latest(
        &self,
        repo: &RepoCoordinates,
        _cache_mode: CacheMode,
    ) -> Result<ReleaseInfo, UpdateError> {
        self.lookup(repo)
    }
}

#[derive(Default)]
pub struct FakeInstalled {
    versions: HashMap<&'static str, String>,
}

impl FakeInstalled {
    pub fn with(mut self, app: &AppDescriptor, version: &str) -> Self {
        self.versions.insert(app.package, version.to_string());
        self
    }
}

impl InstalledApps for FakeInstalled {
    fn installed_version(&self, app: &AppDescriptor) -> Option<String> {
        self.versions.get(app.package).cloned()
    }
}

pub struct FakeInspector {
    fingerprint: Option<String>,
}

impl FakeInspector {
    pub fn signed_by(fingerprint: &str) -> Self {
        Self {
            fingerprint: Some(fingerprint.to_string()),
        }
    }

    pub fn unsigned() -> Self {
        Self { fingerprint: None }
    }
}

impl PackageInspector for FakeInspector {
    fn signing_fingerprint(&self, _path: &Path) -> Result<Option<String>, UpdateError> {
        Ok(self.fingerprint.clone())
    }
}

pub struct FakeProbe {
    pub conditions: SystemConditions,
}

impl FakeProbe {
    pub fn unmetered() -> Self {
        Self {
            conditions: SystemConditions {
                network: NetworkState::Unmetered,
                battery_low: false,
                idle: true,
                free_bytes: u64::MAX,
            },
        }
    }
}

#[async_trait]
impl SystemProbe for FakeProbe {
    async fn conditions(&self) -> SystemConditions {
        self.conditions
    }
}

pub struct PanickingProbe;

#[async_trait]
impl SystemProbe for PanickingProbe {
    async fn conditions(&self) -> SystemConditions {
        panic!("probe exploded")
    }
}

/// Records install calls and answers with a fixed outcome per app.
#[derive(Default)]
pub struct FakeInstaller {
    outcomes: HashMap<&'static str, InstallOutcome>,
    pub installs: Mutex<Vec<(String, PathBuf)>>,
}

impl FakeInstaller {
    pub fn with(mut self, app: &AppDescriptor, outcome: InstallOutcome) -> Self {
        self.outcomes.insert(app.id, outcome);
        self
    }

    pub fn installed_ids(&self) -> Vec<String> {
        self.installs
            .lock()
            .expect("installer lock")
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(&self, app: &AppDescriptor, file: &Path, _version: &str) -> InstallOutcome {
        self.installs
            .lock()
            .expect("installer lock")
            .push((app.id.to_string(), file.to_path_buf()));
        self.outcomes
            .get(app.id)
            .cloned()
            .unwrap_or(InstallOutcome::Success)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn push(&self, event: String) {
        self.events.lock().expect("notifier lock").push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("notifier lock").clone()
    }
}

impl Notifier for RecordingNotifier {
    fn update_available(&self, statuses: &[UpdateStatus]) {
        for status in statuses {
            self.push(format!("available:{}", status.app_id));
        }
    }

    fn app_failed(&self, app: &AppDescriptor, _error: &UpdateError) {
        self.push(format!("failed:{}", app.id));
    }

    fn retries_exhausted(&self, _reason: &str) {
        self.push("exhausted".to_string());
    }

    fn installed(&self, app: &AppDescriptor, version: &str) {
        self.push(format!("installed:{}:{version}", app.id));
    }

    fn needs_user_interaction(&self, app: &AppDescriptor, _file: &Path) {
        self.push(format!("interaction:{}", app.id));
    }
}
