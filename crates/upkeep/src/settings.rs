use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use upkeep_api::Abi;
use upkeep_platform::AppPaths;

use crate::error::SettingsError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_true")]
    pub background_check: bool,

    #[serde(default = "default_true")]
    pub background_download: bool,

    #[serde(default = "default_true")]
    pub background_install: bool,

    #[serde(default = "default_true")]
    pub allow_metered_check: bool,

    #[serde(default)]
    pub allow_metered_download: bool,

    /// Treat the current network as metered; the host cannot detect it.
    #[serde(default)]
    pub network_metered: bool,

    #[serde(default)]
    pub prefer_32bit: bool,

    /// Overrides the architectures detected from the host CPU.
    #[serde(default)]
    pub device_abis: Vec<Abi>,

    #[serde(default)]
    pub excluded_apps: HashSet<String>,

    /// Expected signer fingerprints by app id. They take precedence over the
    /// catalog, and an app with neither is checked but never downloaded.
    #[serde(default)]
    pub signing_fingerprints: HashMap<String, String>,

    #[serde(default)]
    pub github_token: Option<String>,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_release_cache_ttl")]
    pub release_cache_ttl_secs: u64,

    #[serde(default = "default_release_page_count")]
    pub release_page_count: u32,

    #[serde(default = "default_storage_reserve")]
    pub storage_reserve_bytes: u64,

    #[serde(default = "default_retry_initial")]
    pub retry_initial_secs: u64,

    #[serde(default = "default_retry_min")]
    pub retry_min_secs: u64,

    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,

    #[serde(default = "default_retry_budget")]
    pub retry_budget_secs: u64,

    #[serde(default = "default_run_deadline")]
    pub run_deadline_secs: u64,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Command template run per install; `{file}` and `{package}` are substituted.
    #[serde(default)]
    pub installer_command: Option<Vec<String>>,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

fn default_true() -> bool {
    true
}

fn default_http_timeout() -> u64 {
    30
}

fn default_release_cache_ttl() -> u64 {
    10 * 60
}

fn default_release_page_count() -> u32 {
    3
}

fn default_storage_reserve() -> u64 {
    500 * 1024 * 1024
}

fn default_retry_initial() -> u64 {
    30
}

fn default_retry_min() -> u64 {
    10
}

fn default_retry_max() -> u64 {
    5 * 60 * 60
}

fn default_retry_budget() -> u64 {
    8 * 60 * 60
}

fn default_run_deadline() -> u64 {
    10 * 60
}

fn default_check_interval() -> u64 {
    6 * 60 * 60
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            background_check: true,
            background_download: true,
            background_install: true,
            allow_metered_check: true,
            allow_metered_download: false,
            network_metered: false,
            prefer_32bit: false,
            device_abis: Vec::new(),
            excluded_apps: HashSet::new(),
            signing_fingerprints: HashMap::new(),
            github_token: None,
            http_timeout_secs: default_http_timeout(),
            release_cache_ttl_secs: default_release_cache_ttl(),
            release_page_count: default_release_page_count(),
            storage_reserve_bytes: default_storage_reserve(),
            retry_initial_secs: default_retry_initial(),
            retry_min_secs: default_retry_min(),
            retry_max_secs: default_retry_max(),
            retry_budget_secs: default_retry_budget(),
            run_deadline_secs: default_run_deadline(),
            check_interval_secs: default_check_interval(),
            installer_command: None,
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl AppSettings {
    pub fn load(paths: &AppPaths) -> Self {
        Self::load_from_path(&paths.settings_file())
    }

    fn load_from_path(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("Ignoring unreadable settings {}: {error}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, paths: &AppPaths) -> Result<(), SettingsError> {
        paths
            .ensure_dirs()
            .map_err(|error| SettingsError::io("failed to create app directories", &error))?;

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.settings_file(), content)
            .map_err(|error| SettingsError::io("failed to write settings", &error))?;
        Ok(())
    }

    #[must_use]
    pub fn is_excluded(&self, app_id: &str) -> bool {
        self.excluded_apps.contains(app_id)
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    #[must_use]
    pub fn release_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.release_cache_ttl_secs)
    }

    #[must_use]
    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs(self.run_deadline_secs.max(1))
    }

    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(60))
    }
}
