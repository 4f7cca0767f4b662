use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use upkeep_api::{NetworkState, SystemConditions, SystemProbe};

const DEFAULT_REACHABILITY_HOST: &str = "api.github.com:443";
const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const POWER_SUPPLY_DIR: &str = "/sys/class/power_supply";
const LOW_BATTERY_PERCENT: u8 = 15;

/// System conditions of the machine the updater runs on.
///
/// Reachability is a DNS lookup of the release API host. Meteredness cannot be
/// detected and comes from configuration. Headless hosts are always idle.
#[derive(Debug, Clone)]
pub struct HostProbe {
    reachability_host: String,
    lookup_timeout: Duration,
    metered: bool,
    storage_path: PathBuf,
    power_supply_dir: PathBuf,
}

impl HostProbe {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            reachability_host: DEFAULT_REACHABILITY_HOST.to_string(),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            metered: false,
            storage_path: storage_path.into(),
            power_supply_dir: PathBuf::from(POWER_SUPPLY_DIR),
        }
    }

    #[must_use]
    pub fn with_reachability_host(mut self, host: impl Into<String>) -> Self {
        self.reachability_host = host.into();
        self
    }

    #[must_use]
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_metered(mut self, metered: bool) -> Self {
        self.metered = metered;
        self
    }

    #[must_use]
    pub fn with_power_supply_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.power_supply_dir = dir.into();
        self
    }

    async fn network_state(&self) -> NetworkState {
        let lookup = tokio::net::lookup_host(self.reachability_host.as_str());
        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(mut addresses)) => match addresses.next() {
                None => NetworkState::Unavailable,
                Some(_) if self.metered => NetworkState::Metered,
                Some(_) => NetworkState::Unmetered,
            },
            Ok(Err(error)) => {
                debug!("Reachability lookup failed: {error}");
                NetworkState::Unavailable
            }
            Err(_) => {
                debug!("Reachability lookup timed out");
                NetworkState::Unavailable
            }
        }
    }
}

#[async_trait]
impl SystemProbe for HostProbe {
    async fn conditions(&self) -> SystemConditions {
        let network = self.network_state().await;
        let power_dir = self.power_supply_dir.clone();
        let storage_path = self.storage_path.clone();

        let local = tokio::task::spawn_blocking(move || {
            (battery_low(&power_dir), free_bytes(&storage_path))
        })
        .await;
        let (battery_low, free_bytes) = local.unwrap_or_else(|error| {
            warn!("Local condition probe failed: {error}");
            (false, u64::MAX)
        });

        SystemConditions {
            network,
            battery_low,
            idle: true,
            free_bytes,
        }
    }
}

fn battery_low(power_supply_dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(power_supply_dir) else {
        return false;
    };

    entries.filter_map(Result::ok).any(|entry| {
        let supply = entry.path();
        let read = |name: &str| std::fs::read_to_string(supply.join(name)).unwrap_or_default();
        read("type").trim() == "Battery"
            && is_low(read("capacity").trim(), read("status").trim())
    })
}

fn is_low(capacity: &str, status: &str) -> bool {
    let charging = matches!(status, "Charging" | "Full");
    capacity
        .parse::<u8>()
        .is_ok_and(|percent| percent <= LOW_BATTERY_PERCENT && !charging)
}

/// Free space of the file system holding `path`, measured at its nearest
/// existing ancestor. Unknown space is reported as unlimited.
fn free_bytes(path: &Path) -> u64 {
    let Some(existing) = path.ancestors().find(|candidate| candidate.exists()) else {
        return u64::MAX;
    };
    fs2::available_space(existing).unwrap_or_else(|error| {
        warn!("Could not read free space of {}: {error}", existing.display());
        u64::MAX
    })
}
