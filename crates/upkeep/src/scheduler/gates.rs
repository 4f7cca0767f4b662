use std::fmt;

use upkeep_api::{NetworkState, SystemConditions};

use crate::settings::AppSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    Disabled,
    NoNetwork,
    MeteredNetwork,
    BatteryLow,
    NotIdle,
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Disabled => "disabled in settings",
            Self::NoNetwork => "no network",
            Self::MeteredNetwork => "metered network",
            Self::BatteryLow => "battery low",
            Self::NotIdle => "device in use",
        };
        f.write_str(text)
    }
}

/// Whether a run phase may go ahead.
///
/// `Retry` ends the run as transient, `Skip` ends it successfully with the
/// work done so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Retry(GateReason),
    Skip(GateReason),
}

pub fn update_check(settings: &AppSettings, conditions: &SystemConditions) -> GateDecision {
    if !settings.background_check {
        return GateDecision::Skip(GateReason::Disabled);
    }
    match conditions.network {
        NetworkState::Unavailable => GateDecision::Retry(GateReason::NoNetwork),
        NetworkState::Metered if !settings.allow_metered_check => {
            GateDecision::Retry(GateReason::MeteredNetwork)
        }
        NetworkState::Metered | NetworkState::Unmetered => GateDecision::Proceed,
    }
}

pub fn download(settings: &AppSettings, conditions: &SystemConditions) -> GateDecision {
    if !settings.background_download {
        return GateDecision::Skip(GateReason::Disabled);
    }
    if conditions.network == NetworkState::Metered && !settings.allow_metered_download {
        return GateDecision::Skip(GateReason::MeteredNetwork);
    }
    if conditions.battery_low {
        return GateDecision::Skip(GateReason::BatteryLow);
    }
    GateDecision::Proceed
}

pub fn install(settings: &AppSettings, conditions: &SystemConditions) -> GateDecision {
    if !settings.background_install {
        return GateDecision::Skip(GateReason::Disabled);
    }
    if !conditions.idle {
        return GateDecision::Skip(GateReason::NotIdle);
    }
    if conditions.battery_low {
        return GateDecision::Skip(GateReason::BatteryLow);
    }
    GateDecision::Proceed
}

/// Whether an asset of `size` bytes fits while keeping `reserve` bytes free.
pub fn has_room(free_bytes: u64, reserve: u64, size: u64) -> bool {
    free_bytes.saturating_sub(reserve) >= size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conditions(network: NetworkState) -> SystemConditions {
        SystemConditions {
            network,
            battery_low: false,
            idle: true,
            free_bytes: u64::MAX,
        }
    }

    #[test]
    fn check_needs_network() {
        let settings = AppSettings::default();
        assert_eq!(
            update_check(&settings, &conditions(NetworkState::Unavailable)),
            GateDecision::Retry(GateReason::NoNetwork)
        );
        assert_eq!(
            update_check(&settings, &conditions(NetworkState::Metered)),
            GateDecision::Proceed
        );
    }

    #[test]
    fn metered_check_retries_when_not_allowed() {
        let settings = AppSettings {
            allow_metered_check: false,
            ..AppSettings::default()
        };
        assert_eq!(
            update_check(&settings, &conditions(NetworkState::Metered)),
            GateDecision::Retry(GateReason::MeteredNetwork)
        );
    }

    #[test]
    fn disabled_check_skips_even_offline() {
        let settings = AppSettings {
            background_check: false,
            ..AppSettings::default()
        };
        assert_eq!(
            update_check(&settings, &conditions(NetworkState::Unavailable)),
            GateDecision::Skip(GateReason::Disabled)
        );
    }

    #[test]
    fn download_skips_metered_and_low_battery() {
        let settings = AppSettings::default();
        assert_eq!(
            download(&settings, &conditions(NetworkState::Metered)),
            GateDecision::Skip(GateReason::MeteredNetwork)
        );

        let low = SystemConditions {
            battery_low: true,
            ..conditions(NetworkState::Unmetered)
        };
        assert_eq!(
            download(&settings, &low),
            GateDecision::Skip(GateReason::BatteryLow)
        );
        assert_eq!(
            download(&settings, &conditions(NetworkState::Unmetered)),
            GateDecision::Proceed
        );
    }

    #[test]
    fn install_waits_for_idle_device() {
        let settings = AppSettings::default();
        let busy = SystemConditions {
            idle: false,
            ..conditions(NetworkState::Unmetered)
        };
        assert_eq!(
            install(&settings, &busy),
            GateDecision::Skip(GateReason::NotIdle)
        );

        let disabled = AppSettings {
            background_install: false,
            ..AppSettings::default()
        };
        assert_eq!(
            install(&disabled, &conditions(NetworkState::Unmetered)),
            GateDecision::Skip(GateReason::Disabled)
        );
    }

    #[test]
    fn room_accounts_for_reserve() {
        assert!(has_room(1000, 100, 900));
        assert!(!has_room(1000, 100, 901));
        assert!(!has_room(50, 100, 1));
    }
}
