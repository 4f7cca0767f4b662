use regex::Regex;
use upkeep_api::{Abi, AppDescriptor, Asset, ReleaseInfo, UpdateError};

/// The release asset chosen for a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedAsset {
    pub release: ReleaseInfo,
    pub abi: Abi,
    pub asset: Asset,
}

/// Order in which the app's architectures are tried on this device.
///
/// 64-bit architectures come before 32-bit ones; the relative order the
/// device reports is otherwise kept. `prefer_32bit` reverses the result.
///
/// # Errors
/// Returns [`UpdateError::UnsupportedArchitecture`] when the device supports
/// none of the app's architectures.
pub fn architecture_order(
    app: &AppDescriptor,
    device_abis: &[Abi],
    prefer_32bit: bool,
) -> Result<Vec<Abi>, UpdateError> {
    let mut order: Vec<Abi> = Vec::with_capacity(device_abis.len());
    for abi in device_abis {
        if app.asset_pattern(*abi).is_some() && !order.contains(abi) {
            order.push(*abi);
        }
    }

    if order.is_empty() {
        return Err(UpdateError::UnsupportedArchitecture {
            app: app.id.to_string(),
            device: join_abis(device_abis),
        });
    }

    order.sort_by_key(|abi| !abi.is_64_bit());
    if prefer_32bit {
        order.reverse();
    }
    Ok(order)
}

/// Compiled asset-name patterns for one app, in architecture preference order.
#[derive(Debug, Clone)]
pub struct AssetMatcher {
    app_id: &'static str,
    rules: Vec<(Abi, Regex)>,
}

impl AssetMatcher {
    /// Build the matcher for `app` on a device reporting `device_abis`.
    ///
    /// # Errors
    /// Returns an error when no architecture is supported or an asset pattern
    /// is not a valid regex.
    pub fn for_app(
        app: &AppDescriptor,
        device_abis: &[Abi],
        prefer_32bit: bool,
    ) -> Result<Self, UpdateError> {
        let rules = architecture_order(app, device_abis, prefer_32bit)?
            .into_iter()
            .filter_map(|abi| app.asset_pattern(abi).map(|pattern| (abi, pattern)))
            .map(|(abi, pattern)| {
                Regex::new(pattern)
                    .map(|regex| (abi, regex))
                    .map_err(|error| UpdateError::InvalidConfiguration {
                        app: app.id.to_string(),
                        details: format!("asset pattern '{pattern}': {error}"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            app_id: app.id,
            rules,
        })
    }

    #[must_use]
    pub fn architectures(&self) -> Vec<Abi> {
        self.rules.iter().map(|(abi, _)| *abi).collect()
    }

    /// Best asset of one release, ignoring its pre-release flag.
    #[must_use]
    pub fn best_in<'a>(&self, release: &'a ReleaseInfo) -> Option<(Abi, &'a Asset)> {
        self.rules.iter().find_map(|(abi, regex)| {
            release
                .assets
                .iter()
                .find(|asset| regex.is_match(&asset.name))
                .map(|asset| (*abi, asset))
        })
    }

    fn no_match(&self) -> UpdateError {
        UpdateError::NoMatchingAsset {
            app: self.app_id.to_string(),
            abis: join_abis(&self.architectures()),
        }
    }
}

/// Pick the newest non-pre-release release carrying a matching asset.
///
/// `releases` must be ordered most recent first. Within a release the first
/// architecture in the matcher's order wins.
///
/// # Errors
/// Returns [`UpdateError::NoMatchingAsset`] when no release qualifies.
pub fn select_asset(
    releases: &[ReleaseInfo],
    matcher: &AssetMatcher,
) -> Result<SelectedAsset, UpdateError> {
    releases
        .iter()
        .filter(|release| !release.prerelease)
        .find_map(|release| {
            matcher.best_in(release).map(|(abi, asset)| SelectedAsset {
                release: release.clone(),
                abi,
                asset: asset.clone(),
            })
        })
        .ok_or_else(|| matcher.no_match())
}

fn join_abis(abis: &[Abi]) -> String {
    if abis.is_empty() {
        return "none".to_string();
    }
    abis.iter()
        .map(|abi| abi.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
