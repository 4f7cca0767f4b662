//! Tracked applications.
//!
//! Each row is data: where releases live, which asset name serves which
//! architecture and how a tag spells its version. Signer fingerprints are
//! only listed once checked against a real release; the others come from
//! `signing_fingerprints` in the settings.

use upkeep_api::{Abi, AppDescriptor, ArtifactFormat, AssetRule, RepoCoordinates};

const PLAIN_VERSION_TAG: &str = r"^v?(\d+(?:\.\d+)*)$";

const BROMITE_ASSETS: &[AssetRule] = &[
    AssetRule {
        abi: Abi::Arm64V8a,
        pattern: r"^arm64_ChromePublic\.apk$",
    },
    AssetRule {
        abi: Abi::ArmeabiV7a,
        pattern: r"^arm_ChromePublic\.apk$",
    },
    AssetRule {
        abi: Abi::X86,
        pattern: r"^x86_ChromePublic\.apk$",
    },
];

const BROMITE_WEBVIEW_ASSETS: &[AssetRule] = &[
    AssetRule {
        abi: Abi::Arm64V8a,
        pattern: r"^arm64_SystemWebView\.apk$",
    },
    AssetRule {
        abi: Abi::ArmeabiV7a,
        pattern: r"^arm_SystemWebView\.apk$",
    },
    AssetRule {
        abi: Abi::X86,
        pattern: r"^x86_SystemWebView\.apk$",
    },
];

const ICERAVEN_ASSETS: &[AssetRule] = &[
    AssetRule {
        abi: Abi::Arm64V8a,
        pattern: r"^iceraven-.*-browser-arm64-v8a-forkRelease\.apk$",
    },
    AssetRule {
        abi: Abi::ArmeabiV7a,
        pattern: r"^iceraven-.*-browser-armeabi-v7a-forkRelease\.apk$",
    },
    AssetRule {
        abi: Abi::X86_64,
        pattern: r"^iceraven-.*-browser-x86_64-forkRelease\.apk$",
    },
    AssetRule {
        abi: Abi::X86,
        pattern: r"^iceraven-.*-browser-x86-forkRelease\.apk$",
    },
];

const CROMITE_ASSETS: &[AssetRule] = &[
    AssetRule {
        abi: Abi::Arm64V8a,
        pattern: r"^arm64_ChromePublic\.apk$",
    },
    AssetRule {
        abi: Abi::ArmeabiV7a,
        pattern: r"^arm_ChromePublic\.apk$",
    },
    AssetRule {
        abi: Abi::X86_64,
        pattern: r"^x64_ChromePublic\.apk$",
    },
];

const UPDATER_ASSETS: &[AssetRule] = &[
    AssetRule {
        abi: Abi::Arm64V8a,
        pattern: r"^ffupdater-release\.apk$",
    },
    AssetRule {
        abi: Abi::ArmeabiV7a,
        pattern: r"^ffupdater-release\.apk$",
    },
    AssetRule {
        abi: Abi::X86_64,
        pattern: r"^ffupdater-release\.apk$",
    },
    AssetRule {
        abi: Abi::X86,
        pattern: r"^ffupdater-release\.apk$",
    },
];

pub const CATALOG: &[AppDescriptor] = &[
    AppDescriptor {
        id: "bromite",
        package: "org.bromite.bromite",
        display_name: "Bromite",
        repository: RepoCoordinates {
            owner: "bromite",
            name: "bromite",
        },
        assets: BROMITE_ASSETS,
        tag_pattern: PLAIN_VERSION_TAG,
        signing_fingerprint: None,
        format: ArtifactFormat::Apk,
        self_update: false,
    },
    AppDescriptor {
        id: "bromite-webview",
        package: "org.bromite.webview",
        display_name: "Bromite SystemWebView",
        repository: RepoCoordinates {
            owner: "bromite",
            name: "bromite",
        },
        assets: BROMITE_WEBVIEW_ASSETS,
        tag_pattern: PLAIN_VERSION_TAG,
        signing_fingerprint: None,
        format: ArtifactFormat::Apk,
        self_update: false,
    },
    AppDescriptor {
        id: "iceraven",
        package: "io.github.forkmaintainers.iceraven",
        display_name: "Iceraven",
        repository: RepoCoordinates {
            owner: "fork-maintainers",
            name: "iceraven-browser",
        },
        assets: ICERAVEN_ASSETS,
        tag_pattern: r"^iceraven-(\d+(?:\.\d+)*)$",
        signing_fingerprint: None,
        format: ArtifactFormat::Apk,
        self_update: false,
    },
    AppDescriptor {
        id: "cromite",
        package: "org.cromite.cromite",
        display_name: "Cromite",
        repository: RepoCoordinates {
            owner: "uazo",
            name: "cromite",
        },
        assets: CROMITE_ASSETS,
        tag_pattern: r"^v(\d+(?:\.\d+)*)-[0-9a-f]+$",
        signing_fingerprint: None,
        format: ArtifactFormat::Apk,
        self_update: false,
    },
    AppDescriptor {
        id: "ffupdater",
        package: "de.marmaro.krt.ffupdater",
        display_name: "FFUpdater",
        repository: RepoCoordinates {
            owner: "Tobi823",
            name: "ffupdater",
        },
        assets: UPDATER_ASSETS,
        tag_pattern: PLAIN_VERSION_TAG,
        signing_fingerprint: None,
        format: ArtifactFormat::Apk,
        self_update: true,
    },
];

#[must_use]
pub fn find(id: &str) -> Option<&'static AppDescriptor> {
    CATALOG.iter().find(|app| app.id == id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use regex::Regex;

    use super::*;

    #[test]
    fn ids_and_packages_are_unique() {
        let ids: HashSet<_> = CATALOG.iter().map(|app| app.id).collect();
        let packages: HashSet<_> = CATALOG.iter().map(|app| app.package).collect();
        assert_eq!(ids.len(), CATALOG.len());
        assert_eq!(packages.len(), CATALOG.len());
    }

    #[test]
    fn every_pattern_compiles() {
        for app in CATALOG {
            Regex::new(app.tag_pattern).expect("tag pattern should compile");
            for rule in app.assets {
                Regex::new(rule.pattern).expect("asset pattern should compile");
            }
        }
    }

    #[test]
    fn fingerprints_are_lowercase_sha256_hex() {
        for (id, fingerprint) in CATALOG
            .iter()
            .filter_map(|app| app.signing_fingerprint.map(|print| (app.id, print)))
        {
            assert_eq!(fingerprint.len(), 64, "{id}");
            assert!(
                fingerprint
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)),
                "{id}"
            );
        }
    }

    #[test]
    fn only_the_updater_updates_itself() {
        let own: Vec<_> = CATALOG
            .iter()
            .filter(|app| app.self_update)
            .map(|app| app.id)
            .collect();
        assert_eq!(own, ["ffupdater"]);
    }

    #[test]
    fn tag_patterns_extract_versions() {
        let cromite = find("cromite").expect("cromite is tracked");
        let iceraven = find("iceraven").expect("iceraven is tracked");
        let cromite_tag = "v120.0.6099.116-8b5c5e7d6a";
        assert_eq!(
            upkeep_core::normalize_tag(cromite_tag, cromite.tag_pattern).as_deref(),
            Ok("120.0.6099.116")
        );
        assert_eq!(
            upkeep_core::normalize_tag("iceraven-2.6.0", iceraven.tag_pattern).as_deref(),
            Ok("2.6.0")
        );
    }
}
