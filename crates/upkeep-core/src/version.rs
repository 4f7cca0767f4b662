use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use semver::Prerelease;
use upkeep_api::VersionParseError;

/// Dot-separated numeric version with an optional pre-release suffix.
///
/// Segments compare numerically and missing trailing segments count as zero,
/// so `1.2` and `1.2.0` are equal. A version with a suffix (`1.2.0-beta.1`)
/// sorts below the same version without one.
#[derive(Debug, Clone)]
pub struct ReleaseVersion {
    segments: Vec<u64>,
    pre: Prerelease,
}

impl FromStr for ReleaseVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(VersionParseError::Empty);
        }

        // Build metadata never takes part in precedence.
        let without_build = trimmed.split_once('+').map_or(trimmed, |(core, _)| core);
        let (core, suffix) = without_build
            .split_once('-')
            .unwrap_or((without_build, ""));

        let segments = core
            .split('.')
            .map(|segment| {
                segment
                    .parse::<u64>()
                    .map_err(|_| VersionParseError::InvalidSegment {
                        input: s.to_string(),
                        segment: segment.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let pre = Prerelease::new(suffix).map_err(|_| VersionParseError::InvalidSegment {
            input: s.to_string(),
            segment: suffix.to_string(),
        })?;

        Ok(Self { segments, pre })
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        for index in 0..len {
            let ours = self.segments.get(index).copied().unwrap_or(0);
            let theirs = other.segments.get(index).copied().unwrap_or(0);
            match ours.cmp(&theirs) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }

        match (self.pre.is_empty(), other.pre.is_empty()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.pre.cmp(&other.pre),
        }
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ReleaseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ReleaseVersion {}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, segment) in self.segments.iter().enumerate() {
            if index > 0 {
                f.write_str(".")?;
            }
            write!(f, "{segment}")?;
        }
        if !self.pre.is_empty() {
            write!(f, "-{}", self.pre)?;
        }
        Ok(())
    }
}

/// Extract the version from a release tag using the app's tag pattern.
///
/// The first capture group is the version; a pattern without groups uses the
/// whole match.
///
/// # Errors
/// Returns an error when the pattern is invalid or the tag does not match it.
pub fn normalize_tag(tag: &str, pattern: &str) -> Result<String, VersionParseError> {
    let regex = Regex::new(pattern).map_err(|error| VersionParseError::InvalidPattern {
        pattern: pattern.to_string(),
        details: error.to_string(),
    })?;

    let captures = regex
        .captures(tag.trim())
        .ok_or_else(|| VersionParseError::TagMismatch {
            tag: tag.to_string(),
            pattern: pattern.to_string(),
        })?;

    let version = captures
        .get(1)
        .or_else(|| captures.get(0))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default();

    if version.is_empty() {
        return Err(VersionParseError::Empty);
    }
    Ok(version)
}

/// Whether `remote_tag` names a newer version than `installed_version`.
///
/// # Errors
/// Returns an error when either side cannot be parsed; a malformed tag is
/// never reported as "no update".
pub fn is_newer(
    remote_tag: &str,
    installed_version: &str,
    tag_pattern: &str,
) -> Result<bool, VersionParseError> {
    let remote: ReleaseVersion = normalize_tag(remote_tag, tag_pattern)?.parse()?;
    let installed: ReleaseVersion = installed_version.parse()?;
    Ok(remote > installed)
}
