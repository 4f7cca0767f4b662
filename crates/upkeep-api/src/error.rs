use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::VersionParseError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("Network error during {operation} ({stage}): {details}")]
    NetworkFailure {
        operation: &'static str,
        stage: NetworkStage,
        details: String,
    },

    #[error("Release API rate limit exceeded, resets at {reset_at}")]
    RateLimitExceeded { reset_at: DateTime<Utc> },

    #[error("Releases of {repo} are unavailable (HTTP {status})")]
    ReleaseUnavailable { repo: String, status: u16 },

    #[error("No supported architecture for {app} (device reports: {device})")]
    UnsupportedArchitecture { app: String, device: String },

    #[error("No release of {app} carries an asset for {abis}")]
    NoMatchingAsset { app: String, abis: String },

    #[error("Invalid configuration for {app}: {details}")]
    InvalidConfiguration { app: String, details: String },

    #[error(transparent)]
    VersionParse(#[from] VersionParseError),

    #[error("Signing fingerprint mismatch for {app}: expected {expected}, got {actual}")]
    SignatureMismatch {
        app: String,
        expected: String,
        actual: String,
    },

    #[error("Downloaded size mismatch for {file}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("{file} is not a valid {format} archive: {details}")]
    CorruptArchive {
        file: String,
        format: &'static str,
        details: String,
    },

    #[error("A download of {app} is already running")]
    DownloadInProgress { app: String },

    #[error("Installation failed with code {code}: {message}")]
    InstallationFailed { code: i32, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal failure: {details}")]
    Internal { details: String },

    #[error("IO error ({kind}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStage {
    #[error("request")]
    Request,
    #[error("response parse")]
    ResponseParse,
}

impl UpdateError {
    pub fn network_request(operation: &'static str, details: impl Into<String>) -> Self {
        Self::NetworkFailure {
            operation,
            stage: NetworkStage::Request,
            details: details.into(),
        }
    }

    pub fn network_request_from<E>(operation: &'static str, error: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::network_request(operation, error.to_string())
    }

    pub fn network_parse_from<E>(operation: &'static str, error: E) -> Self
    where
        E: std::fmt::Display,
    {
        Self::NetworkFailure {
            operation,
            stage: NetworkStage::ResponseParse,
            details: error.to_string(),
        }
    }

    pub fn io_with_path(context: &str, path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            message: format!("{context} {}: {error}", path.display()),
        }
    }

    /// Whether a later attempt may succeed without any configuration change.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailure { .. }
                | Self::RateLimitExceeded { .. }
                | Self::SizeMismatch { .. }
                | Self::CorruptArchive { .. }
                | Self::DownloadInProgress { .. }
                | Self::Cancelled
                | Self::Internal { .. }
                | Self::Io { .. }
        )
    }

    /// Errors that end the whole run instead of being isolated to one app.
    #[must_use]
    pub fn is_run_level(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailure { .. } | Self::RateLimitExceeded { .. } | Self::Cancelled
        )
    }
}

impl From<std::io::Error> for UpdateError {
    fn from(err: std::io::Error) -> Self {
        UpdateError::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{NetworkStage, UpdateError};
    use crate::types::VersionParseError;

    #[test]
    fn io_error_conversion_maps_to_io_variant() {
        let mapped = UpdateError::from(std::io::Error::other("disk full"));
        assert!(matches!(
            mapped,
            UpdateError::Io { kind, ref message }
                if kind == std::io::ErrorKind::Other && message.contains("disk full")
        ));
    }

    #[test]
    fn network_helpers_set_expected_stage() {
        let request = UpdateError::network_request("fetch releases", "timed out");
        assert!(matches!(
            request,
            UpdateError::NetworkFailure {
                operation: "fetch releases",
                stage: NetworkStage::Request,
                ..
            }
        ));

        let parse = UpdateError::network_parse_from("fetch releases", "invalid json");
        assert!(matches!(
            parse,
            UpdateError::NetworkFailure {
                stage: NetworkStage::ResponseParse,
                ..
            }
        ));
    }

    #[test]
    fn configuration_errors_are_not_retryable() {
        let errors = [
            UpdateError::UnsupportedArchitecture {
                app: "bromite".to_string(),
                device: "x86".to_string(),
            },
            UpdateError::VersionParse(VersionParseError::Empty),
            UpdateError::SignatureMismatch {
                app: "bromite".to_string(),
                expected: "aa".to_string(),
                actual: "bb".to_string(),
            },
            UpdateError::InstallationFailed {
                code: 3,
                message: "conflict".to_string(),
            },
            UpdateError::ReleaseUnavailable {
                repo: "bromite/bromite".to_string(),
                status: 404,
            },
        ];
        for error in errors {
            assert!(!error.is_retryable(), "{error} should not be retryable");
            assert!(!error.is_run_level());
        }
    }

    #[test]
    fn integrity_errors_are_retryable_but_isolated() {
        let error = UpdateError::SizeMismatch {
            file: "a.apk".to_string(),
            expected: 10,
            actual: 9,
        };
        assert!(error.is_retryable());
        assert!(!error.is_run_level());
    }

    #[test]
    fn rate_limit_ends_the_run() {
        let error = UpdateError::RateLimitExceeded {
            reset_at: chrono::DateTime::UNIX_EPOCH,
        };
        assert!(error.is_retryable());
        assert!(error.is_run_level());
        assert!(error.to_string().contains("rate limit"));
    }
}
