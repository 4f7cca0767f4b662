use thiserror::Error;
use upkeep_platform::AppPathsError;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error ({kind}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("Settings serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl SettingsError {
    pub fn io(context: &str, error: &std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            message: format!("{context}: {error}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error ({kind}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    #[error("State serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl StateError {
    pub fn io_with_path(context: &str, path: &std::path::Path, error: &std::io::Error) -> Self {
        Self::Io {
            kind: error.kind(),
            message: format!("{context} {}: {error}", path.display()),
        }
    }
}

/// Failures that prevent a run from starting at all.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Paths(#[from] AppPathsError),

    #[error("Could not prepare {context}: {message}")]
    Io { context: &'static str, message: String },

    #[error("Could not build HTTP client: {0}")]
    HttpClient(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl StartupError {
    pub fn io(context: &'static str, error: &std::io::Error) -> Self {
        Self::Io {
            context,
            message: error.to_string(),
        }
    }
}
