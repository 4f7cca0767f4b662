use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::StateError;

/// Scheduler state carried from one run to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    /// Consecutive runs that ended in a retry.
    #[serde(default)]
    pub attempt_count: u32,

    /// Retry ceiling of the current retry sequence, fixed when it starts.
    #[serde(default)]
    pub max_attempts: Option<u32>,

    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl RunState {
    /// Load persisted state; a missing or unreadable file starts fresh.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("Discarding unreadable run state {}: {error}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)
            .map_err(|error| StateError::io_with_path("failed to write", path, &error))
    }

    /// End the current retry sequence.
    pub fn reset_retries(&mut self) {
        self.attempt_count = 0;
        self.max_attempts = None;
    }
}

/// Replace `path` with `data` so readers see either the old or the new file.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;
    staged.persist(path).map(drop).map_err(|error| error.error)
}
