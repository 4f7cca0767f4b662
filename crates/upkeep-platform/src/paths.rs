use std::path::{Path, PathBuf};
use thiserror::Error;

const APP_DIR: &str = "upkeep";
const HOME_OVERRIDE_VAR: &str = "UPKEEP_HOME";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AppPathsError {
    #[error("Could not determine {0} directory")]
    Unavailable(&'static str),
}

/// Where the updater keeps its settings, run state and downloaded packages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub data_dir: PathBuf,
}

#[cfg_attr(target_os = "macos", allow(dead_code))]
fn base(dir: Option<PathBuf>, label: &'static str) -> Result<PathBuf, AppPathsError> {
    dir.map(|dir| dir.join(APP_DIR))
        .ok_or(AppPathsError::Unavailable(label))
}

impl AppPaths {
    /// Platform directories, or everything under `UPKEEP_HOME` when it is set.
    ///
    /// # Errors
    /// Returns an error when the platform reports no base directory.
    pub fn new() -> Result<Self, AppPathsError> {
        match std::env::var_os(HOME_OVERRIDE_VAR) {
            Some(root) if !root.is_empty() => Ok(Self::under(root)),
            _ => Self::platform(),
        }
    }

    #[cfg(target_os = "macos")]
    fn platform() -> Result<Self, AppPathsError> {
        let library = dirs::home_dir()
            .map(|home| home.join("Library"))
            .ok_or(AppPathsError::Unavailable("home"))?;
        let support = library.join("Application Support").join(APP_DIR);
        Ok(Self {
            config_dir: support.clone(),
            cache_dir: library.join("Caches").join(APP_DIR),
            data_dir: support,
        })
    }

    #[cfg(not(target_os = "macos"))]
    fn platform() -> Result<Self, AppPathsError> {
        Ok(Self {
            config_dir: base(dirs::config_dir(), "config")?,
            cache_dir: base(dirs::cache_dir(), "cache")?,
            data_dir: base(dirs::data_dir(), "data")?,
        })
    }

    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            cache_dir: root.join("cache"),
            data_dir: root.join("data"),
        }
    }

    #[must_use]
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    #[must_use]
    pub fn installed_file(&self) -> PathBuf {
        self.data_dir.join("installed.json")
    }

    #[must_use]
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join("debug.log")
    }

    /// # Errors
    /// Returns the first directory creation failure.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        [
            self.config_dir.clone(),
            self.downloads_dir(),
            self.data_dir.clone(),
        ]
        .iter()
        .try_for_each(std::fs::create_dir_all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_live_in_their_directories() {
        let paths = AppPaths::under("/srv/upkeep");

        assert_eq!(paths.settings_file(), Path::new("/srv/upkeep/config/settings.json"));
        assert_eq!(paths.state_file(), Path::new("/srv/upkeep/data/state.json"));
        assert_eq!(
            paths.installed_file(),
            Path::new("/srv/upkeep/data/installed.json")
        );
        assert_eq!(paths.downloads_dir(), Path::new("/srv/upkeep/cache/downloads"));
        assert_eq!(paths.log_file(), Path::new("/srv/upkeep/data/debug.log"));
    }

    #[test]
    fn missing_base_dir_names_it() {
        assert_eq!(
            base(None, "cache"),
            Err(AppPathsError::Unavailable("cache"))
        );
        assert_eq!(
            base(Some(PathBuf::from("/var/cache")), "cache"),
            Ok(PathBuf::from("/var/cache/upkeep"))
        );
    }

    #[test]
    fn ensure_dirs_creates_the_tree() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = AppPaths::under(temp.path().join("root"));

        paths.ensure_dirs().expect("directories should be created");

        assert!(paths.config_dir.is_dir());
        assert!(paths.downloads_dir().is_dir());
        assert!(paths.data_dir.is_dir());
    }
}
