//! Collaborators backed by the machine the updater runs on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use tokio::process::Command;
use upkeep_api::{
    AppDescriptor, InstallOutcome, InstalledApps, Installer, Notifier, UpdateError, UpdateStatus,
};

use crate::error::StateError;
use crate::state::write_atomic;

const STDERR_SNIPPET_CHARS: usize = 400;

/// Installed versions by package name, persisted as JSON.
pub struct InstalledRegistry {
    path: PathBuf,
    versions: Mutex<HashMap<String, String>>,
}

impl InstalledRegistry {
    /// A missing file is an empty registry; an unreadable one is replaced on
    /// the next write.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let versions = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                warn!("Ignoring unreadable registry {}: {error}", path.display());
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            versions: Mutex::new(versions),
        }
    }

    pub fn record(&self, app: &AppDescriptor, version: &str) -> Result<(), StateError> {
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        versions.insert(app.package.to_string(), version.to_string());
        let data = serde_json::to_vec_pretty(&*versions)?;
        write_atomic(&self.path, &data)
            .map_err(|error| StateError::io_with_path("failed to write", &self.path, &error))
    }
}

impl InstalledApps for InstalledRegistry {
    fn installed_version(&self, app: &AppDescriptor) -> Option<String> {
        self.versions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app.package)
            .cloned()
    }
}

/// Installs packages by running a configured command.
pub struct CommandInstaller {
    template: Option<Vec<String>>,
    registry: Arc<InstalledRegistry>,
}

impl CommandInstaller {
    pub fn new(template: Option<Vec<String>>, registry: Arc<InstalledRegistry>) -> Self {
        Self {
            template: template.filter(|parts| !parts.is_empty()),
            registry,
        }
    }

    fn build_command(template: &[String], app: &AppDescriptor, file: &Path) -> Option<Command> {
        let file = file.to_string_lossy();
        let mut parts = template
            .iter()
            .map(|part| part.replace("{file}", &file).replace("{package}", app.package));
        let mut command = Command::new(parts.next()?);
        command.args(parts);
        Some(command)
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(&self, app: &AppDescriptor, file: &Path, version: &str) -> InstallOutcome {
        let Some(template) = &self.template else {
            debug!("No installer command configured");
            return InstallOutcome::NeedsUserInteraction;
        };
        let Some(mut command) = Self::build_command(template, app, file) else {
            return InstallOutcome::NeedsUserInteraction;
        };

        info!("Installing {} {version} from {}", app.id, file.display());
        let output = match command.output().await {
            Ok(output) => output,
            Err(error) => {
                error!("Installer command for {} did not start: {error}", app.id);
                return InstallOutcome::Failed {
                    code: -1,
                    message: error.to_string(),
                };
            }
        };

        debug!("Installer exit status: {:?}", output.status);
        trace!("Installer stdout: {}", String::from_utf8_lossy(&output.stdout));

        if output.status.success() {
            if let Err(error) = self.registry.record(app, version) {
                warn!("Installed {} but could not record it: {error}", app.id);
            }
            return InstallOutcome::Success;
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message: String = stderr.trim().chars().take(STDERR_SNIPPET_CHARS).collect();
        error!("Installer command for {} failed: {message}", app.id);
        InstallOutcome::Failed {
            code: output.status.code().unwrap_or(-1),
            message,
        }
    }
}

/// Reports through the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn update_available(&self, statuses: &[UpdateStatus]) {
        for status in statuses {
            info!(
                "Update available: {} {} -> {}",
                status.app_id,
                status.installed_version.as_deref().unwrap_or("none"),
                status.latest_version
            );
        }
    }

    fn app_failed(&self, app: &AppDescriptor, error: &UpdateError) {
        warn!("{} could not be updated: {error}", app.display_name);
    }

    fn retries_exhausted(&self, reason: &str) {
        error!("Background updates keep failing, giving up until the next check: {reason}");
    }

    fn installed(&self, app: &AppDescriptor, version: &str) {
        info!("{} updated to {version}", app.display_name);
    }

    fn needs_user_interaction(&self, app: &AppDescriptor, file: &Path) {
        info!(
            "{} is ready to install manually: {}",
            app.display_name,
            file.display()
        );
    }
}
