//! One background update run: gate, check, download, install.

mod backoff;
mod gates;

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use upkeep_api::{
    AppDescriptor, CacheMode, InstallOutcome, Installer, Notifier, SystemConditions, SystemProbe,
    UpdateError, UpdateStatus,
};

pub use backoff::BackoffPolicy;
pub use gates::{GateDecision, GateReason};

use crate::catalog::CATALOG;
use crate::coordinator::Coordinator;
use crate::settings::AppSettings;
use crate::state::RunState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Retry { after: Duration },
    /// The run could not start at all.
    PermanentFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Check,
    Download,
    Install,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Check => f.write_str("check"),
            Self::Download => f.write_str("download"),
            Self::Install => f.write_str("install"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppFailure {
    pub app_id: String,
    pub stage: Stage,
    pub error: UpdateError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub checked: Vec<String>,
    pub statuses: Vec<UpdateStatus>,
    pub downloaded: Vec<String>,
    pub installed: Vec<String>,
    pub skipped_for_storage: Vec<String>,
    pub failures: Vec<AppFailure>,
}

#[derive(Debug)]
pub struct RunResult {
    pub outcome: RunOutcome,
    pub state: RunState,
    pub report: RunReport,
}

/// How the stages ended, before retry accounting.
enum Flow {
    Completed,
    Skipped,
    Deferred(GateReason),
    Aborted(UpdateError),
}

type Pending = (&'static AppDescriptor, UpdateStatus);

pub struct Scheduler {
    coordinator: Coordinator,
    installer: Arc<dyn Installer>,
    probe: Arc<dyn SystemProbe>,
    notifier: Arc<dyn Notifier>,
    backoff: BackoffPolicy,
    settings: AppSettings,
    catalog: &'static [AppDescriptor],
}

impl Scheduler {
    pub fn new(
        coordinator: Coordinator,
        installer: Arc<dyn Installer>,
        probe: Arc<dyn SystemProbe>,
        notifier: Arc<dyn Notifier>,
        settings: AppSettings,
    ) -> Self {
        Self {
            coordinator,
            installer,
            probe,
            notifier,
            backoff: BackoffPolicy::from_settings(&settings),
            settings,
            catalog: CATALOG,
        }
    }

    #[must_use]
    pub fn with_catalog(mut self, catalog: &'static [AppDescriptor]) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Run every stage once and fold the result into `state`.
    ///
    /// Never fails: errors, panics included, end up in the report and the
    /// retry bookkeeping.
    pub async fn run_once(&self, mut state: RunState, cancel: &CancellationToken) -> RunResult {
        let mut report = RunReport::default();

        let flow = match AssertUnwindSafe(self.run_stages(&mut state, &mut report, cancel))
            .catch_unwind()
            .await
        {
            Ok(flow) => flow,
            Err(panic) => {
                let details = panic
                    .downcast_ref::<&str>()
                    .map(|message| (*message).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Update run panicked: {details}");
                Flow::Aborted(UpdateError::Internal { details })
            }
        };

        let outcome = self.conclude(&flow, &mut state, &report);
        RunResult {
            outcome,
            state,
            report,
        }
    }

    async fn run_stages(
        &self,
        state: &mut RunState,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) -> Flow {
        let conditions = self.probe.conditions().await;
        match gates::update_check(&self.settings, &conditions) {
            GateDecision::Proceed => {}
            GateDecision::Retry(reason) => {
                info!("Update check deferred: {reason}");
                return Flow::Deferred(reason);
            }
            GateDecision::Skip(reason) => {
                info!("Update check skipped: {reason}");
                return Flow::Skipped;
            }
        }

        let pending = match self.check_all(report, cancel).await {
            Ok(pending) => pending,
            Err(error) => return Flow::Aborted(error),
        };
        state.last_checked_at = Some(Utc::now());

        if pending.is_empty() {
            debug!("Everything is up to date");
            return Flow::Completed;
        }

        if let Some(flow) = self.gate(gates::download(&self.settings, &conditions), &pending) {
            return flow;
        }

        let fitting = self.filter_by_storage(pending, &conditions, report);
        let downloaded = match self.download_all(fitting, report, cancel).await {
            Ok(downloaded) => downloaded,
            Err(error) => return Flow::Aborted(error),
        };
        if downloaded.is_empty() {
            return Flow::Completed;
        }

        let conditions = self.probe.conditions().await;
        let ready: Vec<Pending> = downloaded
            .iter()
            .map(|(app, status, _)| (*app, status.clone()))
            .collect();
        if let Some(flow) = self.gate(gates::install(&self.settings, &conditions), &ready) {
            return flow;
        }

        self.install_all(downloaded, report, cancel).await
    }

    /// Turn a non-proceeding gate into the run's end, telling the user what
    /// is waiting.
    fn gate(&self, decision: GateDecision, pending: &[Pending]) -> Option<Flow> {
        let (flow, reason) = match decision {
            GateDecision::Proceed => return None,
            GateDecision::Retry(reason) => (Flow::Deferred(reason), reason),
            GateDecision::Skip(reason) => (Flow::Skipped, reason),
        };
        info!("Leaving {} update(s) pending: {reason}", pending.len());
        self.notify_available(pending);
        Some(flow)
    }

    fn notify_available(&self, pending: &[Pending]) {
        let statuses: Vec<UpdateStatus> =
            pending.iter().map(|(_, status)| status.clone()).collect();
        if !statuses.is_empty() {
            self.notifier.update_available(&statuses);
        }
    }

    async fn check_all(
        &self,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) -> Result<Vec<Pending>, UpdateError> {
        let mut pending = Vec::new();
        for app in self.catalog {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            if self.settings.is_excluded(app.id) {
                debug!("{} is excluded", app.id);
                continue;
            }
            if self.coordinator.installed_version(app).is_none() {
                debug!("{} is not installed", app.id);
                continue;
            }
            if let Err(error) = self.coordinator.architecture_order(app) {
                debug!("Skipping {}: {error}", app.id);
                continue;
            }

            match self
                .coordinator
                .check_for_update(app, CacheMode::UseCache)
                .await
            {
                Ok(status) => {
                    report.checked.push(app.id.to_string());
                    report.statuses.push(status.clone());
                    if status.is_update_available {
                        info!(
                            "{} {} is available (installed {})",
                            app.id,
                            status.latest_version,
                            status.installed_version.as_deref().unwrap_or("none")
                        );
                        pending.push((app, status));
                    }
                }
                Err(error) if error.is_run_level() => return Err(error),
                Err(error) => self.record_failure(report, app, Stage::Check, error),
            }
        }
        Ok(pending)
    }

    /// Keep the apps whose download fits the free space minus the reserve.
    /// Packages already in the cache need no room.
    fn filter_by_storage(
        &self,
        pending: Vec<Pending>,
        conditions: &SystemConditions,
        report: &mut RunReport,
    ) -> Vec<Pending> {
        let mut free = conditions.free_bytes;
        let mut fitting = Vec::with_capacity(pending.len());
        let mut skipped = Vec::new();

        for (app, status) in pending {
            if self.coordinator.is_cached(app, &status) {
                fitting.push((app, status));
            } else if gates::has_room(free, self.settings.storage_reserve_bytes, status.asset.size)
            {
                free -= status.asset.size;
                fitting.push((app, status));
            } else {
                warn!(
                    "Not enough space for {} ({} bytes)",
                    app.id, status.asset.size
                );
                report.skipped_for_storage.push(app.id.to_string());
                skipped.push((app, status));
            }
        }

        self.notify_available(&skipped);
        fitting
    }

    async fn download_all(
        &self,
        pending: Vec<Pending>,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) -> Result<Vec<(&'static AppDescriptor, UpdateStatus, PathBuf)>, UpdateError> {
        let mut downloaded = Vec::with_capacity(pending.len());
        for (app, status) in pending {
            match self.coordinator.acquire_update(app, &status, cancel).await {
                Ok(path) => {
                    report.downloaded.push(app.id.to_string());
                    downloaded.push((app, status, path));
                }
                Err(error) if error.is_run_level() => return Err(error),
                Err(error) => self.record_failure(report, app, Stage::Download, error),
            }
        }
        Ok(downloaded)
    }

    async fn install_all(
        &self,
        mut downloaded: Vec<(&'static AppDescriptor, UpdateStatus, PathBuf)>,
        report: &mut RunReport,
        cancel: &CancellationToken,
    ) -> Flow {
        // Replacing our own package may end this process.
        downloaded.sort_by_key(|(app, _, _)| app.self_update);

        for (app, status, path) in downloaded {
            if cancel.is_cancelled() {
                return Flow::Aborted(UpdateError::Cancelled);
            }

            match self
                .installer
                .install(app, &path, &status.latest_version)
                .await
            {
                InstallOutcome::Success => {
                    info!("Installed {} {}", app.id, status.latest_version);
                    report.installed.push(app.id.to_string());
                    self.notifier.installed(app, &status.latest_version);
                    self.discard_cache(app);
                }
                InstallOutcome::NeedsUserInteraction => {
                    info!("{} needs the user to finish installing", app.id);
                    self.notifier.needs_user_interaction(app, &path);
                }
                InstallOutcome::Failed { code, message } => {
                    self.discard_cache(app);
                    self.record_failure(
                        report,
                        app,
                        Stage::Install,
                        UpdateError::InstallationFailed { code, message },
                    );
                }
            }
        }
        Flow::Completed
    }

    fn discard_cache(&self, app: &AppDescriptor) {
        if let Err(error) = self.coordinator.clear_cache(app) {
            warn!("Could not clear cached package of {}: {error}", app.id);
        }
    }

    fn record_failure(
        &self,
        report: &mut RunReport,
        app: &AppDescriptor,
        stage: Stage,
        error: UpdateError,
    ) {
        warn!("{} failed during {stage}: {error}", app.id);
        self.notifier.app_failed(app, &error);
        report.failures.push(AppFailure {
            app_id: app.id.to_string(),
            stage,
            error,
        });
    }

    fn conclude(&self, flow: &Flow, state: &mut RunState, report: &RunReport) -> RunOutcome {
        let retry_reason = match flow {
            Flow::Completed | Flow::Skipped => report
                .failures
                .iter()
                .find(|failure| failure.error.is_retryable())
                .map(|failure| format!("{} failed: {}", failure.app_id, failure.error)),
            Flow::Deferred(reason) => Some(reason.to_string()),
            Flow::Aborted(error) => Some(error.to_string()),
        };

        let Some(reason) = retry_reason else {
            state.reset_retries();
            return RunOutcome::Success;
        };

        let ceiling = *state
            .max_attempts
            .get_or_insert_with(|| self.backoff.max_attempts());
        state.attempt_count = state.attempt_count.saturating_add(1);

        // The ceiling counts scheduled delays; the run after the last one gives up.
        if state.attempt_count > ceiling {
            warn!("Giving up after {} attempts: {reason}", state.attempt_count);
            self.notifier.retries_exhausted(&reason);
            state.reset_retries();
            return RunOutcome::Success;
        }

        let mut after = self.backoff.delay(state.attempt_count - 1);
        if let Flow::Aborted(UpdateError::RateLimitExceeded { reset_at }) = flow
            && let Ok(wait) = (*reset_at - Utc::now()).to_std()
        {
            after = after.max(wait.min(self.backoff.max()));
        }

        info!(
            "Retrying in {}s (attempt {}/{ceiling}): {reason}",
            after.as_secs(),
            state.attempt_count
        );
        RunOutcome::Retry { after }
    }
}
