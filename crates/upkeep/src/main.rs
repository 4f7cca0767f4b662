mod catalog;
mod coordinator;
mod error;
mod host;
mod logging;
mod scheduler;
mod settings;
mod state;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use upkeep_api::CacheMode;
use upkeep_core::{ArchiveSignatureInspector, DownloadManager, GithubReleaseClient};
use upkeep_platform::{AppPaths, HostProbe, resolve_abis};

use crate::coordinator::Coordinator;
use crate::error::StartupError;
use crate::host::{CommandInstaller, InstalledRegistry, LogNotifier};
use crate::logging::init_logging;
use crate::scheduler::{RunOutcome, Scheduler};
use crate::settings::AppSettings;
use crate::state::RunState;

const USER_AGENT: &str = concat!("upkeep/", env!("CARGO_PKG_VERSION"));
const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_USAGE: u8 = 2;
const EXIT_RETRY: u8 = 75;

const USAGE: &str = "\
Usage: upkeep <command>

Commands:
  run                       Run one update pass (exit 0, 75 to retry later, 1 on failure)
  daemon                    Run update passes until interrupted
  check                     Print the update status of every tracked app
  track <app-id> <version>  Record the version of an app installed on this device
  help                      Show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Run,
    Daemon,
    Check,
    Track { app_id: String, version: String },
    Help,
}

impl Command {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, String> {
        let mut args = args.into_iter();
        let command = match args.next().as_deref() {
            None | Some("help" | "-h" | "--help") => Self::Help,
            Some("run") => Self::Run,
            Some("daemon") => Self::Daemon,
            Some("check") => Self::Check,
            Some("track") => {
                let (Some(app_id), Some(version)) = (args.next(), args.next()) else {
                    return Err("track needs an app id and a version".to_string());
                };
                Self::Track { app_id, version }
            }
            Some(other) => return Err(format!("unknown command '{other}'")),
        };

        match args.next() {
            Some(extra) => Err(format!("unexpected argument '{extra}'")),
            None => Ok(command),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let command = match Command::parse(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("upkeep: {message}\n\n{USAGE}");
            return ExitCode::from(EXIT_USAGE);
        }
    };
    if command == Command::Help {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    let paths = match AppPaths::new() {
        Ok(paths) => paths,
        Err(error) => {
            eprintln!("upkeep: {error}");
            return ExitCode::FAILURE;
        }
    };
    let settings = AppSettings::load(&paths);
    init_logging(
        &paths.log_file(),
        settings.debug_logging,
        settings.max_log_size_bytes,
    );
    debug!("{USER_AGENT} running {command:?}");

    if let Command::Track { app_id, version } = &command {
        return ExitCode::from(track(&paths, app_id, version));
    }

    let scheduler = match build_scheduler(&paths, &settings) {
        Ok(scheduler) => scheduler,
        Err(error) => {
            error!("Cannot start: {error}");
            eprintln!("upkeep: {error}");
            return ExitCode::FAILURE;
        }
    };

    let code = match command {
        Command::Daemon => daemon(&scheduler, &paths, &settings).await,
        Command::Check => check(scheduler.coordinator(), &settings).await,
        _ => exit_code(run_cycle(&scheduler, &paths.state_file(), settings.run_deadline()).await),
    };
    ExitCode::from(code)
}

fn build_scheduler(paths: &AppPaths, settings: &AppSettings) -> Result<Scheduler, StartupError> {
    paths
        .ensure_dirs()
        .map_err(|error| StartupError::io("app directories", &error))?;

    let client = reqwest::Client::builder()
        .timeout(settings.http_timeout())
        .user_agent(USER_AGENT)
        .build()
        .map_err(|error| StartupError::HttpClient(error.to_string()))?;

    let source = GithubReleaseClient::new(client.clone(), settings.release_cache_ttl())
        .with_token(settings.github_token.clone());
    let downloads = DownloadManager::new(client, paths.downloads_dir());
    let registry = Arc::new(InstalledRegistry::load(paths.installed_file()));

    let device_abis = resolve_abis(&settings.device_abis);
    info!(
        "Device architectures: {}",
        device_abis
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );

    let coordinator = Coordinator::new(
        Arc::new(source),
        downloads,
        Arc::new(ArchiveSignatureInspector),
        registry.clone(),
        device_abis,
    )
    .with_prefer_32bit(settings.prefer_32bit)
    .with_page_count(settings.release_page_count)
    .with_fingerprint_overrides(settings.signing_fingerprints.clone());

    let installer = CommandInstaller::new(settings.installer_command.clone(), registry);
    let probe = HostProbe::new(paths.downloads_dir()).with_metered(settings.network_metered);

    Ok(Scheduler::new(
        coordinator,
        Arc::new(installer),
        Arc::new(probe),
        Arc::new(LogNotifier),
        settings.clone(),
    ))
}

/// One scheduled invocation: load state, run under the deadline, save state.
async fn run_cycle(scheduler: &Scheduler, state_path: &Path, deadline: Duration) -> RunOutcome {
    let state = RunState::load(state_path);
    let cancel = CancellationToken::new();
    let timer = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(deadline).await;
            warn!("Run deadline of {}s reached, cancelling", deadline.as_secs());
            cancel.cancel();
        }
    });

    let result = scheduler.run_once(state, &cancel).await;
    timer.abort();

    info!(
        "Run finished: {} checked, {} downloaded, {} installed, {} failed",
        result.report.checked.len(),
        result.report.downloaded.len(),
        result.report.installed.len(),
        result.report.failures.len()
    );

    if let Err(error) = result.state.save(state_path) {
        error!("Could not save run state: {error}");
        return RunOutcome::PermanentFailure;
    }
    result.outcome
}

fn exit_code(outcome: RunOutcome) -> u8 {
    match outcome {
        RunOutcome::Success => EXIT_OK,
        RunOutcome::Retry { after } => {
            println!("retry-after={}", after.as_secs());
            EXIT_RETRY
        }
        RunOutcome::PermanentFailure => EXIT_FAILURE,
    }
}

/// How long the daemon waits before the next run. A run that could not
/// start is retried on the regular schedule.
fn next_pause(outcome: RunOutcome, settings: &AppSettings) -> Duration {
    match outcome {
        RunOutcome::Success => settings.check_interval(),
        RunOutcome::Retry { after } => after,
        RunOutcome::PermanentFailure => {
            error!("Run could not complete, trying again at the next interval");
            settings.check_interval()
        }
    }
}

async fn daemon(scheduler: &Scheduler, paths: &AppPaths, settings: &AppSettings) -> u8 {
    info!(
        "Daemon started, checking every {}s",
        settings.check_interval().as_secs()
    );
    let state_path = paths.state_file();

    loop {
        let outcome = run_cycle(scheduler, &state_path, settings.run_deadline()).await;
        let pause = next_pause(outcome, settings);
        debug!("Next run in {}s", pause.as_secs());

        tokio::select! {
            () = tokio::time::sleep(pause) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Daemon stopped");
                return EXIT_OK;
            }
        }
    }
}

async fn check(coordinator: &Coordinator, settings: &AppSettings) -> u8 {
    let mut failed = false;
    for app in catalog::CATALOG {
        if settings.is_excluded(app.id) {
            continue;
        }
        match coordinator
            .check_for_update(app, CacheMode::ForceNetwork)
            .await
        {
            Ok(status) => println!(
                "{:<16} {:<18} -> {:<18} {}",
                app.id,
                status.installed_version.as_deref().unwrap_or("not installed"),
                status.latest_version,
                if status.is_update_available {
                    "update available"
                } else {
                    "up to date"
                }
            ),
            Err(error) => {
                failed = true;
                println!("{:<16} {error}", app.id);
            }
        }
    }

    if failed { EXIT_FAILURE } else { EXIT_OK }
}

fn track(paths: &AppPaths, app_id: &str, version: &str) -> u8 {
    let Some(app) = catalog::find(app_id) else {
        eprintln!("upkeep: unknown app '{app_id}'");
        return EXIT_USAGE;
    };
    if let Err(error) = version.parse::<upkeep_core::ReleaseVersion>() {
        eprintln!("upkeep: {error}");
        return EXIT_USAGE;
    }

    let registry = InstalledRegistry::load(paths.installed_file());
    match registry.record(app, version) {
        Ok(()) => {
            info!("Tracking {} at {version}", app.id);
            println!("{} {version}", app.display_name);
            EXIT_OK
        }
        Err(error) => {
            eprintln!("upkeep: {error}");
            EXIT_FAILURE
        }
    }
}
