use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fs2::FileExt;
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use upkeep_api::{ArtifactFormat, DownloadProgress, UpdateError};

use crate::integrity::{file_label, verify_archive, verify_size};

const PROGRESS_BUFFER: usize = 64;
const MARKER_SUFFIX: &str = "downloading";
const PART_SUFFIX: &str = "part";

/// One artifact to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub app_id: String,
    pub version: String,
    pub url: String,
    pub expected_size: u64,
    pub format: ArtifactFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Pending,
    Running,
    Succeeded,
    Failed(UpdateError),
}

/// Snapshot of an in-flight download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    pub target: PathBuf,
    pub downloaded: u64,
    pub total: Option<u64>,
    pub outcome: DownloadOutcome,
}

type SharedState = Arc<Mutex<DownloadState>>;

fn update_state(state: &SharedState, apply: impl FnOnce(&mut DownloadState)) {
    apply(&mut state.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Progress stream and terminal result of one download.
///
/// The result is only available through [`DownloadHandle::finish`], which
/// drains any progress the caller did not consume first.
pub struct DownloadHandle {
    progress: mpsc::Receiver<DownloadProgress>,
    state: SharedState,
    task: JoinHandle<Result<PathBuf, UpdateError>>,
}

impl DownloadHandle {
    /// Next progress event, or `None` once the transfer has ended.
    pub async fn next(&mut self) -> Option<DownloadProgress> {
        self.progress.recv().await
    }

    #[must_use]
    pub fn state(&self) -> DownloadState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain remaining progress and return the downloaded file.
    ///
    /// # Errors
    /// Returns the download error, or [`UpdateError::Internal`] when the
    /// download task panicked.
    pub async fn finish(mut self) -> Result<PathBuf, UpdateError> {
        while self.progress.recv().await.is_some() {}
        match self.task.await {
            Ok(result) => result,
            Err(error) => Err(UpdateError::Internal {
                details: format!("download task failed: {error}"),
            }),
        }
    }
}

struct Inner {
    client: reqwest::Client,
    root: PathBuf,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Inner {
    fn app_dir(&self, app_id: &str) -> PathBuf {
        self.root.join(app_id)
    }

    /// Lock file of `app_id`, kept beside its cache directory so clearing
    /// the cache never unlinks a file another process may hold.
    fn marker_path(&self, app_id: &str) -> PathBuf {
        self.root.join(format!(".{app_id}.{MARKER_SUFFIX}"))
    }

    fn artifact_path(&self, request: &DownloadRequest) -> PathBuf {
        self.app_dir(&request.app_id).join(format!(
            "{}-{}.{}",
            request.app_id,
            sanitize(&request.version),
            request.format.extension()
        ))
    }

    fn slot(&self, app_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(app_id.to_string()).or_default())
    }
}

/// Streams artifacts into a per-app cache directory.
///
/// Within a process, downloads of the same app are serialized and the second
/// caller reuses the first caller's file. Across processes a locked marker
/// file makes a concurrent download fail with
/// [`UpdateError::DownloadInProgress`].
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(client: reqwest::Client, root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                root: root.into(),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The completed artifact for `request`, if its size matches.
    #[must_use]
    pub fn cached_artifact(&self, request: &DownloadRequest) -> Option<PathBuf> {
        let path = self.inner.artifact_path(request);
        std::fs::metadata(&path)
            .ok()
            .filter(|metadata| metadata.is_file() && metadata.len() == request.expected_size)
            .map(|_| path)
    }

    /// Delete every cached artifact of `app_id`.
    ///
    /// # Errors
    /// Returns an IO error when the cache directory exists but cannot be removed.
    pub fn remove_cached(&self, app_id: &str) -> Result<(), UpdateError> {
        let dir = self.inner.app_dir(app_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!("Cleared download cache of {app_id}");
                Ok(())
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(UpdateError::io_with_path(
                "failed to clear download cache",
                &dir,
                &error,
            )),
        }
    }

    /// Start downloading `request` on the runtime.
    #[must_use]
    pub fn download(&self, request: DownloadRequest, cancel: CancellationToken) -> DownloadHandle {
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        let state = Arc::new(Mutex::new(DownloadState {
            target: self.inner.artifact_path(&request),
            downloaded: 0,
            total: Some(request.expected_size),
            outcome: DownloadOutcome::Pending,
        }));

        let inner = Arc::clone(&self.inner);
        let task_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            let result = run_download(&inner, &request, &cancel, &tx, &task_state).await;
            update_state(&task_state, |state| {
                state.outcome = match &result {
                    Ok(_) => DownloadOutcome::Succeeded,
                    Err(error) => DownloadOutcome::Failed(error.clone()),
                };
            });
            result
        });

        DownloadHandle {
            progress: rx,
            state,
            task,
        }
    }
}

async fn run_download(
    inner: &Inner,
    request: &DownloadRequest,
    cancel: &CancellationToken,
    progress: &mpsc::Sender<DownloadProgress>,
    state: &SharedState,
) -> Result<PathBuf, UpdateError> {
    let slot = inner.slot(&request.app_id);
    let _slot_guard = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(UpdateError::Cancelled),
        guard = slot.lock_owned() => guard,
    };

    let target = inner.artifact_path(request);
    if is_complete(&target, request.expected_size).await {
        debug!("Cache hit for {} {}", request.app_id, request.version);
        update_state(state, |state| state.downloaded = request.expected_size);
        let _ = progress
            .send(DownloadProgress {
                downloaded: request.expected_size,
                total: Some(request.expected_size),
            })
            .await;
        return Ok(target);
    }

    let dir = inner.app_dir(&request.app_id);
    tokio::fs::create_dir_all(&dir).await.map_err(|error| {
        UpdateError::io_with_path("failed to create download directory", &dir, &error)
    })?;
    let marker_path = inner.marker_path(&request.app_id);
    let marker = DownloadMarker::acquire(&marker_path, &request.app_id)?;

    let part = target.with_extension(format!("{}.{PART_SUFFIX}", request.format.extension()));
    update_state(state, |state| state.outcome = DownloadOutcome::Running);

    if let Err(error) = fetch(inner, request, &part, cancel, progress, state).await {
        discard(&part).await;
        return Err(error);
    }

    let check_path = part.clone();
    let expected_size = request.expected_size;
    let format = request.format;
    let verified = tokio::task::spawn_blocking(move || {
        verify_size(&check_path, expected_size)?;
        verify_archive(&check_path, format)
    })
    .await
    .unwrap_or_else(|error| {
        Err(UpdateError::Internal {
            details: format!("integrity check failed to run: {error}"),
        })
    });

    if let Err(error) = verified {
        warn!("Discarding download of {}: {error}", request.app_id);
        discard(&part).await;
        return Err(error);
    }

    tokio::fs::rename(&part, &target).await.map_err(|error| {
        UpdateError::io_with_path("failed to move download into place", &target, &error)
    })?;
    remove_stale(&dir, &target).await;
    drop(marker);

    info!(
        "Downloaded {} {} ({} bytes)",
        request.app_id, request.version, request.expected_size
    );
    Ok(target)
}

async fn fetch(
    inner: &Inner,
    request: &DownloadRequest,
    dest: &Path,
    cancel: &CancellationToken,
    progress: &mpsc::Sender<DownloadProgress>,
    state: &SharedState,
) -> Result<(), UpdateError> {
    const OPERATION: &str = "download artifact";

    info!("Downloading {} from {}", request.app_id, request.url);
    let response = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(UpdateError::Cancelled),
        response = inner.client.get(&request.url).send() => response
            .map_err(|error| UpdateError::network_request_from(OPERATION, error))?,
    };

    if !response.status().is_success() {
        return Err(UpdateError::network_request(
            OPERATION,
            format!("HTTP {}", response.status()),
        ));
    }

    let total = response.content_length().or(Some(request.expected_size));
    update_state(state, |state| state.total = total);

    let mut file = tokio::fs::File::create(dest).await.map_err(|error| {
        UpdateError::io_with_path("failed to create download file", dest, &error)
    })?;
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("Download of {} cancelled", request.app_id);
                return Err(UpdateError::Cancelled);
            }
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk.map_err(|error| UpdateError::network_request_from(OPERATION, error))?;

        let received = downloaded + chunk.len() as u64;
        if received > request.expected_size {
            warn!(
                "{} sent more than the advertised {} bytes, aborting",
                request.url, request.expected_size
            );
            return Err(UpdateError::SizeMismatch {
                file: file_label(dest),
                expected: request.expected_size,
                actual: received,
            });
        }

        file.write_all(&chunk).await.map_err(|error| {
            UpdateError::io_with_path("failed to write download data", dest, &error)
        })?;
        downloaded = received;
        update_state(state, |state| state.downloaded = downloaded);
        let _ = progress.send(DownloadProgress { downloaded, total }).await;
    }

    file.flush().await.map_err(|error| {
        UpdateError::io_with_path("failed to flush download file", dest, &error)
    })?;
    Ok(())
}

async fn is_complete(path: &Path, expected_size: u64) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|metadata| metadata.is_file() && metadata.len() == expected_size)
}

async fn discard(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != std::io::ErrorKind::NotFound
    {
        warn!("Failed to remove {}: {error}", path.display());
    }
}

async fn remove_stale(dir: &Path, keep: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path == keep {
            continue;
        }
        debug!("Removing stale artifact {}", path.display());
        discard(&path).await;
    }
}

fn sanitize(version: &str) -> String {
    version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Cross-process "currently downloading" flag for one app.
///
/// The flag is the exclusive lock, released when the marker is dropped. The
/// file itself stays on disk so every process locks the same inode.
struct DownloadMarker {
    _file: std::fs::File,
}

impl DownloadMarker {
    fn acquire(path: &Path, app_id: &str) -> Result<Self, UpdateError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|error| {
                UpdateError::io_with_path("failed to open download marker", path, &error)
            })?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { _file: file }),
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                Err(UpdateError::DownloadInProgress {
                    app: app_id.to_string(),
                })
            }
            Err(error) => Err(UpdateError::io_with_path(
                "failed to lock download marker",
                path,
                &error,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::test_server::{Route, TestServer};

    fn apk_bytes(payload: &[u8]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        writer
            .start_file("AndroidManifest.xml", options)
            .expect("entry starts");
        writer.write_all(payload).expect("entry is written");
        writer
            .finish()
            .expect("zip archive should be finalized")
            .into_inner()
    }

    fn request(server: &TestServer, version: &str, size: u64) -> DownloadRequest {
        DownloadRequest {
            app_id: "bromite".to_string(),
            version: version.to_string(),
            url: server.url("/arm64_ChromePublic.apk"),
            expected_size: size,
            format: ArtifactFormat::Apk,
        }
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn downloads_reports_progress_and_reuses_cache() {
        let body = apk_bytes(b"<manifest/>");
        let size = body.len() as u64;
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());

        let mut handle =
            manager.download(request(&server, "100.0.4896.57", size), CancellationToken::new());
        let mut last = None;
        while let Some(event) = handle.next().await {
            last = Some(event);
        }
        let path = handle.finish().await.expect("download succeeds");

        assert_eq!(last.map(|event| event.downloaded), Some(size));
        assert_eq!(
            path,
            temp.path().join("bromite").join("bromite-100.0.4896.57.apk")
        );
        assert_eq!(files_in(&temp.path().join("bromite")), ["bromite-100.0.4896.57.apk"]);

        let again = manager
            .download(request(&server, "100.0.4896.57", size), CancellationToken::new())
            .finish()
            .await
            .expect("cache hit succeeds");
        assert_eq!(again, path);
        assert_eq!(server.hits("/arm64_ChromePublic.apk"), 1);
    }

    #[tokio::test]
    async fn state_tracks_outcome() {
        let body = apk_bytes(b"<manifest/>");
        let size = body.len() as u64;
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());

        let mut handle = manager.download(request(&server, "1.0", size), CancellationToken::new());
        while handle.next().await.is_some() {}
        tokio::task::yield_now().await;
        let state = handle.state();
        assert_eq!(state.downloaded, size);
        assert_eq!(state.target, temp.path().join("bromite").join("bromite-1.0.apk"));
        handle.finish().await.expect("download succeeds");
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_transfer() {
        let body = apk_bytes(b"<manifest/>");
        let size = body.len() as u64;
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());

        let first = manager.download(request(&server, "2.0", size), CancellationToken::new());
        let second = manager.download(request(&server, "2.0", size), CancellationToken::new());
        let (first, second) = tokio::join!(first.finish(), second.finish());

        assert_eq!(first.expect("first succeeds"), second.expect("second succeeds"));
        assert_eq!(server.hits("/arm64_ChromePublic.apk"), 1);
    }

    #[tokio::test]
    async fn size_mismatch_deletes_the_file() {
        let body = apk_bytes(b"<manifest/>");
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());

        let result = manager
            .download(request(&server, "100.0.4896.57", 157_594_854), CancellationToken::new())
            .finish()
            .await;

        assert!(matches!(
            result,
            Err(UpdateError::SizeMismatch { expected: 157_594_854, .. })
        ));
        assert!(files_in(&temp.path().join("bromite")).is_empty());
    }

    #[tokio::test]
    async fn oversized_body_is_cut_off() {
        let body = apk_bytes(b"<manifest/>");
        let advertised = body.len() as u64 - 8;
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());

        let result = manager
            .download(request(&server, "2.1", advertised), CancellationToken::new())
            .finish()
            .await;

        assert!(matches!(
            result,
            Err(UpdateError::SizeMismatch { expected, actual, .. })
                if expected == advertised && actual > advertised
        ));
        assert!(files_in(&temp.path().join("bromite")).is_empty());
    }

    #[tokio::test]
    async fn corrupt_archive_deletes_the_file() {
        let body = b"<html>not an apk</html>".to_vec();
        let size = body.len() as u64;
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());

        let mut handle = manager.download(request(&server, "3.0", size), CancellationToken::new());
        while handle.next().await.is_some() {}
        tokio::task::yield_now().await;
        let result = handle.finish().await;

        assert!(matches!(result, Err(UpdateError::CorruptArchive { .. })));
        assert!(files_in(&temp.path().join("bromite")).is_empty());
    }

    #[tokio::test]
    async fn http_error_is_a_network_failure() {
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::status(404))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());

        let result = manager
            .download(request(&server, "3.0", 10), CancellationToken::new())
            .finish()
            .await;
        assert!(matches!(result, Err(UpdateError::NetworkFailure { .. })));
    }

    #[tokio::test]
    async fn locked_marker_reports_download_in_progress() {
        let body = apk_bytes(b"x");
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());
        let other_process = std::fs::File::create(manager.inner.marker_path("bromite"))
            .expect("marker created");
        other_process.try_lock_exclusive().expect("marker locked");

        let result = manager
            .download(request(&server, "4.0", 10), CancellationToken::new())
            .finish()
            .await;

        assert!(matches!(
            result,
            Err(UpdateError::DownloadInProgress { ref app }) if app == "bromite"
        ));
        assert_eq!(server.total_hits(), 0);
    }

    #[tokio::test]
    async fn marker_outlives_download_and_cache_clearing() {
        let body = apk_bytes(b"<manifest/>");
        let size = body.len() as u64;
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());

        manager
            .download(request(&server, "4.1", size), CancellationToken::new())
            .finish()
            .await
            .expect("download succeeds");
        manager.remove_cached("bromite").expect("cache cleared");

        let marker = manager.inner.marker_path("bromite");
        assert!(marker.is_file());
        let other_process = std::fs::File::open(&marker).expect("marker opens");
        other_process.try_lock_exclusive().expect("lock was released");
        drop(other_process);

        manager
            .download(request(&server, "4.1", size), CancellationToken::new())
            .finish()
            .await
            .expect("download after clearing succeeds");
        assert_eq!(server.hits("/arm64_ChromePublic.apk"), 2);
    }

    #[tokio::test]
    async fn cancelled_download_leaves_no_partial_file() {
        let body = apk_bytes(b"x");
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = manager
            .download(request(&server, "5.0", 10), cancel)
            .finish()
            .await;

        assert_eq!(result, Err(UpdateError::Cancelled));
        assert!(files_in(&temp.path().join("bromite")).is_empty());
    }

    #[tokio::test]
    async fn newer_download_replaces_older_artifact() {
        let body = apk_bytes(b"<manifest/>");
        let size = body.len() as u64;
        let server = TestServer::start([("/arm64_ChromePublic.apk", Route::ok(body))]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let manager = DownloadManager::new(reqwest::Client::new(), temp.path());

        for version in ["1.0", "1.1"] {
            manager
                .download(request(&server, version, size), CancellationToken::new())
                .finish()
                .await
                .expect("download succeeds");
        }

        assert_eq!(files_in(&temp.path().join("bromite")), ["bromite-1.1.apk"]);
        assert!(manager.cached_artifact(&request(&server, "1.0", size)).is_none());
        assert!(manager.cached_artifact(&request(&server, "1.1", size)).is_some());

        manager.remove_cached("bromite").expect("cache cleared");
        assert!(!temp.path().join("bromite").exists());
        manager.remove_cached("bromite").expect("clearing twice is fine");
    }

    #[test]
    fn version_is_sanitized_for_file_names() {
        assert_eq!(sanitize("100.0.4896.57"), "100.0.4896.57");
        assert_eq!(sanitize("v1/../2"), "v1_.._2");
    }
}
