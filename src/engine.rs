//! Download engine
//!
//! One [`Download`] owns one resource's state machine: validate, plan,
//! fetch all fragments concurrently, merge in order, finalise. The driver
//! runs on a background task; callers keep the handle for status queries
//! and cancellation.

use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::events::{Event, EventSink};
use crate::http::FetchClient;
use crate::model::{DownloadStatus, SharedResource};
use crate::planner;
use crate::storage::StorageService;

/// Manifest written next to the completed artefact
const MANIFEST_FILENAME: &str = "manifest.mf";

/// A single download and its driver
pub struct Download {
    resource: SharedResource,
    client: Arc<dyn FetchClient>,
    events: Arc<dyn EventSink>,
    storage: Arc<StorageService>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("id", &self.resource.id())
            .field("status", &self.resource.status())
            .finish()
    }
}

impl Download {
    /// Create a download for `uri` with the configured defaults and a fresh id
    pub fn new(
        uri: impl Into<String>,
        config: &crate::config::DownloadConfig,
        client: Arc<dyn FetchClient>,
        events: Arc<dyn EventSink>,
        storage: Arc<StorageService>,
    ) -> Self {
        Self {
            resource: SharedResource::new(crate::model::Resource::new(uri, config)),
            client,
            events,
            storage,
            cancel: CancellationToken::new(),
            driver: Mutex::new(None),
        }
    }

    pub fn id(&self) -> String {
        self.resource.id()
    }

    pub fn status(&self) -> DownloadStatus {
        self.resource.status()
    }

    pub fn resource(&self) -> SharedResource {
        self.resource.clone()
    }

    /// `(bytes_downloaded, file_size, percent)`
    pub fn progress(&self) -> (u64, u64, u64) {
        self.resource.progress()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.resource.elapsed_ms()
    }

    /// Validate, plan and spawn the background driver.
    ///
    /// Returns the download id immediately; failures before the spawn set
    /// the status to `Error` and surface the cause to the caller.
    pub async fn start(self: &Arc<Self>) -> Result<String> {
        let id = {
            let mut resource = self.resource.write();
            resource.status = DownloadStatus::Initialising;
            resource.start_time = Some(Utc::now());
            resource.id.clone()
        };

        if let Err(e) = self.prepare().await {
            tracing::error!(error = %e, id = %id, "download initialisation failed");
            self.resource.push_error(e.to_string());
            self.resource.set_status(DownloadStatus::Error);
            return Err(e);
        }

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.driver.lock() = Some(handle);
        Ok(id)
    }

    /// Cancel the per-download context; idempotent.
    ///
    /// In-flight fetches observe the cancellation at their next read and the
    /// driver removes the sidecars and the partial artefact.
    pub fn cancel(&self) {
        tracing::info!(id = %self.resource.id(), "cancelling download");
        self.cancel.cancel();
    }

    /// Detach the driver handle, if the driver was spawned
    pub fn take_driver(&self) -> Option<JoinHandle<()>> {
        self.driver.lock().take()
    }

    /// Validation, directory creation, size probe and fragment planning
    async fn prepare(&self) -> Result<()> {
        self.resource.read().validate()?;

        let (uri, destination, template, id, max_fragment_size, min_fragment_size, max_conc) = {
            let resource = self.resource.read();
            (
                resource.uri.clone(),
                resource.destination.clone(),
                resource.path_template.clone(),
                resource.id.clone(),
                resource.max_fragment_size,
                resource.min_fragment_size,
                resource.max_conc_fragments,
            )
        };

        let filename = artefact_filename(&uri);
        let target_dir = if template.is_empty() {
            destination
        } else {
            destination.join(render_template(&template, &filename, &id))
        };
        tokio::fs::create_dir_all(&target_dir)
            .await
            .map_err(|e| EngineError::io(&target_dir, &e))?;

        // content-length is not always present
        let file_size = match self.client.probe_size(&uri).await {
            Ok(size) => size,
            Err(e) => {
                tracing::info!(error = %e, uri = %uri, "file size unavailable");
                0
            }
        };

        let file = unique_path(target_dir.join(&filename)).await;
        tracing::debug!(file = %file.display(), file_size, "planned download target");

        let plan = planner::plan(
            &file,
            file_size,
            max_fragment_size,
            min_fragment_size,
            max_conc,
        );
        tracing::debug!(fragments = plan.fragments.len(), "planned fragments");

        let mut resource = self.resource.write();
        resource.file_size = file_size;
        resource.file = file;
        resource.max_conc_fragments = plan.max_conc_fragments;
        resource.fragments = plan.fragments;
        Ok(())
    }

    /// The background driver: fetch, merge, finalise, with per-attempt retry
    async fn run(self: Arc<Self>) {
        self.transition(DownloadStatus::Running).await;

        let (retries, file) = {
            let resource = self.resource.read();
            (resource.retries, resource.file.clone())
        };

        for attempt in 0..=retries {
            if self.cancel.is_cancelled() {
                self.resource.push_error("download cancelled".to_string());
                self.resource.set_status(DownloadStatus::Error);
                break;
            }
            if attempt > 0 {
                self.replan();
            }

            let mut target = match self.initialize_target(&file).await {
                Ok(target) => target,
                Err(e) => {
                    tracing::error!(error = %e, file = %file.display(), "failed to initialize");
                    self.resource.push_error(e.to_string());
                    self.resource.set_status(DownloadStatus::InitError);
                    break;
                }
            };

            let errors = self.fetch_all().await;
            if !errors.is_empty() {
                self.record_fetch_errors(&errors);
                if self.cancel.is_cancelled() {
                    self.resource.set_status(DownloadStatus::Error);
                    break;
                }
                if attempt < retries {
                    tracing::info!(attempt, retries, file = %file.display(), "retry");
                    continue;
                }
                tracing::error!(file = %file.display(), "failed in download");
                self.resource.set_status(DownloadStatus::Error);
                break;
            }

            if let Err(e) = self.merge_fragments(&mut target).await {
                tracing::debug!(error = %e, file = %file.display(), "merge failed");
                self.resource.push_error(e.to_string());
                if attempt < retries && !self.cancel.is_cancelled() {
                    tracing::info!(attempt, retries, file = %file.display(), "retry");
                    continue;
                }
                self.resource.set_status(DownloadStatus::Error);
                break;
            }

            tracing::info!(file = %file.display(), "complete");
            break;
        }

        if self.resource.status() == DownloadStatus::Running {
            {
                let mut resource = self.resource.write();
                resource.status = DownloadStatus::Complete;
                resource.end_time = Some(Utc::now());
            }
            if let Err(e) = self.write_manifest().await {
                tracing::error!(error = %e, "failed to write manifest");
                self.resource.push_error(e.to_string());
                self.resource.set_status(DownloadStatus::Error);
            }
        }

        if self.resource.status() != DownloadStatus::Complete {
            self.cleanup(&file).await;
        }

        self.persist().await;
        self.notify_status();
    }

    /// Set the status, persist the resource, publish the transition
    async fn transition(&self, status: DownloadStatus) {
        self.resource.set_status(status);
        self.persist().await;
        self.notify_status();
    }

    /// Persist the current resource snapshot; a storage failure demotes the
    /// download to `Error` and is recorded, never retried
    async fn persist(&self) {
        let snapshot = self.resource.snapshot();
        if let Err(e) = self.storage.update_resource(&snapshot).await {
            tracing::error!(error = %e, id = %snapshot.id, "failed to persist resource");
            self.resource.push_error(e.to_string());
            if self.resource.status() != DownloadStatus::Error {
                self.resource.set_status(DownloadStatus::Error);
            }
        }
    }

    /// Publish the current status; failures are recorded, not fatal
    fn notify_status(&self) {
        let (status, id) = {
            let resource = self.resource.read();
            (resource.status, resource.id.clone())
        };
        if let Err(e) = self.events.notify(Event::download(status.to_string(), id)) {
            tracing::warn!(error = %e, "failed to publish event");
            self.resource.push_error(e.to_string());
        }
    }

    /// Reinstall a fresh plan for the next attempt; the planner is pure so
    /// the ranges come out identical
    fn replan(&self) {
        let mut resource = self.resource.write();
        let plan = planner::plan(
            &resource.file,
            resource.file_size,
            resource.max_fragment_size,
            resource.min_fragment_size,
            resource.max_conc_fragments,
        );
        resource.max_conc_fragments = plan.max_conc_fragments;
        resource.fragments = plan.fragments;
    }

    /// Create the target file and truncate it to zero length
    async fn initialize_target(&self, file: &Path) -> Result<File> {
        let file_mode = self.resource.read().file_mode;
        open_sink(file, file_mode).await
    }

    /// Fetch every fragment, at most `max_conc_fragments` in flight.
    ///
    /// The first failure cancels the attempt (fail-fast); the error channel
    /// is drained only after every task has joined.
    async fn fetch_all(&self) -> Vec<EngineError> {
        let attempt_cancel = self.cancel.child_token();
        let (indices, max_conc) = {
            let resource = self.resource.read();
            (
                resource.fragments.keys().copied().collect::<Vec<_>>(),
                resource.max_conc_fragments,
            )
        };

        let semaphore = Arc::new(Semaphore::new(max_conc.max(1)));
        let (err_tx, mut err_rx) = mpsc::channel::<EngineError>(indices.len().max(1));
        let mut tasks = JoinSet::new();

        for index in indices {
            let semaphore = Arc::clone(&semaphore);
            let cancel = attempt_cancel.clone();
            let err_tx = err_tx.clone();
            let resource = self.resource.clone();
            let client = Arc::clone(&self.client);

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = fetch_fragment(&resource, client.as_ref(), &cancel, index).await {
                    tracing::error!(error = %e, index, "fragment fetch failed");
                    let _ = err_tx.send(e).await;
                    cancel.cancel();
                }
            });
        }
        drop(err_tx);

        while tasks.join_next().await.is_some() {}

        let mut errors = Vec::new();
        while let Ok(error) = err_rx.try_recv() {
            errors.push(error);
        }
        errors
    }

    /// Record the attempt's failures; cancellation echoes from sibling
    /// fragments collapse into a single entry
    fn record_fetch_errors(&self, errors: &[EngineError]) {
        let mut recorded = 0usize;
        for error in errors.iter().filter(|e| !e.is_cancelled()) {
            self.resource.push_error(error.to_string());
            recorded += 1;
        }
        if recorded == 0 {
            self.resource.push_error("download cancelled".to_string());
        }
    }

    /// Append each sidecar to the target in ascending index order, deleting
    /// sidecars as they are consumed
    async fn merge_fragments(&self, target: &mut File) -> Result<()> {
        let sidecars: Vec<PathBuf> = {
            let resource = self.resource.read();
            resource
                .fragments
                .values()
                .map(|f| f.filename.clone())
                .collect()
        };

        for sidecar in sidecars {
            let mut fragment_file = File::open(&sidecar)
                .await
                .map_err(|e| EngineError::io(&sidecar, &e))?;
            target.seek(SeekFrom::End(0)).await?;
            tokio::io::copy(&mut fragment_file, target)
                .await
                .map_err(|e| EngineError::io(&sidecar, &e))?;
            tokio::fs::remove_file(&sidecar)
                .await
                .map_err(|e| EngineError::io(&sidecar, &e))?;
        }

        target.flush().await?;
        target.sync_all().await?;
        Ok(())
    }

    /// Write the JSON manifest next to the artefact
    async fn write_manifest(&self) -> Result<()> {
        let snapshot = self.resource.snapshot();
        let dir = snapshot
            .file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let path = unique_path(dir.join(MANIFEST_FILENAME)).await;
        let data = serde_json::to_vec_pretty(&snapshot)?;

        let mut manifest = open_sink(&path, snapshot.file_mode).await?;
        manifest
            .write_all(&data)
            .await
            .map_err(|e| EngineError::io(&path, &e))?;
        manifest
            .flush()
            .await
            .map_err(|e| EngineError::io(&path, &e))?;
        Ok(())
    }

    /// Remove the sidecars; on cancellation the partial artefact goes too
    async fn cleanup(&self, file: &Path) {
        let sidecars: Vec<PathBuf> = {
            let resource = self.resource.read();
            resource
                .fragments
                .values()
                .map(|f| f.filename.clone())
                .collect()
        };
        for sidecar in sidecars {
            // already merged or never created
            let _ = tokio::fs::remove_file(&sidecar).await;
        }

        if self.cancel.is_cancelled() {
            if let Err(e) = tokio::fs::remove_file(file).await {
                tracing::debug!(error = %e, file = %file.display(), "remove failed");
            }
        }
    }
}

/// Fetch a single fragment into its sidecar file
async fn fetch_fragment(
    resource: &SharedResource,
    client: &dyn FetchClient,
    cancel: &CancellationToken,
    index: usize,
) -> Result<()> {
    let (filename, file_mode, empty) = {
        let r = resource.read();
        let fragment = r
            .fragments
            .get(&index)
            .ok_or_else(|| EngineError::Internal(format!("unknown fragment {}", index)))?;
        (fragment.filename.clone(), r.file_mode, fragment.is_empty())
    };

    let mut sink = open_sink(&filename, file_mode).await?;

    {
        let mut r = resource.write();
        if let Some(fragment) = r.fragments.get_mut(&index) {
            fragment.start_time = Some(Utc::now());
            fragment.end_time = None;
            fragment.progress = 0;
            fragment.error = None;
        }
    }

    let result = if empty {
        // zero-length remainder: the sidecar exists and stays empty
        Ok(())
    } else {
        client
            .fetch_data(cancel, resource, index, &mut sink)
            .await
            .map_err(EngineError::from)
    };

    {
        let mut r = resource.write();
        if let Some(fragment) = r.fragments.get_mut(&index) {
            fragment.end_time = Some(Utc::now());
            if let Err(ref e) = result {
                fragment.error = Some(e.to_string());
            }
        }
    }
    result
}

/// Open a file for writing, truncated, with the configured mode bits
async fn open_sink(path: &Path, mode: u32) -> Result<File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    options
        .open(path)
        .await
        .map_err(|e| EngineError::io(path, &e))
}

/// Derive the artefact filename from the last path segment of the URI
fn artefact_filename(uri: &str) -> String {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

/// Render the per-download subdirectory pattern
fn render_template(template: &str, filename: &str, id: &str) -> String {
    template.replace("{filename}", filename).replace("{id}", id)
}

/// Find a free name by appending `.1`, `.2`, … to an occupied path
async fn unique_path(path: PathBuf) -> PathBuf {
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return path;
    }
    let mut i = 1u32;
    loop {
        let mut name = path.as_os_str().to_os_string();
        name.push(format!(".{}", i));
        let candidate = PathBuf::from(name);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn filename_comes_from_the_uri_path() {
        assert_eq!(
            artefact_filename("https://example.com/releases/artefact.tar.gz"),
            "artefact.tar.gz"
        );
        assert_eq!(artefact_filename("https://example.com/"), "download");
        assert_eq!(artefact_filename("not a uri"), "download");
    }

    #[test]
    fn template_renders_filename_and_id() {
        assert_eq!(
            render_template("{filename}-{id}", "a.bin", "1234"),
            "a.bin-1234"
        );
        assert_eq!(render_template("static", "a.bin", "1234"), "static");
    }

    #[tokio::test]
    async fn unique_path_appends_counters() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("artefact.bin");

        assert_eq!(unique_path(base.clone()).await, base);

        tokio::fs::write(&base, b"x").await.unwrap();
        let first = unique_path(base.clone()).await;
        assert_eq!(first, dir.path().join("artefact.bin.1"));

        tokio::fs::write(&first, b"x").await.unwrap();
        let second = unique_path(base.clone()).await;
        assert_eq!(second, dir.path().join("artefact.bin.2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sink_carries_the_configured_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("mode.bin");
        let _ = open_sink(&path, 0o600).await.unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
