//! Download registry
//!
//! Process-wide map of id to live download handle. Admission enforces the
//! global concurrency cap; finished downloads stay queryable until they are
//! explicitly deleted or the service shuts down.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::Download;
use crate::error::{EngineError, Result};

/// Grace period for drivers to finalise during shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct DownloadRegistry {
    max_concurrent: usize,
    downloads: RwLock<HashMap<String, Arc<Download>>>,
    closed: AtomicBool,
}

impl DownloadRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            downloads: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Admit a download iff the count of non-terminal entries is below the
    /// cap. The admitted handle is registered before it starts, so racing
    /// admissions serialise on the map lock and cannot oversubscribe.
    pub fn admit(&self, download: Arc<Download>) -> Result<Arc<Download>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }

        let mut downloads = self.downloads.write();
        let live = downloads
            .values()
            .filter(|d| !d.status().is_terminal())
            .count();
        if live >= self.max_concurrent {
            return Err(EngineError::Busy {
                limit: self.max_concurrent,
            });
        }
        downloads.insert(download.id(), Arc::clone(&download));
        Ok(download)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Download>> {
        self.downloads
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<Arc<Download>> {
        self.downloads.read().values().cloned().collect()
    }

    /// Purge an entry, cancelling it first if it is still live
    pub fn remove(&self, id: &str) -> Result<()> {
        let download = self
            .downloads
            .write()
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !download.status().is_terminal() {
            download.cancel();
        }
        Ok(())
    }

    /// Stop admitting, cancel every live download and wait briefly for the
    /// drivers to finalise
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let downloads: Vec<Arc<Download>> = {
            let mut map = self.downloads.write();
            map.drain().map(|(_, d)| d).collect()
        };

        for download in &downloads {
            if !download.status().is_terminal() {
                download.cancel();
            }
        }
        for download in &downloads {
            if let Some(handle) = download.take_driver() {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
            }
        }
    }
}
