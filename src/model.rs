//! Resource model
//!
//! The [`Resource`] is the central record for one download: identity, source
//! URI, planner parameters, output path, fragments and lifecycle state. It is
//! the unit of persistence, the manifest payload and the basis of every REST
//! status response.
//!
//! Live downloads share a [`SharedResource`], a reader-writer-locked handle:
//! fetch tasks install fragments and bump progress under the write lock,
//! progress and elapsed readers take the read lock at any time. The lock and
//! the fragment write sinks are runtime-only; serialisation covers the plain
//! data and the fragments map travels as a sequence.

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::DownloadConfig;
use crate::error::{EngineError, Result};

/// Lifecycle state of a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadStatus {
    #[serde(rename = "undefined")]
    Undefined,
    #[serde(rename = "initializing")]
    Initialising,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "init_error")]
    InitError,
}

impl DownloadStatus {
    /// A live download occupies a slot against the global concurrency cap
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Initialising | Self::Running)
    }

    /// Terminal states admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::InitError)
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Initialising => "initializing",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::InitError => "init_error",
        };
        write!(f, "{}", name)
    }
}

/// A contiguous byte range of the source, fetched independently
///
/// The write sink is not part of the fragment; the fetch task owns the open
/// sidecar file for the duration of the transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub index: usize,
    /// Inclusive start offset in the source
    pub start: u64,
    /// Inclusive end offset; `end < start` marks a zero-length remainder
    pub end: u64,
    /// Sidecar file path, `<artefact>.<index>`
    pub filename: PathBuf,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Bytes written to the sidecar so far
    #[serde(default)]
    pub progress: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Fragment {
    pub fn new(index: usize, start: u64, end: u64, filename: PathBuf) -> Self {
        Self {
            index,
            start,
            end,
            filename,
            start_time: None,
            end_time: None,
            progress: 0,
            error: None,
        }
    }

    /// A zero-length remainder fragment carries no bytes and is never fetched
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn size(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// Milliseconds spent on this fragment; still-running fragments are
    /// measured against `now`, unstarted ones contribute nothing
    fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => end.signed_duration_since(start).num_milliseconds(),
            (Some(start), None) => now.signed_duration_since(start).num_milliseconds(),
            (None, _) => 0,
        }
    }
}

/// Central data structure for one download
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub uri: String,
    /// Root directory for the output artefact
    pub destination: PathBuf,
    /// Optional pattern for a per-download subdirectory; recognises the
    /// `{filename}` and `{id}` placeholders
    #[serde(default)]
    pub path_template: String,
    /// Fully-qualified output path, assigned once during planning
    #[serde(default)]
    pub file: PathBuf,
    /// Total bytes; 0 when the origin does not advertise a content length
    #[serde(default)]
    pub file_size: u64,
    pub max_conc_fragments: usize,
    pub max_fragment_size: u64,
    pub min_fragment_size: u64,
    pub retries: u32,
    pub buffer_size: usize,
    /// POSIX mode bits for created files
    #[serde(rename = "filemode")]
    pub file_mode: u32,
    pub status: DownloadStatus,
    /// Recorded error messages, most recent first
    #[serde(default)]
    pub errors: Vec<String>,
    /// Fragment index -> fragment; serialised as a sequence
    #[serde(with = "fragment_seq", default)]
    pub fragments: BTreeMap<usize, Fragment>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl Resource {
    /// Create a resource with a fresh id and the configured defaults
    pub fn new(uri: impl Into<String>, cfg: &DownloadConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            uri: uri.into(),
            destination: cfg.directory.clone(),
            path_template: cfg.path_template.clone(),
            file: PathBuf::new(),
            file_size: 0,
            max_conc_fragments: cfg.max_fragments,
            max_fragment_size: cfg.max_fragment_size,
            min_fragment_size: cfg.min_fragment_size,
            retries: cfg.retries,
            buffer_size: cfg.buffer_size,
            file_mode: cfg.filemode,
            status: DownloadStatus::Undefined,
            errors: Vec::new(),
            fragments: BTreeMap::new(),
            start_time: None,
            end_time: None,
        }
    }

    /// Check caller-supplied invariants before any filesystem work
    pub fn validate(&self) -> Result<()> {
        if self.uri.is_empty() {
            return Err(EngineError::Validation {
                field: "uri",
                message: "uri not set".to_string(),
            });
        }
        if self.destination.as_os_str().is_empty() {
            return Err(EngineError::Validation {
                field: "destination",
                message: "destination not set".to_string(),
            });
        }
        if self.max_conc_fragments == 0 {
            return Err(EngineError::Validation {
                field: "max_conc_fragments",
                message: "max fragments not set".to_string(),
            });
        }
        if self.file_mode == 0 {
            return Err(EngineError::Validation {
                field: "filemode",
                message: "filemode not set".to_string(),
            });
        }
        if self.buffer_size == 0 {
            return Err(EngineError::Validation {
                field: "buffer_size",
                message: "buffer size not set".to_string(),
            });
        }
        Ok(())
    }

    /// Bytes downloaded across all fragments
    pub fn progress_bytes(&self) -> u64 {
        self.fragments.values().map(|f| f.progress).sum()
    }

    /// Progress percentage; 0 when the total size is unknown
    pub fn progress_percent(&self) -> u64 {
        if self.file_size == 0 {
            return 0;
        }
        (self.progress_bytes() as f64 / self.file_size as f64 * 100.0) as u64
    }

    /// Sum of the fragment elapsed times in milliseconds
    pub fn elapsed_ms(&self) -> u64 {
        let now = Utc::now();
        self.fragments
            .values()
            .map(|f| f.elapsed_ms(now).max(0) as u64)
            .sum()
    }

    /// Record an error, most recent first
    pub fn push_error(&mut self, message: String) {
        self.errors.insert(0, message);
    }
}

/// Fragments are stored as a map keyed by index but travel as a sequence in
/// JSON; deserialisation rebuilds the map.
mod fragment_seq {
    use super::Fragment;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(map: &BTreeMap<usize, Fragment>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(map.len()))?;
        for fragment in map.values() {
            seq.serialize_element(fragment)?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<usize, Fragment>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let fragments = Vec::<Fragment>::deserialize(deserializer)?;
        Ok(fragments.into_iter().map(|f| (f.index, f)).collect())
    }
}

/// Shared handle to a live resource
///
/// Writers install fragments and bump progress; readers compute progress and
/// elapsed aggregates concurrently. Cloning shares the same resource.
#[derive(Clone)]
pub struct SharedResource(Arc<RwLock<Resource>>);

impl SharedResource {
    pub fn new(resource: Resource) -> Self {
        Self(Arc::new(RwLock::new(resource)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Resource> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Resource> {
        self.0.write()
    }

    pub fn snapshot(&self) -> Resource {
        self.0.read().clone()
    }

    pub fn id(&self) -> String {
        self.0.read().id.clone()
    }

    pub fn status(&self) -> DownloadStatus {
        self.0.read().status
    }

    pub fn set_status(&self, status: DownloadStatus) {
        self.0.write().status = status;
    }

    pub fn push_error(&self, message: String) {
        self.0.write().push_error(message);
    }

    /// Install a fragment, holding the write lock only for the insert
    pub fn set_fragment(&self, fragment: Fragment) {
        self.0.write().fragments.insert(fragment.index, fragment);
    }

    /// Bump a fragment's progress by the bytes just written
    pub fn add_fragment_progress(&self, index: usize, bytes: u64) {
        if let Some(fragment) = self.0.write().fragments.get_mut(&index) {
            fragment.progress += bytes;
        }
    }

    /// `(bytes_downloaded, file_size, percent)` under a single read lock
    pub fn progress(&self) -> (u64, u64, u64) {
        let resource = self.0.read();
        (
            resource.progress_bytes(),
            resource.file_size,
            resource.progress_percent(),
        )
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.0.read().elapsed_ms()
    }
}
