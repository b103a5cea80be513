//! # fragpull
//!
//! A concurrent, fragmented, resumable HTTP artefact download service.
//!
//! ## Features
//!
//! - **Fragmented downloads**: parallel ranged GETs with bounded concurrency,
//!   per-download retry and ordered merge into a single artefact
//! - **Lifecycle events**: every status transition is published to an event
//!   sink, with a manifest written next to completed artefacts
//! - **Persistent state**: resources and a hot downloads index live in a
//!   local ordered key-value store with batched atomic writes
//! - **REST surface**: create, list, inspect and cancel downloads over HTTP
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fragpull::{Download, DownloadConfig, EventBus, HttpClient, HttpClientConfig,
//!                LocalStore, StorageConfig, StorageService};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = LocalStore::open(&StorageConfig::default()).await?;
//!     let client = HttpClient::new(&HttpClientConfig {
//!         timeout: Duration::from_secs(30),
//!         redirects: 10,
//!     })?;
//!
//!     let download = Arc::new(Download::new(
//!         "https://example.com/artefact.tar.gz",
//!         &DownloadConfig::default(),
//!         Arc::new(client),
//!         Arc::new(EventBus::new()),
//!         Arc::new(StorageService::new(Arc::new(store))),
//!     ));
//!
//!     let id = download.start().await?;
//!     println!("download accepted: {}", id);
//!     Ok(())
//! }
//! ```

// Modules
pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod metrics;
pub mod model;
pub mod planner;
pub mod registry;
pub mod storage;

// Re-exports for convenience
pub use config::{
    Compression, DownloadConfig, EventsConfig, MetricsConfig, ServerConfig, ServiceConfig,
    StorageConfig,
};
pub use engine::Download;
pub use error::{EngineError, FetchError, Result};
pub use events::{Event, EventBus, EventKind, EventSink, LogSink};
pub use http::{FetchClient, HttpClient, HttpClientConfig};
pub use metrics::Metrics;
pub use model::{DownloadStatus, Fragment, Resource, SharedResource};
pub use planner::{plan, FragmentPlan};
pub use registry::DownloadRegistry;
pub use storage::{Index, LocalStore, Record, StorageService, DOWNLOADS_INDEX};
