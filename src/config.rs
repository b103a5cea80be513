//! Service configuration
//!
//! The configuration record is loaded from a base `application.yaml` plus
//! zero or more profile overlays (`application-<profile>.yaml`) merged on
//! top, then threaded explicitly through the constructors. There is no
//! global configuration state.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Base name of the configuration files
const CONFIG_BASENAME: &str = "application";

/// Top-level service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub download: DownloadConfig,
    pub storage: StorageConfig,
    pub events: EventsConfig,
    pub metrics: MetricsConfig,
}

/// REST listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub ip: String,
    /// Location of the server certificate; empty disables TLS
    pub cert: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1944,
            ip: "127.0.0.1".to_string(),
            cert: String::new(),
        }
    }
}

/// Per-download defaults applied when a resource is created
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Root directory for output artefacts
    pub directory: PathBuf,
    /// Optional per-download subdirectory pattern (`{filename}`, `{id}`)
    pub path_template: String,
    /// Process-wide cap on live downloads
    pub max_concurrent: usize,
    /// Upper bound on parallel fragment fetches per download
    pub max_fragments: usize,
    pub max_fragment_size: u64,
    pub min_fragment_size: u64,
    /// Read buffer size per fragment fetch, in bytes
    pub buffer_size: usize,
    /// Total attempts = retries + 1
    pub retries: u32,
    /// POSIX mode bits for created files
    pub filemode: u32,
    /// Per-request total timeout in seconds
    pub timeout: u64,
    /// Maximum redirect hops
    pub redirects: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/tmp"),
            path_template: String::new(),
            max_concurrent: 1,
            max_fragments: 4,
            max_fragment_size: 8 * 1024 * 1024,
            min_fragment_size: 1024 * 1024,
            buffer_size: 32 * 1024,
            retries: 3,
            filemode: 0o644,
            timeout: 30,
            redirects: 10,
        }
    }
}

/// Value compression inside the key-value store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// The store default, which is snappy
    #[default]
    Default,
    Snappy,
    /// Less memory, more disk
    None,
}

/// Local key-value store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the store; must exist
    pub path: PathBuf,
    /// Write buffer bound in MiB
    pub buffer_mib: usize,
    /// Block cache bound in MiB
    pub cache_mib: usize,
    pub compression: Compression,
    /// Attempt recovery when corruption is detected at open
    pub recovery: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp"),
            buffer_mib: 2,
            cache_mib: 2,
            compression: Compression::Default,
            recovery: false,
        }
    }
}

/// Outbound lifecycle event configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub enabled: bool,
    /// Broker bootstrap list, broker-specific
    pub bootstrap_servers: String,
    pub topic: String,
    pub client_id: String,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bootstrap_servers: String::new(),
            topic: "downloads".to_string(),
            client_id: "fragpull".to_string(),
        }
    }
}

/// Prometheus exposition configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
            path: "/metrics".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load the configuration from the filesystem.
    ///
    /// The base file is either `location` itself (when it names a file) or
    /// `application.yaml` searched in `location`, `$HOME`, `./config` and
    /// `./`, in that order. Each profile then contributes an
    /// `application-<profile>.yaml` overlay merged on top of the base.
    /// Missing files are skipped; an empty search yields the defaults.
    pub fn load(location: Option<&Path>, profiles: &[String]) -> Result<Self> {
        let mut merged = match find_config_file(location, CONFIG_BASENAME)? {
            Some(path) => read_yaml(&path)?,
            None => serde_yaml::Value::Null,
        };

        for profile in profiles {
            let name = format!("{}-{}", CONFIG_BASENAME, profile);
            if let Some(path) = find_config_file(location, &name)? {
                let overlay = read_yaml(&path)?;
                merge_values(&mut merged, overlay);
            } else {
                tracing::debug!(profile, "profile overlay not found, continuing");
            }
        }

        if merged.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(merged)
            .map_err(|e| EngineError::Internal(format!("invalid configuration: {}", e)))
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent == 0 {
            return Err(EngineError::Validation {
                field: "download.max_concurrent",
                message: "must be at least 1".to_string(),
            });
        }
        if self.download.max_fragments == 0 {
            return Err(EngineError::Validation {
                field: "download.max_fragments",
                message: "must be at least 1".to_string(),
            });
        }
        if self.download.buffer_size == 0 {
            return Err(EngineError::Validation {
                field: "download.buffer_size",
                message: "must be at least 1".to_string(),
            });
        }
        if self.download.min_fragment_size > self.download.max_fragment_size {
            return Err(EngineError::Validation {
                field: "download.min_fragment_size",
                message: "must not exceed download.max_fragment_size".to_string(),
            });
        }
        if !self.download.directory.is_dir() {
            return Err(EngineError::Validation {
                field: "download.directory",
                message: format!("not a directory: {:?}", self.download.directory),
            });
        }
        Ok(())
    }
}

/// Locate `<name>.yaml`, preferring an explicit location
fn find_config_file(location: Option<&Path>, name: &str) -> Result<Option<PathBuf>> {
    let filename = format!("{}.yaml", name);

    if let Some(location) = location {
        if location.is_file() {
            // an explicit file stands in for the base; overlays sit next to it
            let dir = location.parent().unwrap_or(Path::new("."));
            let candidate = dir.join(&filename);
            if name == CONFIG_BASENAME {
                return Ok(Some(location.to_path_buf()));
            }
            return Ok(candidate.is_file().then_some(candidate));
        }
        let candidate = location.join(&filename);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }

    let mut search: Vec<PathBuf> = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        search.push(PathBuf::from(home));
    }
    search.push(PathBuf::from("./config"));
    search.push(PathBuf::from("."));

    for dir in search {
        let candidate = dir.join(&filename);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn read_yaml(path: &Path) -> Result<serde_yaml::Value> {
    let raw = std::fs::read_to_string(path).map_err(|e| EngineError::io(path, &e))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| EngineError::Internal(format!("invalid configuration {:?}: {}", path, e)))
}

/// Merge `overlay` into `base`; mappings merge recursively, anything else in
/// the overlay wins.
fn merge_values(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_sane() {
        let config = ServiceConfig::default();
        assert_eq!(config.server.port, 1944);
        assert_eq!(config.download.max_concurrent, 1);
        assert_eq!(config.download.max_fragments, 4);
        assert_eq!(config.storage.buffer_mib, 2);
        assert_eq!(config.storage.cache_mib, 2);
        assert_eq!(config.storage.compression, Compression::Default);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempdir().unwrap();
        let config = ServiceConfig::load(Some(dir.path()), &[]).unwrap();
        assert_eq!(config.server.port, 1944);
    }

    #[test]
    fn base_file_is_read() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("application.yaml"),
            "server:\n  port: 8080\ndownload:\n  retries: 1\n",
        )
        .unwrap();
        let config = ServiceConfig::load(Some(dir.path()), &[]).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.download.retries, 1);
        // untouched sections keep their defaults
        assert_eq!(config.storage.buffer_mib, 2);
    }

    #[test]
    fn profile_overlays_merge_on_top() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("application.yaml"),
            "server:\n  port: 8080\n  ip: 0.0.0.0\nstorage:\n  recovery: true\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("application-prod.yaml"),
            "server:\n  port: 9090\nmetrics:\n  enabled: true\n",
        )
        .unwrap();
        let config =
            ServiceConfig::load(Some(dir.path()), &["prod".to_string(), "absent".to_string()])
                .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.ip, "0.0.0.0");
        assert!(config.storage.recovery);
        assert!(config.metrics.enabled);
    }

    #[test]
    fn compression_names_parse() {
        let config: StorageConfig = serde_yaml::from_str("compression: snappy").unwrap();
        assert_eq!(config.compression, Compression::Snappy);
        let config: StorageConfig = serde_yaml::from_str("compression: none").unwrap();
        assert_eq!(config.compression, Compression::None);
        let config: StorageConfig = serde_yaml::from_str("compression: default").unwrap();
        assert_eq!(config.compression, Compression::Default);
    }

    #[test]
    fn validation_rejects_zero_caps() {
        let dir = tempdir().unwrap();
        let mut config = ServiceConfig::default();
        config.download.directory = dir.path().to_path_buf();
        assert!(config.validate().is_ok());

        config.download.max_concurrent = 0;
        assert!(config.validate().is_err());

        config.download.max_concurrent = 1;
        config.download.min_fragment_size = config.download.max_fragment_size + 1;
        assert!(config.validate().is_err());
    }
}
