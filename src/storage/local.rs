//! Local ordered key-value store
//!
//! Persistence for resource records and the downloads index, backed by a
//! single-table SQLite database in WAL mode. Keys are `<Type>|<id>` strings,
//! values are JSON, optionally snappy-compressed. The store is intended for
//! a single service instance and is effectively throwaway; it is not a
//! long-term storage solution.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{record_key, Index, Record};
use crate::config::{Compression, StorageConfig};
use crate::error::{EngineError, Result};
use crate::model::Resource;

/// Value encoding tags; decoding is tag-driven so the compression setting
/// can change between runs
const TAG_RAW: u8 = 0;
const TAG_SNAPPY: u8 = 1;

/// Database filename inside the configured storage directory
const DB_FILENAME: &str = "fragpull.db";

pub struct LocalStore {
    conn: Arc<Mutex<Option<Connection>>>,
    compression: Compression,
}

impl LocalStore {
    /// Open the store under `config.path`.
    ///
    /// A corrupt database fails the open unless `config.recovery` is set, in
    /// which case the damaged files are moved aside and a fresh database is
    /// created; the persisted state is descriptive, not a checkpoint.
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        if !config.path.is_dir() {
            return Err(EngineError::Storage(format!(
                "storage path is not a directory or is inaccessible: {:?}",
                config.path
            )));
        }

        let db_path = config.path.join(DB_FILENAME);
        let buffer_mib = config.buffer_mib.max(1);
        let cache_mib = config.cache_mib.max(1);
        let recovery = config.recovery;

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            match open_db(&db_path, buffer_mib, cache_mib) {
                Ok(conn) => Ok(conn),
                Err(e) if recovery => {
                    tracing::warn!(error = %e, path = %db_path.display(), "storage corrupted, attempting recovery");
                    move_aside(&db_path);
                    open_db(&db_path, buffer_mib, cache_mib)
                        .map_err(|e| EngineError::Storage(format!("error opening db: {}", e)))
                }
                Err(e) => Err(EngineError::Storage(format!("error opening db: {}", e))),
            }
        })
        .await
        .map_err(|e| EngineError::Storage(format!("error opening db: {}", e)))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            compression: config.compression,
        })
    }

    /// Fetch a raw value
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();
        let value = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let guard = conn.blocking_lock();
            let conn = guard.as_ref().ok_or_else(closed)?;
            let value = conn
                .query_row(
                    "SELECT value FROM records WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
        .map_err(|e| EngineError::Storage(format!("error getting record: {}", e)))??;

        value.map(decode).transpose()
    }

    /// Store a single raw value
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let encoded = encode(self.compression, value)?;
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let guard = conn.blocking_lock();
            let conn = guard.as_ref().ok_or_else(closed)?;
            conn.execute(
                "INSERT OR REPLACE INTO records (key, value) VALUES (?1, ?2)",
                params![key, encoded],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Storage(format!("error storing record: {}", e)))?
    }

    /// Store a batch of values in one transaction; all land or none do
    pub async fn write(&self, batch: Vec<(String, Vec<u8>)>) -> Result<()> {
        let encoded: Vec<(String, Vec<u8>)> = batch
            .into_iter()
            .map(|(key, value)| encode(self.compression, &value).map(|v| (key, v)))
            .collect::<Result<_>>()?;

        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = conn.blocking_lock();
            let conn = guard.as_mut().ok_or_else(closed)?;
            let tx = conn.transaction()?;
            for (key, value) in &encoded {
                tx.execute(
                    "INSERT OR REPLACE INTO records (key, value) VALUES (?1, ?2)",
                    params![key, value],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|e| EngineError::Storage(format!("error storing batch: {}", e)))?
    }

    /// Flush and release the on-disk lock; idempotent
    pub async fn close(&self) {
        let conn = Arc::clone(&self.conn);
        let _ = tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            if let Some(conn) = guard.take() {
                // checkpoint flushes the WAL into the main database file
                let _ = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()));
                if let Err((_, e)) = conn.close() {
                    tracing::warn!(error = %e, "error closing db");
                }
            }
        })
        .await;
    }

    // typed record operations

    pub async fn get_record<R: Record>(&self, id: &str) -> Result<Option<R>> {
        match self.get(&record_key::<R>(id)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn put_record<R: Record>(&self, record: &R) -> Result<()> {
        self.put(
            &record_key::<R>(record.identifier()),
            &serde_json::to_vec(record)?,
        )
        .await
    }

    pub async fn get_resource(&self, id: &str) -> Result<Option<Resource>> {
        self.get_record(id).await
    }

    pub async fn put_resource(&self, resource: &Resource) -> Result<()> {
        self.put_record(resource).await
    }

    /// Fetch an index, or a fresh empty one when absent
    pub async fn get_index(&self, id: &str) -> Result<Index> {
        Ok(self
            .get_record::<Index>(id)
            .await?
            .unwrap_or_else(|| Index::new(id)))
    }

    pub async fn put_index(&self, index: &Index) -> Result<()> {
        self.put_record(index).await
    }

    /// Atomically store a resource together with the index that lists it
    pub async fn put_resource_indexed(&self, resource: &Resource, index: &Index) -> Result<()> {
        let batch = vec![
            (
                record_key::<Index>(index.identifier()),
                serde_json::to_vec(index)?,
            ),
            (
                record_key::<Resource>(resource.identifier()),
                serde_json::to_vec(resource)?,
            ),
        ];
        self.write(batch).await
    }

    /// Resources listed in the index, optionally filtered.
    ///
    /// An id present in the index but missing from the store is a
    /// consistency fault and surfaces as an error.
    pub async fn list_resources<F>(&self, index: &Index, filter: Option<F>) -> Result<Vec<Resource>>
    where
        F: Fn(&Resource) -> bool,
    {
        let mut resources = Vec::with_capacity(index.ids.len());
        for id in &index.ids {
            let resource = self.get_resource(id).await?.ok_or_else(|| {
                EngineError::Storage(format!("index references missing resource {}", id))
            })?;
            if filter.as_ref().map(|f| f(&resource)).unwrap_or(true) {
                resources.push(resource);
            }
        }
        Ok(resources)
    }
}

fn closed() -> EngineError {
    EngineError::Storage("store is closed".to_string())
}

fn open_db(path: &Path, buffer_mib: usize, cache_mib: usize) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    // block cache, negative value means KiB
    conn.pragma_update(None, "cache_size", -(cache_mib as i64 * 1024))?;
    // bound the WAL, the closest analogue of a write buffer
    conn.pragma_update(None, "journal_size_limit", buffer_mib as i64 * 1024 * 1024)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS records (key TEXT PRIMARY KEY, value BLOB NOT NULL)",
    )?;

    let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        return Err(EngineError::Storage(format!("corrupted: {}", verdict)));
    }
    Ok(conn)
}

/// Move a damaged database (and its WAL companions) out of the way
fn move_aside(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut source = path.as_os_str().to_os_string();
        source.push(suffix);
        let source = PathBuf::from(source);
        if source.exists() {
            let mut target = source.as_os_str().to_os_string();
            target.push(".corrupt");
            let _ = std::fs::rename(&source, PathBuf::from(target));
        }
    }
}

fn encode(compression: Compression, value: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(value.len() + 1);
            out.push(TAG_RAW);
            out.extend_from_slice(value);
            Ok(out)
        }
        Compression::Default | Compression::Snappy => {
            let compressed = snap::raw::Encoder::new()
                .compress_vec(value)
                .map_err(|e| EngineError::Storage(format!("compress: {}", e)))?;
            let mut out = Vec::with_capacity(compressed.len() + 1);
            out.push(TAG_SNAPPY);
            out.extend(compressed);
            Ok(out)
        }
    }
}

fn decode(value: Vec<u8>) -> Result<Vec<u8>> {
    match value.split_first() {
        Some((&TAG_RAW, rest)) => Ok(rest.to_vec()),
        Some((&TAG_SNAPPY, rest)) => snap::raw::Decoder::new()
            .decompress_vec(rest)
            .map_err(|e| EngineError::Storage(format!("decompress: {}", e))),
        _ => Err(EngineError::Storage(
            "unrecognised value encoding".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use tempfile::tempdir;

    fn store_config(path: &Path) -> StorageConfig {
        StorageConfig {
            path: path.to_path_buf(),
            ..Default::default()
        }
    }

    fn sample_resource() -> Resource {
        Resource::new("http://example.com/a.bin", &DownloadConfig::default())
    }

    #[tokio::test]
    async fn raw_round_trip() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(&store_config(dir.path())).await.unwrap();

        assert!(store.get("Resource|missing").await.unwrap().is_none());

        store.put("Resource|a", b"payload").await.unwrap();
        assert_eq!(
            store.get("Resource|a").await.unwrap().unwrap(),
            b"payload"
        );
        store.close().await;
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = LocalStore::open(&store_config(dir.path())).await.unwrap();
            store.put("k", b"v").await.unwrap();
            store.close().await;
        }
        let store = LocalStore::open(&store_config(dir.path())).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"v");
        store.close().await;
    }

    #[tokio::test]
    async fn uncompressed_values_round_trip() {
        let dir = tempdir().unwrap();
        let mut config = store_config(dir.path());
        config.compression = Compression::None;
        let store = LocalStore::open(&config).await.unwrap();
        store.put("k", b"uncompressed").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"uncompressed");
        store.close().await;
    }

    #[tokio::test]
    async fn compression_change_between_runs_is_readable() {
        let dir = tempdir().unwrap();
        let mut config = store_config(dir.path());
        config.compression = Compression::Snappy;
        {
            let store = LocalStore::open(&config).await.unwrap();
            store.put("k", b"written snappy").await.unwrap();
            store.close().await;
        }
        config.compression = Compression::None;
        let store = LocalStore::open(&config).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"written snappy");
        store.close().await;
    }

    #[tokio::test]
    async fn missing_storage_directory_fails_open() {
        let dir = tempdir().unwrap();
        let config = store_config(&dir.path().join("nope"));
        assert!(LocalStore::open(&config).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_database_fails_without_recovery() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(DB_FILENAME), b"this is not a database").unwrap();

        let config = store_config(dir.path());
        assert!(LocalStore::open(&config).await.is_err());
    }

    #[tokio::test]
    async fn corrupt_database_recovers_when_enabled() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(DB_FILENAME), b"this is not a database").unwrap();

        let mut config = store_config(dir.path());
        config.recovery = true;
        let store = LocalStore::open(&config).await.unwrap();
        store.put("k", b"fresh").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"fresh");
        store.close().await;

        // the damaged file was moved aside, not destroyed
        let corrupt = dir.path().join(format!("{}.corrupt", DB_FILENAME));
        assert!(corrupt.exists());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(&store_config(dir.path())).await.unwrap();
        store.close().await;
        store.close().await;
        assert!(store.get("k").await.is_err());
    }

    #[tokio::test]
    async fn indexed_put_is_atomic_and_listable() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(&store_config(dir.path())).await.unwrap();

        let resource = sample_resource();
        let mut index = store.get_index("downloads").await.unwrap();
        assert!(index.ids.is_empty());

        index.ids.push(resource.id.clone());
        store.put_resource_indexed(&resource, &index).await.unwrap();

        let index = store.get_index("downloads").await.unwrap();
        assert_eq!(index.ids, vec![resource.id.clone()]);

        let listed = store
            .list_resources(&index, None::<fn(&Resource) -> bool>)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, resource.id);
        store.close().await;
    }

    #[tokio::test]
    async fn dangling_index_entry_is_a_consistency_fault() {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(&store_config(dir.path())).await.unwrap();

        let mut index = Index::new("downloads");
        index.ids.push("ghost".to_string());
        store.put_index(&index).await.unwrap();

        let err = store
            .list_resources(&index, None::<fn(&Resource) -> bool>)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing resource"));
        store.close().await;
    }
}
