//! Storage
//!
//! Resource persistence on an ordered key-value store. Keys partition the
//! data along the domain model (`Resource|<id>`, `Index|downloads`); the hot
//! downloads index lists every known resource id so enumeration never scans
//! the whole store.

pub mod local;

pub use local::LocalStore;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::model::Resource;

/// Well-known id of the downloads index
pub const DOWNLOADS_INDEX: &str = "downloads";

/// A persistable record addressed by type name and identifier
pub trait Record: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_NAME: &'static str;

    fn identifier(&self) -> &str;
}

impl Record for Resource {
    const TYPE_NAME: &'static str = "Resource";

    fn identifier(&self) -> &str {
        &self.id
    }
}

/// The index record listing resource ids, insertion-ordered.
///
/// Index records are always hot; they avoid iterating over the entire store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    /// Name of the index, unique as the key for this record
    #[serde(rename = "name")]
    pub id: String,
    /// Ids of the resources in the store
    pub ids: Vec<String>,
}

impl Index {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ids: Vec::new(),
        }
    }
}

impl Record for Index {
    const TYPE_NAME: &'static str = "Index";

    fn identifier(&self) -> &str {
        &self.id
    }
}

/// Key layout `<TypeName>|<id>`
pub(crate) fn record_key<R: Record>(id: &str) -> String {
    format!("{}|{}", R::TYPE_NAME, id)
}

/// Storage facade used by the engine and the REST adapter.
///
/// The read-modify-write on the downloads index is not atomic at the store
/// level, so this facade serialises index mutations behind a mutex; the
/// resource/index pair itself lands in one atomic batch.
pub struct StorageService {
    store: Arc<LocalStore>,
    index_lock: tokio::sync::Mutex<()>,
}

impl StorageService {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self {
            store,
            index_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Upsert a resource and move its id to the tail of the downloads index
    pub async fn update_resource(&self, resource: &Resource) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.store.get_index(DOWNLOADS_INDEX).await?;
        index.ids.retain(|id| id != &resource.id);
        index.ids.push(resource.id.clone());
        self.store.put_resource_indexed(resource, &index).await
    }

    pub async fn get_resource(&self, id: &str) -> Result<(Option<Resource>, Index)> {
        let resource = self.store.get_resource(id).await?;
        let index = self.store.get_index(DOWNLOADS_INDEX).await?;
        Ok((resource, index))
    }

    pub async fn list_resources<F>(&self, filter: Option<F>) -> Result<Vec<Resource>>
    where
        F: Fn(&Resource) -> bool,
    {
        let index = self.store.get_index(DOWNLOADS_INDEX).await?;
        self.store.list_resources(&index, filter).await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
