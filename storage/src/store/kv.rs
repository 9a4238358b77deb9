//! A [Store] that keeps blocks as values in a key-value [Database].
//!
//! All keys of a store share a namespace prefix:
//!
//! ```text
//! <namespace>/meta        the [Meta] record
//! <namespace>/index       block index -> blob length, as JSON
//! <namespace>/block/<n>   the blob for block n
//! ```
//!
//! Usage and coverage are answered from the in-memory copy of the block index rather than by
//! scanning values. On [Kv::init], the persisted index is reconciled against the keys actually
//! present, so entries for values lost out-of-band are dropped.

use super::Store;
use crate::{metadata::Meta, Error};
use bytes::Bytes;
use futures::lock::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::Arc,
};
use tracing::{debug, warn};

/// A durable key-value blob store.
pub trait Database: Clone + Send + Sync + 'static {
    /// Fetch the value stored at `key`, if any.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>, Error>> + Send;

    /// Store `value` at `key`, replacing any existing value.
    fn put(&self, key: &str, value: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove the value at `key`. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), Error>> + Send;

    /// Return all keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, Error>> + Send;
}

/// In-memory [Database], shared between clones.
#[derive(Clone, Default)]
pub struct Memory {
    values: Arc<Mutex<BTreeMap<String, Bytes>>>,
}

impl Database for Memory {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), Error> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.values.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let values = self.values.lock().await;
        Ok(values
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Key-value implementation of [Store].
#[derive(Clone)]
pub struct Kv<D: Database> {
    db: D,
    namespace: String,

    /// Block index to blob length.
    index: Arc<Mutex<BTreeMap<u64, u64>>>,
}

impl<D: Database> Kv<D> {
    /// Open (or create) the store kept under `namespace` in `db`.
    pub async fn init(db: D, namespace: impl Into<String>) -> Result<Self, Error> {
        let namespace = namespace.into();
        let store = Self {
            db,
            namespace,
            index: Arc::new(Mutex::new(BTreeMap::new())),
        };

        // Load the persisted index
        let mut index: BTreeMap<u64, u64> = match store.db.get(&store.index_key()).await? {
            Some(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!(?err, "discarding undecodable block index");
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };

        // Reconcile with the blocks actually present
        let prefix = store.block_prefix();
        let mut present = BTreeSet::new();
        for key in store.db.keys(&prefix).await? {
            let block = key
                .strip_prefix(&prefix)
                .and_then(|name| name.parse::<u64>().ok())
                .ok_or_else(|| Error::InvalidBlockName(key.clone()))?;
            present.insert(block);
        }
        let before = index.len();
        index.retain(|block, _| present.contains(block));
        let mut changed = index.len() != before;
        for block in present {
            if index.contains_key(&block) {
                continue;
            }
            if let Some(value) = store.db.get(&store.block_key(block)).await? {
                index.insert(block, value.len() as u64);
                changed = true;
            }
        }
        if changed {
            debug!(blocks = index.len(), "reconciled block index");
            store.persist_index(&index).await?;
        }
        *store.index.lock().await = index;
        Ok(store)
    }

    fn meta_key(&self) -> String {
        format!("{}/meta", self.namespace)
    }

    fn index_key(&self) -> String {
        format!("{}/index", self.namespace)
    }

    fn block_prefix(&self) -> String {
        format!("{}/block/", self.namespace)
    }

    fn block_key(&self, index: u64) -> String {
        format!("{}{index}", self.block_prefix())
    }

    async fn persist_index(&self, index: &BTreeMap<u64, u64>) -> Result<(), Error> {
        let raw = serde_json::to_vec(index)?;
        self.db.put(&self.index_key(), Bytes::from(raw)).await
    }
}

impl<D: Database> Store for Kv<D> {
    async fn get(&self, index: u64) -> Result<Option<Bytes>, Error> {
        self.db.get(&self.block_key(index)).await
    }

    async fn put(&self, index: u64, data: Bytes) -> Result<(), Error> {
        let len = data.len() as u64;
        let mut blocks = self.index.lock().await;
        self.db.put(&self.block_key(index), data).await?;
        blocks.insert(index, len);
        self.persist_index(&blocks).await
    }

    async fn delete(&self, index: u64) -> Result<(), Error> {
        let mut blocks = self.index.lock().await;
        self.db.delete(&self.block_key(index)).await?;
        if blocks.remove(&index).is_some() {
            self.persist_index(&blocks).await?;
        }
        Ok(())
    }

    async fn usage(&self) -> Result<u64, Error> {
        Ok(self.index.lock().await.values().sum())
    }

    async fn indices(&self) -> Result<BTreeSet<u64>, Error> {
        Ok(self.index.lock().await.keys().copied().collect())
    }

    async fn load_meta(&self) -> Result<Option<Meta>, Error> {
        Ok(self
            .db
            .get(&self.meta_key())
            .await?
            .and_then(|raw| Meta::decode(&raw)))
    }

    async fn store_meta(&self, meta: Meta) -> Result<(), Error> {
        let raw = meta.encode()?;
        self.db.put(&self.meta_key(), Bytes::from(raw)).await
    }

    async fn clear(&self) -> Result<(), Error> {
        let mut blocks = self.index.lock().await;
        let prefix = format!("{}/", self.namespace);
        for key in self.db.keys(&prefix).await? {
            self.db.delete(&key).await?;
        }
        blocks.clear();
        debug!(namespace = %self.namespace, "cleared key-value store");
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}
