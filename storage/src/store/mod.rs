//! Persist cached blocks and their [Meta] record.
//!
//! A [Store] holds one blob per block index plus a single [Meta] record. Two implementations are
//! provided:
//!
//! - [directory::Directory]: one file per block under a directory, with the record kept in a
//!   sibling `meta.json`.
//! - [kv::Kv]: blocks and the record kept as values in a key-value [kv::Database], with usage
//!   derived from the store's own block index.
//!
//! Consumers must only depend on the [Store] contract and never on the physical layout of either
//! implementation.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use streamdisk_storage::store::{kv::{Kv, Memory}, Store};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let store = Kv::init(Memory::default(), "image").await.unwrap();
//! store.put(3, Bytes::from_static(b"hello")).await.unwrap();
//! assert_eq!(store.get(3).await.unwrap().unwrap(), Bytes::from_static(b"hello"));
//! assert_eq!(store.usage().await.unwrap(), 5);
//! # });
//! ```

use crate::{metadata::Meta, Error};
use bytes::Bytes;
use std::{collections::BTreeSet, future::Future};

pub mod directory;
pub mod kv;

/// Durable storage for the blocks of a single cached object.
pub trait Store: Clone + Send + Sync + 'static {
    /// Fetch the blob stored for `index`, if any.
    fn get(&self, index: u64) -> impl Future<Output = Result<Option<Bytes>, Error>> + Send;

    /// Store `data` as the blob for `index`, replacing any existing blob.
    ///
    /// An Ok result indicates the blob is durably written.
    fn put(&self, index: u64, data: Bytes) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove the blob for `index`. Removing a missing blob is not an error.
    fn delete(&self, index: u64) -> impl Future<Output = Result<(), Error>> + Send;

    /// Total bytes of stored blobs.
    fn usage(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Indices of all stored blobs.
    fn indices(&self) -> impl Future<Output = Result<BTreeSet<u64>, Error>> + Send;

    /// Load the persisted [Meta] record. A missing or undecodable record is `None`.
    fn load_meta(&self) -> impl Future<Output = Result<Option<Meta>, Error>> + Send;

    /// Persist `meta`, replacing the previous record.
    fn store_meta(&self, meta: Meta) -> impl Future<Output = Result<(), Error>> + Send;

    /// Remove all blobs and the [Meta] record.
    fn clear(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Release any resources held by the store.
    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send;
}
