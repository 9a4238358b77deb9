//! A [Store] that keeps one file per block in a directory.
//!
//! Layout under the configured root:
//!
//! ```text
//! <root>/meta.json        the [Meta] record
//! <root>/blocks/<n>.bin   the blob for block n
//! ```
//!
//! Writes go to a `.tmp` sibling that is renamed into place, so a crash never leaves a
//! partially written blob or record under its final name.

use super::Store;
use crate::{metadata::Meta, Error};
use bytes::Bytes;
use std::{
    collections::BTreeSet,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{fs, sync::Mutex};
use tracing::debug;

const BLOCKS_DIR: &str = "blocks";
const META_FILE: &str = "meta.json";
const BLOCK_EXT: &str = "bin";
const TMP_EXT: &str = "tmp";

/// Directory-of-blobs implementation of [Store].
#[derive(Clone)]
pub struct Directory {
    root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Directory {
    /// Open (or create) a store rooted at `root`.
    pub async fn init(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOCKS_DIR)).await?;
        Ok(Self {
            root,
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// The directory this store was opened at.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blocks(&self) -> PathBuf {
        self.root.join(BLOCKS_DIR)
    }

    fn block_path(&self, index: u64) -> PathBuf {
        self.blocks().join(format!("{index}.{BLOCK_EXT}"))
    }

    fn meta_path(&self) -> PathBuf {
        self.root.join(META_FILE)
    }

    async fn list(&self) -> Result<Vec<(u64, u64)>, Error> {
        let mut entries = match fs::read_dir(self.blocks()).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut blocks = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(BLOCK_EXT) => {}
                Some(TMP_EXT) => continue,
                _ => return Err(Error::InvalidBlockName(name)),
            }
            let index = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
                .ok_or_else(|| Error::InvalidBlockName(name.clone()))?;
            let len = entry.metadata().await?.len();
            blocks.push((index, len));
        }
        Ok(blocks)
    }
}

/// Write `data` to `path` by way of a temporary sibling.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), Error> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".");
    tmp.push(TMP_EXT);
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl Store for Directory {
    async fn get(&self, index: u64) -> Result<Option<Bytes>, Error> {
        match fs::read(self.block_path(index)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, index: u64, data: Bytes) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        fs::create_dir_all(self.blocks()).await?;
        write_atomic(&self.block_path(index), &data).await
    }

    async fn delete(&self, index: u64) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        remove_if_exists(&self.block_path(index)).await
    }

    async fn usage(&self) -> Result<u64, Error> {
        Ok(self.list().await?.into_iter().map(|(_, len)| len).sum())
    }

    async fn indices(&self) -> Result<BTreeSet<u64>, Error> {
        Ok(self.list().await?.into_iter().map(|(index, _)| index).collect())
    }

    async fn load_meta(&self) -> Result<Option<Meta>, Error> {
        let raw = match fs::read(self.meta_path()).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Meta::decode(&raw))
    }

    async fn store_meta(&self, meta: Meta) -> Result<(), Error> {
        let raw = meta.encode()?;
        let _guard = self.lock.lock().await;
        write_atomic(&self.meta_path(), &raw).await
    }

    async fn clear(&self) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        match fs::remove_dir_all(self.blocks()).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        remove_if_exists(&self.meta_path()).await?;
        fs::create_dir_all(self.blocks()).await?;
        debug!(root = ?self.root, "cleared directory store");
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        // Every write is durable once it returns.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metadata::{Identity, Validators},
        store::tests::run_store_tests,
    };
    use rand::Rng;
    use std::env;

    fn temp_root() -> PathBuf {
        let mut rng = rand::thread_rng();
        env::temp_dir().join(format!("streamdisk_directory_{}", rng.gen::<u64>()))
    }

    #[tokio::test]
    async fn test_directory_store() {
        let root = temp_root();
        let store = Directory::init(&root).await.unwrap();
        run_store_tests(store).await;
        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn test_directory_reopen() {
        let root = temp_root();
        let store = Directory::init(&root).await.unwrap();
        store.put(5, Bytes::from_static(b"block")).await.unwrap();
        let meta = Meta::new(
            Identity::new("image", "1", "range"),
            Validators {
                size_bytes: 4096,
                ..Default::default()
            },
            512,
        );
        store.store_meta(meta.clone()).await.unwrap();
        store.close().await.unwrap();

        // Everything survives a reopen
        let store = Directory::init(&root).await.unwrap();
        assert_eq!(store.get(5).await.unwrap().unwrap(), &b"block"[..]);
        assert_eq!(store.load_meta().await.unwrap().unwrap(), meta);
        assert!(root.join(BLOCKS_DIR).join("5.bin").exists());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn test_directory_corrupt_meta() {
        let root = temp_root();
        let store = Directory::init(&root).await.unwrap();
        std::fs::write(root.join(META_FILE), b"{ not json").unwrap();
        assert!(store.load_meta().await.unwrap().is_none());
        std::fs::remove_dir_all(root).unwrap();
    }

    #[tokio::test]
    async fn test_directory_skips_partial_writes() {
        let root = temp_root();
        let store = Directory::init(&root).await.unwrap();
        store.put(1, Bytes::from_static(b"abcd")).await.unwrap();

        // A leftover temporary file is not a block
        std::fs::write(root.join(BLOCKS_DIR).join("2.bin.tmp"), b"xx").unwrap();
        assert_eq!(store.indices().await.unwrap(), BTreeSet::from_iter([1u64]));
        assert_eq!(store.usage().await.unwrap(), 4);

        // A foreign file is reported
        std::fs::write(root.join(BLOCKS_DIR).join("junk.bin"), b"xx").unwrap();
        assert!(matches!(
            store.indices().await,
            Err(Error::InvalidBlockName(name)) if name == "junk.bin"
        ));
        std::fs::remove_dir_all(root).unwrap();
    }
}
