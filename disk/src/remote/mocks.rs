//! A scripted [Client] serving an in-memory object, and a [Store] wrapper that injects faults.

use crate::{
    client::{Client, Head, Partial},
    Error,
};
use bytes::Bytes;
use std::{
    collections::BTreeSet,
    io,
    sync::{Arc, Mutex},
};
use streamdisk_storage::{metadata::Meta, store::Store};
use tokio::sync::Semaphore;

/// How the remote answers `HEAD`.
#[derive(Clone, Debug)]
pub enum HeadMode {
    /// Reply 200 with `Content-Length`.
    Length,
    /// Reply 200 without `Content-Length`.
    NoLength,
    /// Reply with the given status.
    Status(u16),
}

/// Knobs controlling how the mock answers.
#[derive(Clone, Debug)]
pub struct Behavior {
    pub head: HeadMode,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Reply 200 (ignoring `Range`) when false.
    pub ranges: bool,
    /// Drop the final byte of every partial body.
    pub truncate: bool,
    /// Report `*` instead of the total in `Content-Range`.
    pub unknown_total: bool,
    /// Shift the reported `Content-Range` span by one byte.
    pub misreport_span: bool,
    /// Override the reply status of ranged requests past the first byte.
    pub status: Option<u16>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            head: HeadMode::Length,
            etag: Some("\"v1\"".into()),
            last_modified: None,
            ranges: true,
            truncate: false,
            unknown_total: false,
            misreport_span: false,
            status: None,
        }
    }
}

struct Inner {
    data: Mutex<Bytes>,
    behavior: Mutex<Behavior>,
    heads: Mutex<usize>,
    requests: Mutex<Vec<(u64, u64, Option<String>)>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

/// In-memory remote object.
#[derive(Clone)]
pub struct Remote {
    inner: Arc<Inner>,
}

impl Remote {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self::with_behavior(data, Behavior::default())
    }

    pub fn with_behavior(data: impl Into<Bytes>, behavior: Behavior) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(data.into()),
                behavior: Mutex::new(behavior),
                heads: Mutex::new(0),
                requests: Mutex::new(Vec::new()),
                gate: Mutex::new(None),
            }),
        }
    }

    /// Deterministic content of `len` bytes.
    pub fn pattern(len: usize) -> Bytes {
        (0..len)
            .map(|i| (i % 251) as u8 ^ (i / 251) as u8)
            .collect::<Vec<_>>()
            .into()
    }

    pub fn data(&self) -> Bytes {
        self.inner.data.lock().unwrap().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.inner.behavior.lock().unwrap());
    }

    /// Hold every ranged request (except the `0-0` probe) until [Remote::release] is called.
    pub fn hold(&self) {
        *self.inner.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `n` held requests proceed.
    pub fn release(&self, n: usize) {
        if let Some(gate) = self.inner.gate.lock().unwrap().as_ref() {
            gate.add_permits(n);
        }
    }

    /// Stop holding requests.
    pub fn open(&self) {
        if let Some(gate) = self.inner.gate.lock().unwrap().take() {
            gate.add_permits(1 << 20);
        }
    }

    pub fn heads(&self) -> usize {
        *self.inner.heads.lock().unwrap()
    }

    /// Ranged requests issued so far, excluding the `0-0` probe.
    pub fn fetches(&self) -> Vec<(u64, u64)> {
        self.inner
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(start, end, _)| !(*start == 0 && *end == 0))
            .map(|(start, end, _)| (*start, *end))
            .collect()
    }

    /// `If-Range` values sent with each ranged request.
    pub fn if_ranges(&self) -> Vec<Option<String>> {
        self.inner
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, if_range)| if_range.clone())
            .collect()
    }

    /// Yield until at least `n` fetches have been issued.
    pub async fn wait_for_fetches(&self, n: usize) {
        while self.fetches().len() < n {
            tokio::task::yield_now().await;
        }
    }
}

impl Client for Remote {
    async fn head(&self) -> Result<Head, Error> {
        *self.inner.heads.lock().unwrap() += 1;
        let len = self.data().len() as u64;
        let behavior = self.inner.behavior.lock().unwrap().clone();
        let (status, content_length) = match behavior.head {
            HeadMode::Length => (200, Some(len)),
            HeadMode::NoLength => (200, None),
            HeadMode::Status(status) => (status, None),
        };
        Ok(Head {
            status,
            content_length,
            etag: behavior.etag,
            last_modified: behavior.last_modified,
            accept_ranges: behavior.ranges.then(|| "bytes".to_string()),
        })
    }

    async fn get_range(
        &self,
        start: u64,
        end: u64,
        if_range: Option<String>,
    ) -> Result<Partial, Error> {
        self.inner
            .requests
            .lock()
            .unwrap()
            .push((start, end, if_range.clone()));
        let probe = start == 0 && end == 0;
        if !probe {
            let gate = self.inner.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.acquire().await.unwrap().forget();
            }
        }

        let data = self.data();
        let behavior = self.inner.behavior.lock().unwrap().clone();
        let total = data.len() as u64;
        if !behavior.ranges {
            return Ok(Partial {
                status: 200,
                content_range: None,
                etag: behavior.etag,
                last_modified: behavior.last_modified,
                body: Bytes::new(),
            });
        }
        if start >= total {
            return Ok(Partial {
                status: 416,
                content_range: Some(format!("bytes */{total}")),
                etag: behavior.etag,
                last_modified: behavior.last_modified,
                body: Bytes::new(),
            });
        }
        if let (false, Some(status)) = (probe, behavior.status) {
            return Ok(Partial {
                status,
                content_range: None,
                etag: behavior.etag,
                last_modified: behavior.last_modified,
                body: Bytes::new(),
            });
        }

        // A stale If-Range validator gets the whole object back.
        if let (Some(sent), Some(current)) = (&if_range, &behavior.etag) {
            if sent != current {
                return Ok(Partial {
                    status: 200,
                    content_range: None,
                    etag: behavior.etag,
                    last_modified: behavior.last_modified,
                    body: Bytes::new(),
                });
            }
        }

        let end = end.min(total - 1);
        let mut body = data.slice(start as usize..=end as usize);
        if behavior.truncate && !probe {
            body.truncate(body.len() - 1);
        }
        let shift = u64::from(behavior.misreport_span && !probe);
        let total = if behavior.unknown_total {
            "*".to_string()
        } else {
            total.to_string()
        };
        Ok(Partial {
            status: 206,
            content_range: Some(format!("bytes {}-{}/{total}", start + shift, end + shift)),
            etag: behavior.etag,
            last_modified: behavior.last_modified,
            body,
        })
    }
}

/// Wraps a [Store], failing reads of chosen blocks and optionally holding removals.
#[derive(Clone)]
pub struct Faulty<S: Store> {
    store: S,
    unreadable: Arc<Mutex<BTreeSet<u64>>>,
    deletes: Arc<Mutex<usize>>,
    gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl<S: Store> Faulty<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            unreadable: Arc::default(),
            deletes: Arc::default(),
            gate: Arc::default(),
        }
    }

    /// Fail every read of block `index` until [Faulty::repair] is called.
    pub fn break_block(&self, index: u64) {
        self.unreadable.lock().unwrap().insert(index);
    }

    pub fn repair(&self, index: u64) {
        self.unreadable.lock().unwrap().remove(&index);
    }

    /// Hold every removal until [Faulty::open_deletes] is called.
    pub fn hold_deletes(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_deletes(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(1 << 20);
        }
    }

    /// Removals started so far.
    pub fn deletes(&self) -> usize {
        *self.deletes.lock().unwrap()
    }

    /// Yield until at least `n` removals have started.
    pub async fn wait_for_deletes(&self, n: usize) {
        while self.deletes() < n {
            tokio::task::yield_now().await;
        }
    }
}

impl<S: Store> Store for Faulty<S> {
    async fn get(&self, index: u64) -> Result<Option<Bytes>, streamdisk_storage::Error> {
        if self.unreadable.lock().unwrap().contains(&index) {
            return Err(io::Error::other("unreadable block").into());
        }
        self.store.get(index).await
    }

    async fn put(&self, index: u64, data: Bytes) -> Result<(), streamdisk_storage::Error> {
        self.store.put(index, data).await
    }

    async fn delete(&self, index: u64) -> Result<(), streamdisk_storage::Error> {
        *self.deletes.lock().unwrap() += 1;
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        self.store.delete(index).await
    }

    async fn usage(&self) -> Result<u64, streamdisk_storage::Error> {
        self.store.usage().await
    }

    async fn indices(&self) -> Result<BTreeSet<u64>, streamdisk_storage::Error> {
        self.store.indices().await
    }

    async fn load_meta(&self) -> Result<Option<Meta>, streamdisk_storage::Error> {
        self.store.load_meta().await
    }

    async fn store_meta(&self, meta: Meta) -> Result<(), streamdisk_storage::Error> {
        self.store.store_meta(meta).await
    }

    async fn clear(&self) -> Result<(), streamdisk_storage::Error> {
        self.store.clear().await
    }

    async fn close(&self) -> Result<(), streamdisk_storage::Error> {
        self.store.close().await
    }
}
