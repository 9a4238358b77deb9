use super::{
    metrics::{Snapshot, Telemetry},
    Config,
};
use crate::{
    client::Client,
    probe::{self, parse_content_range, Probe},
    Error,
};
use bytes::Bytes;
use futures::{
    future::{BoxFuture, Shared},
    lock::Mutex,
    FutureExt,
};
use prometheus_client::registry::Registry;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::Semaphore;
use streamdisk_storage::{
    metadata::{now_ms, Identity, Meta, Validators, VERSION},
    rset::{ByteRange, RangeSet},
    store::Store,
};
use tracing::{debug, info, warn};

/// A download shared by every reader of the same block.
type Fetch = Shared<BoxFuture<'static, Result<Bytes, Arc<Error>>>>;

/// Mutable state of a [Disk].
///
/// Never held across an await point.
struct State {
    covered: RangeSet,
    access_counter: u64,
    last_access: BTreeMap<u64, u64>,
    created_at_ms: u64,
    last_accessed_at_ms: u64,

    /// Incremented on every clear.
    generation: u64,
    /// Identifies each download so that only its own entry is removed when it settles.
    next_fetch: u64,
    inflight: HashMap<u64, (u64, Fetch)>,

    /// End of the previous read, used to detect sequential access.
    last_read_end: Option<u64>,
}

impl State {
    fn new(now: u64) -> Self {
        Self {
            covered: RangeSet::new(),
            access_counter: 0,
            last_access: BTreeMap::new(),
            created_at_ms: now,
            last_accessed_at_ms: now,
            generation: 0,
            next_fetch: 0,
            inflight: HashMap::new(),
            last_read_end: None,
        }
    }

    /// Record a use of block `index`.
    fn touch(&mut self, index: u64) {
        self.access_counter += 1;
        self.last_access.insert(index, self.access_counter);
        self.last_accessed_at_ms = now_ms();
    }
}

struct Inner<S: Store, C: Client> {
    client: C,
    store: S,
    probe: Probe,
    identity: Identity,
    validators: Validators,
    chunk_size: u64,
    cache_limit: Option<u64>,
    prefetch: usize,
    telemetry: Telemetry,

    state: Mutex<State>,
    /// Serializes metadata writes so they land in the order their snapshots were taken.
    meta_lock: Mutex<()>,
    /// Held across every blob write or removal and the coverage change that accompanies it.
    ///
    /// Coverage only changes while this is held, so a block covered under the lock stays covered
    /// until it is released. Acquired before `state`, never after.
    blob_lock: Mutex<()>,
    /// Bounds the ranged requests outstanding at once.
    fetch_permits: Semaphore,
    closed: AtomicBool,
}

/// A read-only, random-access view of a remote object, cached block by block in a [Store].
///
/// Cloning a [Disk] is cheap and every clone shares the same cache.
#[derive(Clone)]
pub struct Disk<S: Store, C: Client> {
    inner: Arc<Inner<S, C>>,
}

impl<S: Store, C: Client> Disk<S, C> {
    /// Probe the object served by `client` and open (or create) its cache in `store`.
    ///
    /// A persisted cache is reused only if it was created for the same identity, validators,
    /// and chunk size. Otherwise `store` is cleared.
    pub async fn open(client: C, store: S, config: Config) -> Result<Self, Error> {
        config.validate()?;
        let probe = probe::probe(&client).await?;
        let validators = probe.validators();

        // Decide whether the persisted cache may be reused
        let mut state = State::new(now_ms());
        let reused = match store.load_meta().await? {
            Some(meta) if meta.reusable(&config.identity, &validators, config.chunk_size) => {
                match meta.covered() {
                    Some(covered) => {
                        let highest = meta.chunk_last_access.values().copied().max();
                        state.covered = covered;
                        state.access_counter = meta.access_counter.max(highest.unwrap_or(0));
                        state.last_access = meta.chunk_last_access;
                        state.created_at_ms = meta.created_at_ms;
                        true
                    }
                    None => {
                        warn!("persisted ranges are invalid, discarding cache");
                        false
                    }
                }
            }
            Some(_) => {
                info!("cached copy does not match remote, discarding cache");
                false
            }
            None => false,
        };
        if !reused {
            store.clear().await?;
        }

        let inner = Inner {
            client,
            store,
            probe,
            identity: config.identity,
            validators,
            chunk_size: config.chunk_size,
            cache_limit: config.cache_limit,
            prefetch: config.prefetch,
            telemetry: Telemetry::default(),
            state: Mutex::new(state),
            meta_lock: Mutex::new(()),
            blob_lock: Mutex::new(()),
            fetch_permits: Semaphore::new(config.max_concurrent_fetches),
            closed: AtomicBool::new(false),
        };
        if reused {
            inner.reconcile().await?;
        }
        inner.persist().await?;
        let cached = inner.state.lock().await.covered.total_len();
        info!(
            size = inner.probe.size,
            chunk_size = inner.chunk_size,
            cached,
            reused,
            "opened disk"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Total size of the remote object.
    pub fn size(&self) -> u64 {
        self.inner.probe.size
    }

    pub fn chunk_size(&self) -> u64 {
        self.inner.chunk_size
    }

    pub fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    /// What was learned about the remote object at open.
    pub fn probe(&self) -> &Probe {
        &self.inner.probe
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Fill `buf` with the bytes of the object starting at `offset`.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.inner.read_at(offset, buf).await
    }

    /// Read `len` bytes of the object starting at `offset`.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0; len];
        self.inner.read_at(offset, &mut buf).await?;
        Ok(buf)
    }

    /// Return the contents of block `index`, fetching it if it is not cached.
    pub async fn get_block(&self, index: u64) -> Result<Bytes, Error> {
        self.inner.get_block(index).await
    }

    /// Bytes of the object currently covered by the cache.
    pub async fn cached_bytes(&self) -> u64 {
        self.inner.state.lock().await.covered.total_len()
    }

    pub async fn cached_ranges(&self) -> Vec<ByteRange> {
        self.inner.state.lock().await.covered.ranges().to_vec()
    }

    /// Returns true if block `index` is covered by the cache.
    pub async fn is_cached(&self, index: u64) -> bool {
        if index >= self.inner.block_count() {
            return false;
        }
        let (start, end) = self.inner.block_range(index);
        self.inner
            .state
            .lock()
            .await
            .covered
            .contains_range(start, end)
    }

    /// Current telemetry.
    pub async fn telemetry(&self) -> Snapshot {
        let cached = self.cached_bytes().await;
        self.inner.telemetry.snapshot(
            self.inner.probe.size,
            self.inner.chunk_size,
            self.inner.cache_limit,
            cached,
        )
    }

    /// Register telemetry with `registry`.
    pub fn register(&self, registry: &mut Registry) {
        self.inner.telemetry.register(registry);
    }

    /// Discard every cached block and reset telemetry.
    ///
    /// Downloads already in flight still complete for their callers but leave nothing behind.
    pub async fn clear(&self) -> Result<(), Error> {
        self.inner.ensure_open()?;
        self.inner.clear().await
    }

    /// Persist the current metadata.
    pub async fn flush(&self) -> Result<(), Error> {
        self.inner.ensure_open()?;
        self.inner.persist().await
    }

    /// Persist metadata and release the store. Any later operation fails with [Error::Closed].
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.persist().await?;
        self.inner.store.close().await?;
        debug!("closed disk");
        Ok(())
    }
}

impl<S: Store, C: Client> Inner<S, C> {
    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn block_count(&self) -> u64 {
        self.probe.size.div_ceil(self.chunk_size)
    }

    /// Byte range `[start, end)` of block `index`. The final block may be short.
    fn block_range(&self, index: u64) -> (u64, u64) {
        let start = index.saturating_mul(self.chunk_size);
        let end = start.saturating_add(self.chunk_size).min(self.probe.size);
        (start, end.max(start))
    }

    /// Indices of every block overlapping `covered`.
    fn blocks(&self, covered: &RangeSet) -> Vec<u64> {
        covered
            .ranges()
            .iter()
            .flat_map(|range| range.start / self.chunk_size..range.end.div_ceil(self.chunk_size))
            .collect()
    }

    fn meta(&self, state: &State) -> Meta {
        Meta {
            version: VERSION,
            identity: self.identity.clone(),
            validators: self.validators.clone(),
            chunk_size_bytes: self.chunk_size,
            created_at_ms: state.created_at_ms,
            last_accessed_at_ms: state.last_accessed_at_ms,
            access_counter: state.access_counter,
            chunk_last_access: state.last_access.clone(),
            cached_ranges: state.covered.ranges().to_vec(),
        }
    }

    async fn persist(&self) -> Result<(), Error> {
        let _guard = self.meta_lock.lock().await;
        let meta = {
            let state = self.state.lock().await;
            self.meta(&state)
        };
        self.store.store_meta(meta).await?;
        Ok(())
    }

    /// Drop coverage the store can no longer back and align the ledger with coverage.
    async fn reconcile(&self) -> Result<(), Error> {
        let present = self.store.indices().await?;
        let mut state = self.state.lock().await;
        let mut dropped = 0;
        for index in self.blocks(&state.covered) {
            if !present.contains(&index) {
                let (start, end) = self.block_range(index);
                state.covered.remove(start, end);
                dropped += 1;
            }
        }
        let State {
            covered,
            last_access,
            ..
        } = &mut *state;
        last_access.retain(|index, _| {
            let (start, end) = self.block_range(*index);
            covered.contains_range(start, end)
        });
        for index in self.blocks(covered) {
            last_access.entry(index).or_insert(0);
        }
        if dropped > 0 {
            warn!(dropped, "dropped cached blocks missing from store");
        }
        Ok(())
    }

    async fn read_at(self: &Arc<Self>, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.ensure_open()?;
        let size = self.probe.size;
        let len = buf.len() as u64;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= size)
            .ok_or(Error::OutOfBounds { offset, len, size })?;
        if len == 0 {
            return Ok(());
        }

        // Assemble the read from each block it touches
        let first = offset / self.chunk_size;
        let last = (end - 1) / self.chunk_size;
        for index in first..=last {
            let data = self.get_block(index).await?;
            let (start, _) = self.block_range(index);
            let from = offset.max(start);
            let to = end.min(start + data.len() as u64);
            buf[(from - offset) as usize..(to - offset) as usize]
                .copy_from_slice(&data[(from - start) as usize..(to - start) as usize]);
        }

        // Read ahead if this read continued the previous one
        let sequential = {
            let mut state = self.state.lock().await;
            let sequential = state.last_read_end == Some(offset);
            state.last_read_end = Some(end);
            sequential
        };
        if sequential && self.prefetch > 0 {
            self.read_ahead(last + 1);
        }
        Ok(())
    }

    async fn get_block(self: &Arc<Self>, index: u64) -> Result<Bytes, Error> {
        self.ensure_open()?;
        if index >= self.block_count() {
            return Err(Error::OutOfBounds {
                offset: index.saturating_mul(self.chunk_size),
                len: self.chunk_size,
                size: self.probe.size,
            });
        }
        self.telemetry.block_requests.inc();
        let (start, end) = self.block_range(index);
        let expected = end - start;

        loop {
            // Decide between serving from the store, joining a download, or starting one
            let fetch = {
                let mut state = self.state.lock().await;
                if state.covered.contains_range(start, end) {
                    None
                } else if let Some((_, fetch)) = state.inflight.get(&index) {
                    self.telemetry.joins.inc();
                    Some(fetch.clone())
                } else {
                    let id = state.next_fetch;
                    state.next_fetch += 1;
                    let fetch = self
                        .clone()
                        .fetch(index, id, state.generation)
                        .boxed()
                        .shared();
                    state.inflight.insert(index, (id, fetch.clone()));
                    self.telemetry.misses.inc();
                    self.telemetry.inflight.set(state.inflight.len() as i64);
                    Some(fetch)
                }
            };
            if let Some(fetch) = fetch {
                return fetch.await.map_err(Error::Fetch);
            }

            match self.store.get(index).await {
                Ok(Some(data)) if data.len() as u64 == expected => {
                    self.telemetry.hits.inc();
                    {
                        let mut state = self.state.lock().await;
                        if state.covered.contains_range(start, end) {
                            state.touch(index);
                        }
                    }
                    self.persist().await?;
                    return Ok(data);
                }
                Ok(found) => warn!(
                    index,
                    expected,
                    found = ?found.map(|data| data.len()),
                    "cached block unreadable, healing"
                ),
                Err(err) => warn!(index, ?err, "failed to read cached block, healing"),
            }
            self.heal(index).await?;
        }
    }

    /// Forget block `index` so that the next request for it downloads it again.
    ///
    /// Nothing is forgotten if the block is no longer covered or was refilled since it was found
    /// unreadable.
    async fn heal(&self, index: u64) -> Result<(), Error> {
        let (start, end) = self.block_range(index);
        let blobs = self.blob_lock.lock().await;
        if !self.state.lock().await.covered.contains_range(start, end) {
            return Ok(());
        }
        if matches!(
            self.store.get(index).await,
            Ok(Some(data)) if data.len() as u64 == end - start
        ) {
            return Ok(());
        }
        {
            let mut state = self.state.lock().await;
            state.covered.remove(start, end);
            state.last_access.remove(&index);
        }
        self.telemetry.heals.inc();

        // A failed removal leaves a blob the next download overwrites
        if let Err(err) = self.store.delete(index).await {
            warn!(index, ?err, "failed to remove unreadable block");
        }
        drop(blobs);
        self.persist().await
    }

    /// Download block `index`, cache it, and return it to every waiting reader.
    async fn fetch(
        self: Arc<Self>,
        index: u64,
        id: u64,
        generation: u64,
    ) -> Result<Bytes, Arc<Error>> {
        let result = match self.download(index, generation).await {
            Ok(data) => self.commit(index, generation, data).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            debug!(index, ?err, "fetch failed");
        }

        let mut state = self.state.lock().await;
        if matches!(state.inflight.get(&index), Some((current, _)) if *current == id) {
            state.inflight.remove(&index);
            if state.generation == generation {
                self.telemetry.inflight.set(state.inflight.len() as i64);
            }
        }
        result.map_err(Arc::new)
    }

    /// Request block `index` and verify the response describes exactly that block.
    async fn download(&self, index: u64, generation: u64) -> Result<Bytes, Error> {
        let (start, end) = self.block_range(index);
        let last = end - 1;
        let expected = end - start;
        let (partial, elapsed) = {
            let _permit = self
                .fetch_permits
                .acquire()
                .await
                .map_err(|_| Error::Closed)?;
            self.telemetry.requests.inc();
            let started = Instant::now();
            let partial = self
                .client
                .get_range(start, last, self.probe.if_range())
                .await?;
            (partial, started.elapsed())
        };

        if partial.status != 206 {
            return Err(Error::UnexpectedStatus {
                status: partial.status,
                start,
                end: last,
            });
        }
        if let Some(value) = &partial.content_range {
            let range = parse_content_range(value)?;
            if range.span != Some((start, last))
                || range.total.is_some_and(|total| total != self.probe.size)
            {
                return Err(Error::ContentRangeMismatch {
                    expected: format!("bytes {start}-{last}/{}", self.probe.size),
                    actual: value.clone(),
                });
            }
        }
        if let (Some(expected), Some(actual)) = (&self.probe.etag, &partial.etag) {
            if expected != actual {
                return Err(Error::ValidatorMismatch {
                    expected: Some(expected.clone()),
                    actual: Some(actual.clone()),
                });
            }
        }
        let actual = partial.body.len() as u64;
        if actual != expected {
            return Err(Error::LengthMismatch {
                index,
                expected,
                actual,
            });
        }

        if self.state.lock().await.generation == generation {
            self.telemetry.bytes_downloaded.inc_by(actual as i64);
            self.telemetry.last_fetch_start.set(start as i64);
            self.telemetry.last_fetch_end.set(end as i64);
            self.telemetry
                .last_fetch_ms
                .set(elapsed.as_millis() as i64);
        }
        debug!(index, len = actual, elapsed = ?elapsed, "downloaded block");
        Ok(partial.body)
    }

    /// Persist a downloaded block, unless the cache was cleared since the download began.
    async fn commit(&self, index: u64, generation: u64, data: Bytes) -> Result<Bytes, Error> {
        {
            // Clearing holds the blob lock, so the generation is fixed until it is released
            let _blobs = self.blob_lock.lock().await;
            if self.state.lock().await.generation != generation {
                debug!(index, "cache cleared during download, not caching block");
                return Ok(data);
            }
            self.store.put(index, data.clone()).await?;
            let (start, end) = self.block_range(index);
            let mut state = self.state.lock().await;
            state.covered.insert(start, end);
            state.touch(index);
        }
        self.persist().await?;
        self.evict(index).await?;
        Ok(data)
    }

    /// Evict least recently used blocks (never `protected`) until the cache fits its limit.
    async fn evict(&self, protected: u64) -> Result<(), Error> {
        let Some(limit) = self.cache_limit else {
            return Ok(());
        };
        loop {
            let blobs = self.blob_lock.lock().await;
            let victim = {
                let mut state = self.state.lock().await;
                if state.covered.total_len() <= limit {
                    return Ok(());
                }
                let victim = state
                    .last_access
                    .iter()
                    .filter(|(index, _)| **index != protected)
                    .min_by_key(|(_, counter)| **counter)
                    .map(|(index, _)| *index);
                let Some(victim) = victim else {
                    debug!(protected, limit, "only protected block remains, stopping eviction");
                    return Ok(());
                };
                let (start, end) = self.block_range(victim);
                state.covered.remove(start, end);
                state.last_access.remove(&victim);
                victim
            };
            self.store.delete(victim).await?;
            drop(blobs);
            self.telemetry.evictions.inc();
            debug!(victim, "evicted block");
            self.persist().await?;
        }
    }

    /// Fetch up to `prefetch` blocks starting at `next` in the background.
    fn read_ahead(self: &Arc<Self>, next: u64) {
        let stop = next
            .saturating_add(self.prefetch as u64)
            .min(self.block_count());
        for index in next..stop {
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(err) = inner.prefetch_block(index).await {
                    debug!(index, ?err, "prefetch failed");
                }
            });
        }
    }

    async fn prefetch_block(self: Arc<Self>, index: u64) -> Result<(), Error> {
        {
            let (start, end) = self.block_range(index);
            let state = self.state.lock().await;
            if state.covered.contains_range(start, end) || state.inflight.contains_key(&index) {
                return Ok(());
            }
        }
        self.get_block(index).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), Error> {
        let blobs = self.blob_lock.lock().await;
        let generation = {
            let mut state = self.state.lock().await;
            let generation = state.generation + 1;
            let next_fetch = state.next_fetch;
            *state = State {
                generation,
                next_fetch,
                ..State::new(now_ms())
            };
            generation
        };
        self.store.clear().await?;
        drop(blobs);
        self.telemetry.reset();
        self.persist().await?;
        info!(generation, "cleared cache");
        Ok(())
    }
}
