//! Metrics for [super::Disk].

use prometheus_client::{metrics::gauge::Gauge, registry::Registry};

/// Metrics for [super::Disk].
///
/// All values are gauges so that [Telemetry::reset] can zero them when the cache is cleared.
#[derive(Default)]
pub struct Telemetry {
    /// Block requests served, whether hit, missed, or joined.
    pub block_requests: Gauge,
    /// Block requests served from the store.
    pub hits: Gauge,
    /// Block requests that started a download.
    pub misses: Gauge,
    /// Block requests that joined a download already in flight.
    pub joins: Gauge,
    /// Ranged requests issued.
    pub requests: Gauge,
    /// Bytes received in block bodies.
    pub bytes_downloaded: Gauge,
    /// Downloads currently in flight.
    pub inflight: Gauge,
    /// Blocks evicted to honor the cache limit.
    pub evictions: Gauge,
    /// Blocks re-fetched because their blob was missing or damaged.
    pub heals: Gauge,
    /// First byte of the most recent download.
    pub last_fetch_start: Gauge,
    /// End (exclusive) of the most recent download.
    pub last_fetch_end: Gauge,
    /// Duration of the most recent download, in milliseconds.
    pub last_fetch_ms: Gauge,
}

impl Telemetry {
    /// Register metrics with `registry` under the `streamdisk` prefix.
    pub fn register(&self, registry: &mut Registry) {
        let registry = registry.sub_registry_with_prefix("streamdisk");
        registry.register(
            "block_requests",
            "Block requests served",
            self.block_requests.clone(),
        );
        registry.register("hits", "Block requests served from the store", self.hits.clone());
        registry.register(
            "misses",
            "Block requests that started a download",
            self.misses.clone(),
        );
        registry.register(
            "joins",
            "Block requests that joined a download already in flight",
            self.joins.clone(),
        );
        registry.register("requests", "Ranged requests issued", self.requests.clone());
        registry.register(
            "bytes_downloaded",
            "Bytes received in block bodies",
            self.bytes_downloaded.clone(),
        );
        registry.register("inflight", "Downloads in flight", self.inflight.clone());
        registry.register(
            "evictions",
            "Blocks evicted to honor the cache limit",
            self.evictions.clone(),
        );
        registry.register("heals", "Blocks re-fetched after damage", self.heals.clone());
        registry.register(
            "last_fetch_start",
            "First byte of the most recent download",
            self.last_fetch_start.clone(),
        );
        registry.register(
            "last_fetch_end",
            "End of the most recent download",
            self.last_fetch_end.clone(),
        );
        registry.register(
            "last_fetch_ms",
            "Duration of the most recent download",
            self.last_fetch_ms.clone(),
        );
    }

    fn gauges(&self) -> [&Gauge; 12] {
        [
            &self.block_requests,
            &self.hits,
            &self.misses,
            &self.joins,
            &self.requests,
            &self.bytes_downloaded,
            &self.inflight,
            &self.evictions,
            &self.heals,
            &self.last_fetch_start,
            &self.last_fetch_end,
            &self.last_fetch_ms,
        ]
    }

    /// Zero every metric.
    pub fn reset(&self) {
        for gauge in self.gauges() {
            gauge.set(0);
        }
    }
}

/// Point-in-time view of a [super::Disk].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub size: u64,
    pub chunk_size: u64,
    pub cache_limit: Option<u64>,
    pub cached_bytes: u64,
    pub block_requests: u64,
    pub hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub requests: u64,
    pub bytes_downloaded: u64,
    pub inflight: u64,
    pub evictions: u64,
    pub heals: u64,
    /// `[start, end)` of the most recent download, if any.
    pub last_fetch: Option<(u64, u64)>,
    pub last_fetch_ms: u64,
}

fn value(gauge: &Gauge) -> u64 {
    gauge.get().max(0) as u64
}

impl Telemetry {
    pub(super) fn snapshot(
        &self,
        size: u64,
        chunk_size: u64,
        cache_limit: Option<u64>,
        cached_bytes: u64,
    ) -> Snapshot {
        let start = value(&self.last_fetch_start);
        let end = value(&self.last_fetch_end);
        Snapshot {
            size,
            chunk_size,
            cache_limit,
            cached_bytes,
            block_requests: value(&self.block_requests),
            hits: value(&self.hits),
            misses: value(&self.misses),
            joins: value(&self.joins),
            requests: value(&self.requests),
            bytes_downloaded: value(&self.bytes_downloaded),
            inflight: value(&self.inflight),
            evictions: value(&self.evictions),
            heals: value(&self.heals),
            last_fetch: (end > start).then_some((start, end)),
            last_fetch_ms: value(&self.last_fetch_ms),
        }
    }
}
