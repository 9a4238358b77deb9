//! A small versioned record describing a cached remote object.
//!
//! [Meta] is persisted alongside cached blocks so that re-opening the same logical object can
//! cheaply decide whether the blocks on hand may be reused or must be discarded. It carries:
//!
//! - The stable [Identity] of the object (image id, version, delivery type).
//! - The [Validators] observed when the cache was created (size, `ETag`, `Last-Modified`).
//! - The block granularity (`chunkSizeBytes`), fixed for the life of the cache.
//! - The LRU ledger: a monotonically increasing `accessCounter` and the counter value at which
//!   each block was last used.
//! - A snapshot of the covered byte ranges.
//!
//! # Format
//!
//! [Meta] is encoded as a single JSON object:
//!
//! ```text
//! {
//!   "version": 1,
//!   "imageId": "win7", "imageVersion": "sp1", "deliveryType": "range",
//!   "validators": { "sizeBytes": 10485760, "etag": "\"abc\"", "lastModified": "..." },
//!   "chunkSizeBytes": 1048576,
//!   "createdAtMs": 1700000000000, "lastAccessedAtMs": 1700000000000,
//!   "accessCounter": 3,
//!   "chunkLastAccess": { "0": 1, "1": 2, "8": 3 },
//!   "cachedRanges": [ { "start": 0, "end": 2097152 }, { "start": 8388608, "end": 9437184 } ]
//! }
//! ```
//!
//! _A record that cannot be decoded is treated as absent. Metadata is an optimization: losing it
//! only costs a re-download._

use crate::{
    rset::{ByteRange, RangeSet},
    Error,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::debug;

/// Schema version of the persisted [Meta] record.
pub const VERSION: u32 = 1;

/// Stable identity of a cached object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "imageId")]
    pub image_id: String,
    #[serde(rename = "imageVersion")]
    pub version: String,
    #[serde(rename = "deliveryType")]
    pub delivery_type: String,
}

impl Identity {
    pub fn new(
        image_id: impl Into<String>,
        version: impl Into<String>,
        delivery_type: impl Into<String>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            version: version.into(),
            delivery_type: delivery_type.into(),
        }
    }

    /// A stable hex key derived from the identity, suitable as a directory name or namespace.
    ///
    /// Each field is length-prefixed before hashing so that no two distinct identities share a
    /// key.
    pub fn cache_key(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [&self.image_id, &self.version, &self.delivery_type] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

/// Values used to confirm a cached copy still corresponds to the remote object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validators {
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

/// The persisted record for one cached object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub version: u32,
    #[serde(flatten)]
    pub identity: Identity,
    pub validators: Validators,
    pub chunk_size_bytes: u64,
    pub created_at_ms: u64,
    pub last_accessed_at_ms: u64,
    pub access_counter: u64,
    #[serde(default)]
    pub chunk_last_access: BTreeMap<u64, u64>,
    #[serde(default)]
    pub cached_ranges: Vec<ByteRange>,
}

impl Meta {
    /// Create an empty record for a freshly created cache.
    pub fn new(identity: Identity, validators: Validators, chunk_size_bytes: u64) -> Self {
        let now = now_ms();
        Self {
            version: VERSION,
            identity,
            validators,
            chunk_size_bytes,
            created_at_ms: now,
            last_accessed_at_ms: now,
            access_counter: 0,
            chunk_last_access: BTreeMap::new(),
            cached_ranges: Vec::new(),
        }
    }

    /// Returns true if blocks described by this record may be served for an object with the
    /// given identity, validators, and chunk size.
    pub fn reusable(&self, identity: &Identity, validators: &Validators, chunk_size: u64) -> bool {
        self.version == VERSION
            && &self.identity == identity
            && &self.validators == validators
            && self.chunk_size_bytes == chunk_size
    }

    /// Reconstruct the covered [RangeSet], or `None` if the persisted ranges are not something a
    /// cache of this shape could have produced.
    ///
    /// Ranges must be in minimal form, lie within the object, and start and end on block
    /// boundaries (the final block may end at the object size).
    pub fn covered(&self) -> Option<RangeSet> {
        let size = self.validators.size_bytes;
        let chunk = self.chunk_size_bytes;
        if chunk == 0 {
            return None;
        }
        for range in &self.cached_ranges {
            if range.end > size
                || range.start % chunk != 0
                || (range.end % chunk != 0 && range.end != size)
            {
                return None;
            }
        }
        RangeSet::from_normalized(self.cached_ranges.clone())
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a persisted record, returning `None` if it is not valid.
    pub fn decode(raw: &[u8]) -> Option<Self> {
        match serde_json::from_slice(raw) {
            Ok(meta) => Some(meta),
            Err(err) => {
                debug!(?err, "discarding undecodable metadata");
                None
            }
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn identity() -> Identity {
        Identity::new("win7", "sp1", "range")
    }

    fn validators() -> Validators {
        Validators {
            size_bytes: 10 * MIB,
            etag: Some("\"abc\"".into()),
            last_modified: None,
        }
    }

    #[test]
    fn test_encode_layout() {
        let mut meta = Meta::new(identity(), validators(), MIB);
        meta.access_counter = 2;
        meta.chunk_last_access.insert(0, 1);
        meta.chunk_last_access.insert(8, 2);
        meta.cached_ranges = vec![ByteRange::new(0, MIB), ByteRange::new(8 * MIB, 9 * MIB)];

        // Fields are flat and camel-cased, with block indices as string keys
        let raw = meta.encode().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["version"], VERSION);
        assert_eq!(value["imageId"], "win7");
        assert_eq!(value["imageVersion"], "sp1");
        assert_eq!(value["deliveryType"], "range");
        assert_eq!(value["validators"]["sizeBytes"], 10 * MIB);
        assert_eq!(value["validators"]["etag"], "\"abc\"");
        assert!(value["validators"].get("lastModified").is_none());
        assert_eq!(value["chunkSizeBytes"], MIB);
        assert_eq!(value["chunkLastAccess"]["8"], 2);
        assert_eq!(value["cachedRanges"][1]["start"], 8 * MIB);

        assert_eq!(Meta::decode(&raw).unwrap(), meta);
    }

    #[test]
    fn test_cache_key() {
        let key = identity().cache_key();
        assert_eq!(key.len(), 64);
        assert_eq!(key, identity().cache_key());

        // Field boundaries matter
        let a = Identity::new("ab", "c", "range").cache_key();
        let b = Identity::new("a", "bc", "range").cache_key();
        assert_ne!(a, b);
        assert_ne!(key, Identity::new("win7", "sp2", "range").cache_key());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(Meta::decode(b"").is_none());
        assert!(Meta::decode(b"{\"version\":1}").is_none());
        assert!(Meta::decode(b"not json").is_none());
    }

    #[test]
    fn test_reusable() {
        let meta = Meta::new(identity(), validators(), MIB);
        assert!(meta.reusable(&identity(), &validators(), MIB));

        // Any change to identity, validators, chunk size, or schema invalidates
        let other = Identity::new("win7", "sp2", "range");
        assert!(!meta.reusable(&other, &validators(), MIB));
        let mut changed = validators();
        changed.etag = Some("\"def\"".into());
        assert!(!meta.reusable(&identity(), &changed, MIB));
        let mut changed = validators();
        changed.size_bytes += 1;
        assert!(!meta.reusable(&identity(), &changed, MIB));
        assert!(!meta.reusable(&identity(), &validators(), 2 * MIB));
        let mut old = meta.clone();
        old.version = VERSION + 1;
        assert!(!old.reusable(&identity(), &validators(), MIB));
    }

    #[test]
    fn test_covered() {
        let mut meta = Meta::new(identity(), validators(), MIB);
        meta.cached_ranges = vec![ByteRange::new(0, 2 * MIB), ByteRange::new(9 * MIB, 10 * MIB)];
        assert_eq!(meta.covered().unwrap().total_len(), 3 * MIB);

        // Final block may be short
        let mut short = Meta::new(
            identity(),
            Validators {
                size_bytes: 10 * MIB + 7,
                ..validators()
            },
            MIB,
        );
        short.cached_ranges = vec![ByteRange::new(10 * MIB, 10 * MIB + 7)];
        assert!(short.covered().is_some());

        // Unaligned
        meta.cached_ranges = vec![ByteRange::new(1, MIB)];
        assert!(meta.covered().is_none());

        // Past the end of the object
        meta.cached_ranges = vec![ByteRange::new(10 * MIB, 11 * MIB)];
        assert!(meta.covered().is_none());

        // Not minimal
        meta.cached_ranges = vec![ByteRange::new(0, MIB), ByteRange::new(MIB, 2 * MIB)];
        assert!(meta.covered().is_none());
    }
}
