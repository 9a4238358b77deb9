//! Serve a remote, range-capable HTTP object as a cached, read-only block device.
//!
//! A [remote::Disk] lets a virtual disk controller treat a large read-only image hosted behind an
//! HTTP server as a local random-access device. Only the blocks actually touched are fetched
//! (with `Range` requests), each is persisted in a [streamdisk_storage::store::Store], and the
//! footprint of the cache is bounded by evicting the least recently used blocks.
//!
//! # Status
//!
//! `streamdisk` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use std::sync::Arc;
use thiserror::Error;

pub mod client;
pub mod device;
pub mod probe;
pub mod remote;

/// Errors that can occur when probing or reading a remote object.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] streamdisk_storage::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote does not support range requests (status {0:?})")]
    RangeNotSupported(Option<u16>),
    #[error("unable to determine remote size")]
    IndeterminateSize,
    #[error("invalid content-range: {0}")]
    InvalidContentRange(String),
    #[error("unexpected status {status} fetching bytes {start}-{end}")]
    UnexpectedStatus { status: u16, start: u64, end: u64 },
    #[error("block {index} length mismatch: expected {expected} got {actual}")]
    LengthMismatch {
        index: u64,
        expected: u64,
        actual: u64,
    },
    #[error("content-range mismatch: expected {expected} got {actual}")]
    ContentRangeMismatch { expected: String, actual: String },
    #[error("validator mismatch: expected {expected:?} got {actual:?}")]
    ValidatorMismatch {
        expected: Option<String>,
        actual: Option<String>,
    },
    #[error("out of bounds: offset {offset} len {len} size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("unaligned access: lba {lba} len {len}")]
    Unaligned { lba: u64, len: usize },
    #[error("device is read-only")]
    ReadOnly,
    #[error("closed")]
    Closed,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("fetch failed: {0}")]
    Fetch(Arc<Error>),
}
