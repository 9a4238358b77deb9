//! Track, persist, and retrieve cached blocks of a remote object.
//!
//! # Status
//!
//! `streamdisk-storage` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use thiserror::Error;

pub mod metadata;
pub mod rset;
pub mod store;

/// Errors that can occur when interacting with a [store::Store].
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid block name: {0}")]
    InvalidBlockName(String),
}
