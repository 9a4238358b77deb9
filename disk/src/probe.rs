//! Discover the size, validators, and range support of a remote object.
//!
//! # Algorithm
//!
//! 1. Issue `HEAD`. Any failure (network error, non-2xx, missing or zero `Content-Length`) is not
//!    fatal: the prober falls back to the range request below.
//! 2. Issue `GET` with `Range: bytes=0-0`. A `206` confirms range support. The total in its
//!    `Content-Range` (`bytes 0-0/<total>`, or `bytes */<total>` on a `416`) is authoritative
//!    when present and overrides a disagreeing `Content-Length` from step 1.
//! 3. Fail with [Error::IndeterminateSize] if no positive size at most [MAX_SIZE] was learned, or
//!    with [Error::RangeNotSupported] if no `206` was observed.
//!
//! `ETag` and `Last-Modified` are taken from the `HEAD` response when it succeeded, otherwise from
//! the range response.

use crate::{client::Client, Error};
use streamdisk_storage::metadata::Validators;
use tracing::{debug, warn};

/// Largest object size accepted (`2^53 - 1`).
///
/// Sizes are persisted in a JSON record and must survive any consumer that reads numbers as
/// doubles.
pub const MAX_SIZE: u64 = (1 << 53) - 1;

/// A parsed `Content-Range` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    /// Inclusive `(first, last)` byte positions, or `None` for `*`.
    pub span: Option<(u64, u64)>,
    /// Complete length, or `None` for `*`.
    pub total: Option<u64>,
}

/// Parse a `Content-Range` header value (`bytes <first>-<last>/<total>` or `bytes */<total>`).
pub fn parse_content_range(value: &str) -> Result<ContentRange, Error> {
    let invalid = || Error::InvalidContentRange(value.to_string());
    let rest = value.trim();
    let (unit, rest) = rest.split_once(char::is_whitespace).ok_or_else(invalid)?;
    if !unit.eq_ignore_ascii_case("bytes") {
        return Err(invalid());
    }
    let (span, total) = rest.trim().split_once('/').ok_or_else(invalid)?;
    let span = match span.trim() {
        "*" => None,
        span => {
            let (first, last) = span.split_once('-').ok_or_else(invalid)?;
            let first: u64 = first.trim().parse().map_err(|_| invalid())?;
            let last: u64 = last.trim().parse().map_err(|_| invalid())?;
            if first > last {
                return Err(invalid());
            }
            Some((first, last))
        }
    };
    let total = match total.trim() {
        "*" => None,
        total => Some(total.parse::<u64>().map_err(|_| invalid())?),
    };
    match (span, total) {
        (None, None) => Err(invalid()),
        (Some((_, last)), Some(total)) if last >= total => Err(invalid()),
        _ => Ok(ContentRange { span, total }),
    }
}

/// What was learned about a remote object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Probe {
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub accept_ranges: Option<String>,
    /// Status of the `bytes=0-0` request.
    pub range_probe_status: u16,
    pub partial_ok: bool,
    /// Raw `Content-Range` of the `bytes=0-0` response.
    pub content_range: Option<String>,
}

impl Probe {
    /// The validators a cached copy of this object must match.
    pub fn validators(&self) -> Validators {
        Validators {
            size_bytes: self.size,
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
        }
    }

    /// The `ETag` to send as `If-Range`, if it is a strong validator.
    pub fn if_range(&self) -> Option<String> {
        self.etag.as_ref().filter(|etag| !etag.starts_with("W/")).cloned()
    }
}

/// Probe the object served by `client`.
pub async fn probe<C: Client>(client: &C) -> Result<Probe, Error> {
    // Headers only
    let mut head_size = None;
    let mut etag = None;
    let mut last_modified = None;
    let mut accept_ranges = None;
    let mut head_ok = false;
    match client.head().await {
        Ok(head) if (200..300).contains(&head.status) => {
            head_ok = true;
            head_size = head.content_length.filter(|len| *len > 0);
            etag = head.etag;
            last_modified = head.last_modified;
            accept_ranges = head.accept_ranges;
        }
        Ok(head) => debug!(status = head.status, "head rejected, falling back to range probe"),
        Err(err) => debug!(?err, "head failed, falling back to range probe"),
    }

    // Single byte
    let partial = client.get_range(0, 0, None).await?;
    let partial_ok = partial.status == 206;
    let range_total = match &partial.content_range {
        Some(value) if partial_ok || partial.status == 416 => parse_content_range(value)?.total,
        _ => None,
    };
    if !head_ok {
        etag = partial.etag;
        last_modified = partial.last_modified;
    }

    let size = match (head_size, range_total) {
        (Some(head), Some(range)) if head != range => {
            warn!(head, range, "content-length disagrees with content-range, using content-range");
            range
        }
        (_, Some(range)) => range,
        (Some(head), None) => head,
        (None, None) => return Err(Error::IndeterminateSize),
    };
    if size == 0 || size > MAX_SIZE {
        return Err(Error::IndeterminateSize);
    }
    if !partial_ok {
        return Err(Error::RangeNotSupported(Some(partial.status)));
    }
    debug!(size, ?etag, ?last_modified, "probed remote");
    Ok(Probe {
        size,
        etag,
        last_modified,
        accept_ranges,
        range_probe_status: partial.status,
        partial_ok,
        content_range: partial.content_range,
    })
}
