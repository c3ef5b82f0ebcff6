//! # KV Substrate
//!
//! A thin, async, ordered key-value interface over a durable storage engine
//! (`sled`, in [`sled_store`]) or an in-memory `BTreeMap` (in [`memory`],
//! used by tests). Everything above this layer — [`crate::index_level`],
//! [`crate::message_store`], [`crate::blob_store`] — is written against the
//! [`Kv`] trait only.

pub mod memory;
pub mod sled_store;

use std::sync::Arc;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::error::Result;

/// One write inside a [`Kv::batch`] call.
#[derive(Clone, Debug)]
pub enum BatchOp {
    /// Insert or overwrite `key` with `value`.
    Put(Vec<u8>, Vec<u8>),
    /// Remove `key`, if present.
    Delete(Vec<u8>),
}

/// Bounds and direction for [`Kv::scan`]. `gt`/`gte` and `lt`/`lte` mirror
/// [`crate::query::RangeFilter`] so a query-engine range bound translates
/// directly into a scan bound without a lossy inclusive/exclusive
/// conversion.
#[derive(Clone, Debug, Default)]
pub struct ScanOptions {
    /// Exclusive lower bound.
    pub gt: Option<Vec<u8>>,
    /// Inclusive lower bound.
    pub gte: Option<Vec<u8>>,
    /// Exclusive upper bound.
    pub lt: Option<Vec<u8>>,
    /// Inclusive upper bound.
    pub lte: Option<Vec<u8>>,
    /// Iterate in descending key order.
    pub reverse: bool,
    /// Stop after this many entries.
    pub limit: Option<usize>,
}

impl ScanOptions {
    /// A scan bounded to keys sharing `prefix`.
    #[must_use]
    pub fn prefix(prefix: &[u8]) -> Self {
        Self { gte: Some(prefix.to_vec()), lt: Some(prefix_upper_bound(prefix)), ..Self::default() }
    }
}

/// The exclusive upper bound of the key range sharing `prefix`: `prefix`
/// with its last byte incremented, carrying as needed. If `prefix` is all
/// `0xff` bytes (or empty), there is no finite upper bound and `None`
/// encodes "open ended" by returning a key that is lexicographically after
/// any realistic key (unbounded in practice for our key shapes, which
/// always start with a tenant string).
pub(crate) fn prefix_upper_bound(prefix: &[u8]) -> Vec<u8> {
    let mut bound = prefix.to_vec();
    for i in (0..bound.len()).rev() {
        if bound[i] != 0xff {
            bound[i] += 1;
            bound.truncate(i + 1);
            return bound;
        }
    }
    // all 0xff (or empty): no finite bound, so push a sentinel byte that
    // sorts after anything sharing this prefix.
    let mut bound = prefix.to_vec();
    bound.push(0xff);
    bound
}

/// The `[lower, upper)` key range covering exactly `prefix`'s own children
/// (keys of the form `prefix\0...`) — not sibling partitions whose name
/// merely has `prefix` as a byte-prefix (e.g. record ids `"r1"` and `"r12"`,
/// or `dataCid`s `"X"` and `"Xy"`). Bounding on `prefix` alone would span
/// those siblings too, since `"r12..." > "r1"`; bounding on the
/// separator-terminated `prefix\0` does not.
pub(crate) fn partition_bounds(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut lower = prefix.to_vec();
    lower.push(0);
    let upper = prefix_upper_bound(&lower);
    (lower, upper)
}

/// A lazy, single-pass sequence of key-value pairs in scan order. Not
/// restartable: once consumed, a fresh [`Kv::scan`] call is needed.
pub struct KvIterator {
    items: std::collections::VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl KvIterator {
    pub(crate) fn new(items: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        Self { items: items.into() }
    }

    /// Advance the iterator. Suspends (in the `sled` backend) on genuine
    /// I/O; checks `cancel` before yielding the next item.
    pub async fn next(&mut self, cancel: Option<&CancelToken>) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some(token) = cancel {
            token.check()?;
        }
        Ok(self.items.pop_front())
    }
}

/// An ordered key-value substrate with cheap sub-partitioning ("sublevels").
///
/// Implementors must serialize concurrent writers to the same key (last
/// write wins) but must not let one reader block another read over a
/// disjoint key range. Every method below `open`/`close` returns
/// `Error::NotOpen` if called before the first `open` or after a `close`; a
/// partition shares its parent's open/closed state.
#[async_trait]
pub trait Kv: Send + Sync {
    /// Open the store. Idempotent.
    async fn open(&self) -> Result<()>;

    /// Close the store, releasing handles. Idempotent; closing a
    /// never-opened store is a no-op.
    async fn close(&self) -> Result<()>;

    /// Fetch the value at `key`, if any.
    ///
    /// # Errors
    /// Returns `Error::NotOpen` if the store isn't open.
    async fn get(&self, key: &[u8], cancel: Option<&CancelToken>) -> Result<Option<Vec<u8>>>;

    /// Insert or overwrite `key` with `value`.
    ///
    /// # Errors
    /// Returns `Error::NotOpen` if the store isn't open.
    async fn put(&self, key: &[u8], value: &[u8], cancel: Option<&CancelToken>) -> Result<()>;

    /// Remove `key`, if present.
    ///
    /// # Errors
    /// Returns `Error::NotOpen` if the store isn't open.
    async fn delete(&self, key: &[u8], cancel: Option<&CancelToken>) -> Result<()>;

    /// Apply `ops` atomically: either all of them become visible to
    /// subsequent readers, or none do.
    ///
    /// # Errors
    /// Returns `Error::NotOpen` if the store isn't open.
    async fn batch(&self, ops: Vec<BatchOp>, cancel: Option<&CancelToken>) -> Result<()>;

    /// Scan entries in ascending (or, if `opts.reverse`, descending) key
    /// order within `opts`'s bounds.
    ///
    /// # Errors
    /// Returns `Error::NotOpen` if the store isn't open.
    async fn scan(&self, opts: ScanOptions, cancel: Option<&CancelToken>) -> Result<KvIterator>;

    /// Delete every key in this (sub)level.
    ///
    /// # Errors
    /// Returns `Error::NotOpen` if the store isn't open.
    async fn clear(&self, cancel: Option<&CancelToken>) -> Result<()>;

    /// A child store whose keys are transparently prefixed with
    /// `name\0` within the parent's keyspace. Cheap; nesting is allowed.
    fn partition(&self, name: &str) -> Arc<dyn Kv>;
}

/// Join `parts` with `\0` separators, matching the secondary-key layout.
#[must_use]
pub fn join_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend_from_slice(part);
    }
    out
}
