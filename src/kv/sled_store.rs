//! Production [`Kv`] backend, built on [`sled`].
//!
//! `sled`'s API is synchronous; every call here hands the actual work to
//! [`tokio::task::spawn_blocking`] so the async interface never blocks the
//! runtime, following the same pattern storage-engine wrappers elsewhere in
//! the ecosystem use for sled and similar embedded stores.

use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{BatchOp, Kv, KvIterator, ScanOptions, partition_bounds};
use crate::cancel::CancelToken;
use crate::error::Result;

/// A `sled`-backed [`Kv`]. Sub-partitions created via [`Kv::partition`]
/// share the same underlying `sled::Tree` and differ only in the key
/// prefix they apply, so partitioning never opens a new file handle.
#[derive(Clone)]
pub struct SledKv {
    tree: sled::Tree,
    prefix: Vec<u8>,
    opened: Arc<AtomicBool>,
}

impl SledKv {
    /// Open (creating if necessary) a `sled` database at `path` and wrap
    /// its default tree.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self::from_tree(db.open_tree("root")?))
    }

    /// Wrap an already-open `sled::Tree`, e.g. one sharing a `sled::Db`
    /// with another store that needs independent backups.
    #[must_use]
    pub fn from_tree(tree: sled::Tree) -> Self {
        Self { tree, prefix: Vec::new(), opened: Arc::new(AtomicBool::new(false)) }
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        if self.prefix.is_empty() {
            key.to_vec()
        } else {
            let mut out = self.prefix.clone();
            out.push(0);
            out.extend_from_slice(key);
            out
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.opened.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(crate::error::Error::NotOpen)
        }
    }

    fn strip_prefix(&self, key: &[u8]) -> Vec<u8> {
        if self.prefix.is_empty() {
            key.to_vec()
        } else {
            // prefix + separator
            key[self.prefix.len() + 1..].to_vec()
        }
    }

    fn scan_bounds(&self, opts: &ScanOptions) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let lower = if let Some(rel) = &opts.gt {
            Bound::Excluded(self.full_key(rel))
        } else if let Some(rel) = &opts.gte {
            Bound::Included(self.full_key(rel))
        } else if self.prefix.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Included(partition_bounds(&self.prefix).0)
        };
        let upper = if let Some(rel) = &opts.lt {
            Bound::Excluded(self.full_key(rel))
        } else if let Some(rel) = &opts.lte {
            Bound::Included(self.full_key(rel))
        } else if self.prefix.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(partition_bounds(&self.prefix).1)
        };
        (lower, upper)
    }
}

/// A concrete [`RangeBounds`] over owned byte vectors, since the bounds we
/// compute aren't known until runtime.
struct ByteRange(Bound<Vec<u8>>, Bound<Vec<u8>>);

impl RangeBounds<Vec<u8>> for ByteRange {
    fn start_bound(&self) -> Bound<&Vec<u8>> {
        match &self.0 {
            Bound::Included(v) => Bound::Included(v),
            Bound::Excluded(v) => Bound::Excluded(v),
            Bound::Unbounded => Bound::Unbounded,
        }
    }

    fn end_bound(&self) -> Bound<&Vec<u8>> {
        match &self.1 {
            Bound::Included(v) => Bound::Included(v),
            Bound::Excluded(v) => Bound::Excluded(v),
            Bound::Unbounded => Bound::Unbounded,
        }
    }
}

#[async_trait]
impl Kv for SledKv {
    async fn open(&self) -> Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.opened.store(false, Ordering::SeqCst);
        let tree = self.tree.clone();
        tokio::task::spawn_blocking(move || tree.flush())
            .await
            .map_err(|e| crate::error::Error::Corrupted(format!("flush task panicked: {e}")))??;
        Ok(())
    }

    async fn get(&self, key: &[u8], cancel: Option<&CancelToken>) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        let tree = self.tree.clone();
        let key = self.full_key(key);
        let value = tokio::task::spawn_blocking(move || tree.get(key))
            .await
            .map_err(|e| crate::error::Error::Corrupted(format!("get task panicked: {e}")))??;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn put(&self, key: &[u8], value: &[u8], cancel: Option<&CancelToken>) -> Result<()> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        let tree = self.tree.clone();
        let key = self.full_key(key);
        let value = value.to_vec();
        tokio::task::spawn_blocking(move || tree.insert(key, value))
            .await
            .map_err(|e| crate::error::Error::Corrupted(format!("put task panicked: {e}")))??;
        Ok(())
    }

    async fn delete(&self, key: &[u8], cancel: Option<&CancelToken>) -> Result<()> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        let tree = self.tree.clone();
        let key = self.full_key(key);
        tokio::task::spawn_blocking(move || tree.remove(key))
            .await
            .map_err(|e| crate::error::Error::Corrupted(format!("delete task panicked: {e}")))??;
        Ok(())
    }

    async fn batch(&self, ops: Vec<BatchOp>, cancel: Option<&CancelToken>) -> Result<()> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        let tree = self.tree.clone();
        let mut batch = sled::Batch::default();
        for op in ops {
            match op {
                BatchOp::Put(key, value) => batch.insert(self.full_key(&key), value),
                BatchOp::Delete(key) => batch.remove(self.full_key(&key)),
            }
        }
        tokio::task::spawn_blocking(move || tree.apply_batch(batch))
            .await
            .map_err(|e| crate::error::Error::Corrupted(format!("batch task panicked: {e}")))??;
        Ok(())
    }

    async fn scan(&self, opts: ScanOptions, cancel: Option<&CancelToken>) -> Result<KvIterator> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        let tree = self.tree.clone();
        let (lower, upper) = self.scan_bounds(&opts);
        let reverse = opts.reverse;
        let limit = opts.limit;
        let prefix_len =
            if self.prefix.is_empty() { 0 } else { self.prefix.len() + 1 };

        let rows = tokio::task::spawn_blocking(move || -> std::result::Result<Vec<(Vec<u8>, Vec<u8>)>, sled::Error> {
            let range = ByteRange(lower, upper);
            let mut out = Vec::new();
            if reverse {
                for entry in tree.range(range).rev() {
                    let (k, v) = entry?;
                    out.push((k.to_vec(), v.to_vec()));
                    if limit.is_some_and(|l| out.len() >= l) {
                        break;
                    }
                }
            } else {
                for entry in tree.range(range) {
                    let (k, v) = entry?;
                    out.push((k.to_vec(), v.to_vec()));
                    if limit.is_some_and(|l| out.len() >= l) {
                        break;
                    }
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| crate::error::Error::Corrupted(format!("scan task panicked: {e}")))??;

        let items = rows.into_iter().map(|(k, v)| (k[prefix_len..].to_vec(), v)).collect();
        Ok(KvIterator::new(items))
    }

    async fn clear(&self, cancel: Option<&CancelToken>) -> Result<()> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        if self.prefix.is_empty() {
            let tree = self.tree.clone();
            tokio::task::spawn_blocking(move || tree.clear())
                .await
                .map_err(|e| crate::error::Error::Corrupted(format!("clear task panicked: {e}")))??;
            return Ok(());
        }
        // sub-partition: only remove keys sharing our prefix.
        let opts = ScanOptions { limit: None, ..ScanOptions::default() };
        let mut it = self.scan(opts, cancel).await?;
        let mut ops = Vec::new();
        while let Some((key, _)) = it.next(cancel).await? {
            ops.push(BatchOp::Delete(key));
        }
        if !ops.is_empty() {
            self.batch(ops, cancel).await?;
        }
        Ok(())
    }

    fn partition(&self, name: &str) -> Arc<dyn Kv> {
        let prefix = if self.prefix.is_empty() {
            name.as_bytes().to_vec()
        } else {
            super::join_key(&[&self.prefix, name.as_bytes()])
        };
        Arc::new(Self { tree: self.tree.clone(), prefix, opened: self.opened.clone() })
    }
}
