//! An in-memory [`Kv`] backed by a `BTreeMap`, used by tests so they don't
//! need a temp directory or `sled`'s on-disk format.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{BatchOp, Kv, KvIterator, ScanOptions, partition_bounds};
use crate::cancel::CancelToken;
use crate::error::Result;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// Shared, process-wide ordered map. All partitions of one root share the
/// same `Arc<RwLock<Map>>` and differ only by key prefix.
#[derive(Clone)]
pub struct MemoryKv {
    data: Arc<RwLock<Map>>,
    prefix: Vec<u8>,
    opened: Arc<AtomicBool>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    /// Create a fresh, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { data: Arc::new(RwLock::new(BTreeMap::new())), prefix: Vec::new(), opened: Arc::new(AtomicBool::new(false)) }
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

    fn strip_len(&self) -> usize {
        if self.prefix.is_empty() { 0 } else { self.prefix.len() + 1 }
    }

    fn check_open(&self) -> Result<()> {
        if self.opened.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(crate::error::Error::NotOpen)
        }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn open(&self) -> Result<()> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.opened.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &[u8], cancel: Option<&CancelToken>) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        let key = self.full_key(key);
        let map = self.data.read().expect("lock poisoned");
        Ok(map.get(&key).cloned())
    }

    async fn put(&self, key: &[u8], value: &[u8], cancel: Option<&CancelToken>) -> Result<()> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        let key = self.full_key(key);
        let mut map = self.data.write().expect("lock poisoned");
        map.insert(key, value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8], cancel: Option<&CancelToken>) -> Result<()> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        let key = self.full_key(key);
        let mut map = self.data.write().expect("lock poisoned");
        map.remove(&key);
        Ok(())
    }

    async fn batch(&self, ops: Vec<BatchOp>, cancel: Option<&CancelToken>) -> Result<()> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        let mut map = self.data.write().expect("lock poisoned");
        for op in ops {
            match op {
                BatchOp::Put(key, value) => {
                    map.insert(self.full_key(&key), value);
                }
                BatchOp::Delete(key) => {
                    map.remove(&self.full_key(&key));
                }
            }
        }
        Ok(())
    }

    async fn scan(&self, opts: ScanOptions, cancel: Option<&CancelToken>) -> Result<KvIterator> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        use std::ops::Bound;

        let (lower_excl, lower) = if let Some(rel) = &opts.gt {
            (true, self.full_key(rel))
        } else if let Some(rel) = &opts.gte {
            (false, self.full_key(rel))
        } else if self.prefix.is_empty() {
            (false, self.prefix.clone())
        } else {
            (false, partition_bounds(&self.prefix).0)
        };
        let upper: Bound<Vec<u8>> = if let Some(rel) = &opts.lt {
            Bound::Excluded(self.full_key(rel))
        } else if let Some(rel) = &opts.lte {
            Bound::Included(self.full_key(rel))
        } else if self.prefix.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(partition_bounds(&self.prefix).1)
        };

        let map = self.data.read().expect("lock poisoned");
        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = map
            .range(lower.clone()..)
            .skip_while(|(k, _)| lower_excl && **k == lower)
            .take_while(|(k, _)| match &upper {
                Bound::Included(u) => *k <= u,
                Bound::Excluded(u) => *k < u,
                Bound::Unbounded => true,
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        drop(map);

        if opts.reverse {
            rows.reverse();
        }
        if let Some(limit) = opts.limit {
            rows.truncate(limit);
        }

        let strip = self.strip_len();
        let items = rows.into_iter().map(|(k, v)| (k[strip..].to_vec(), v)).collect();
        Ok(KvIterator::new(items))
    }

    async fn clear(&self, cancel: Option<&CancelToken>) -> Result<()> {
        self.check_open()?;
        if let Some(token) = cancel {
            token.check()?;
        }
        if self.prefix.is_empty() {
            self.data.write().expect("lock poisoned").clear();
            return Ok(());
        }
        let (lower, upper) = partition_bounds(&self.prefix);
        let mut map = self.data.write().expect("lock poisoned");
        map.retain(|k, _| !(k.as_slice() >= lower.as_slice() && k.as_slice() < upper.as_slice()));
        Ok(())
    }

    fn partition(&self, name: &str) -> Arc<dyn Kv> {
        let prefix = if self.prefix.is_empty() {
            name.as_bytes().to_vec()
        } else {
            super::join_key(&[&self.prefix, name.as_bytes()])
        };
        Arc::new(Self { data: self.data.clone(), prefix, opened: self.opened.clone() })
    }
}
