//! # BlobStore
//!
//! Content-addressed, `(tenant, recordId, dataCid)`-partitioned byte-stream
//! storage. Chunked on write, lazily re-chunked on read; two
//! records in the same tenant holding identical bytes stay independent on
//! delete because each gets its own `dataCid` partition under its own
//! `recordId`.

use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::kv::{Kv, ScanOptions, join_key};

const CHUNK_PREFIX: &[u8] = b"chunk";
const SIZE_KEY: &[u8] = b"__size";

/// Content-addressed blob storage, owning its own [`Kv`] handle so it can be
/// backed up on its own schedule, independently of a
/// [`crate::message_store::MessageStore`].
pub struct BlobStore {
    kv: Arc<dyn Kv>,
}

impl BlobStore {
    /// Build a blob store over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Open the underlying store.
    ///
    /// # Errors
    /// Returns an error if the backend fails to open.
    pub async fn open(&self) -> Result<()> {
        self.kv.open().await
    }

    /// Close the underlying store.
    ///
    /// # Errors
    /// Returns an error if the backend fails to close.
    pub async fn close(&self) -> Result<()> {
        self.kv.close().await
    }

    /// Wipe every blob in every tenant. Intended for tests.
    ///
    /// # Errors
    /// Returns an error if the backend fails to clear.
    pub async fn clear(&self) -> Result<()> {
        self.kv.clear(None).await
    }

    fn blob_partition(&self, tenant: &str, record_id: &str, data_cid: &str) -> Arc<dyn Kv> {
        self.kv.partition(tenant).partition(record_id).partition(data_cid)
    }

    fn record_partition(&self, tenant: &str, record_id: &str) -> Arc<dyn Kv> {
        self.kv.partition(tenant).partition(record_id)
    }

    /// Stream `chunks` into the `(tenant, record_id, data_cid)` partition,
    /// returning the total number of bytes consumed. The caller is
    /// expected to have computed `data_cid` from the same bytes; this store
    /// does not re-verify. Idempotent: if `data_cid` is already fully
    /// written under `(tenant, record_id)`, `chunks` is dropped unread and
    /// the previously recorded size is returned.
    ///
    /// If `chunks` yields an error partway through, the partially-written
    /// partition is cleared before the error is returned rather than left
    /// as a truncated, size-mismatched blob.
    ///
    /// # Errors
    /// Returns whatever error `chunks` yielded, or a backend error if a
    /// write fails.
    pub async fn put<S>(
        &self,
        tenant: &str,
        record_id: &str,
        data_cid: &str,
        mut chunks: S,
        cancel: Option<&CancelToken>,
    ) -> Result<u64>
    where
        S: Stream<Item = Result<Vec<u8>>> + Unpin,
    {
        let blob_kv = self.blob_partition(tenant, record_id, data_cid);
        if let Some(size) = read_size(&blob_kv, cancel).await? {
            return Ok(size);
        }

        let mut size: u64 = 0;
        let mut seq: u64 = 0;
        while let Some(chunk) = chunks.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    blob_kv.clear(cancel).await.ok();
                    return Err(e);
                }
            };
            if let Err(e) = blob_kv.put(&chunk_key(seq), &chunk, cancel).await {
                blob_kv.clear(cancel).await.ok();
                return Err(e);
            }
            size += chunk.len() as u64;
            seq += 1;
        }

        blob_kv.put(SIZE_KEY, &size.to_be_bytes(), cancel).await?;
        Ok(size)
    }

    /// Fetch the size and a lazy, restartable-from-the-beginning byte
    /// stream for `(tenant, record_id, data_cid)`, if it exists.
    ///
    /// # Errors
    /// Returns an error if the backend read fails.
    pub async fn get(
        &self,
        tenant: &str,
        record_id: &str,
        data_cid: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<(u64, Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>)>> {
        let blob_kv = self.blob_partition(tenant, record_id, data_cid);
        let Some(size) = read_size(&blob_kv, cancel).await? else {
            return Ok(None);
        };
        Ok(Some((size, Box::pin(chunk_stream(blob_kv, cancel.cloned())))))
    }

    /// Delete `(tenant, record_id, data_cid)`'s blob. If `record_id` is left
    /// with no other `dataCid`s afterward, its partition is cleared too.
    ///
    /// # Errors
    /// Returns an error if the backend fails to read or write.
    pub async fn delete(&self, tenant: &str, record_id: &str, data_cid: &str, cancel: Option<&CancelToken>) -> Result<()> {
        self.blob_partition(tenant, record_id, data_cid).clear(cancel).await?;

        let record_kv = self.record_partition(tenant, record_id);
        if is_empty(&record_kv, cancel).await? {
            record_kv.clear(cancel).await?;
        }
        Ok(())
    }
}

fn chunk_key(seq: u64) -> Vec<u8> {
    join_key(&[CHUNK_PREFIX, &seq.to_be_bytes()])
}

async fn read_size(blob_kv: &Arc<dyn Kv>, cancel: Option<&CancelToken>) -> Result<Option<u64>> {
    let Some(bytes) = blob_kv.get(SIZE_KEY, cancel).await? else {
        return Ok(None);
    };
    let buf: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| crate::error::Error::Corrupted(format!("__size record is {} bytes, expected 8", bytes.len())))?;
    Ok(Some(u64::from_be_bytes(buf)))
}

async fn is_empty(kv: &Arc<dyn Kv>, cancel: Option<&CancelToken>) -> Result<bool> {
    let opts = ScanOptions { limit: Some(1), ..ScanOptions::default() };
    let mut it = kv.scan(opts, cancel).await?;
    Ok(it.next(cancel).await?.is_none())
}

fn chunk_stream(kv: Arc<dyn Kv>, cancel: Option<CancelToken>) -> impl Stream<Item = Result<Vec<u8>>> {
    futures::stream::unfold(Some((kv, 0u64, cancel)), |state| async move {
        let (kv, seq, cancel) = state?;
        if let Some(token) = &cancel {
            if let Err(e) = token.check() {
                return Some((Err(e), None));
            }
        }
        match kv.get(&chunk_key(seq), cancel.as_ref()).await {
            Ok(Some(bytes)) => Some((Ok(bytes), Some((kv, seq + 1, cancel)))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    })
}
