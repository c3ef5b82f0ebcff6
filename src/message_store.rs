//! # MessageStore
//!
//! A durable mapping from `(tenant, messageCid)` to a message plus its index
//! values, built on [`IndexLevel`] and the same [`Kv`] root.
//! Message bytes live under a `messages` sub-key of the same tenant
//! partition the index uses, so a `put` commits the message bytes, the
//! indexes record, and its secondary keys in one atomic batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cancel::CancelToken;
use crate::cid::content_address;
use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::index_level::IndexLevel;
use crate::kv::{BatchOp, Kv, join_key};
use crate::query::{Filter, Page, Sort};
use crate::scalar::Scalar;

const MESSAGES_PREFIX: &[u8] = b"messages";

/// One page of a [`MessageStore::query`] call.
#[derive(Clone, Debug)]
pub struct QueryResult<T> {
    /// Matching messages, in sort order.
    pub messages: Vec<T>,
    /// The last returned message's `messageCid`, set only if more results
    /// exist beyond this page.
    pub pagination_message_cid: Option<String>,
}

/// The tenant-partitioned message store.
pub struct MessageStore {
    kv: Arc<dyn Kv>,
    index: IndexLevel,
    events: Arc<EventBus>,
}

impl MessageStore {
    /// Build a store over `kv`, fanning successful `put`s out through
    /// `events`.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>, events: Arc<EventBus>) -> Self {
        let index = IndexLevel::new(kv.clone());
        Self { kv, index, events }
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

    /// Delete everything in every tenant. Intended for tests.
    ///
    /// # Errors
    /// Returns an error if the backend fails to clear.
    pub async fn clear(&self) -> Result<()> {
        self.kv.clear(None).await
    }

    /// Content-address, serialize, and persist `message` under `tenant`,
    /// indexed by `indexes`. Replaces any previous message and indexes
    /// record sharing the resulting `messageCid`.
    /// On success, fans the write out to every matching event subscriber;
    /// subscriber errors never fail the `put`.
    ///
    /// Returns the computed `messageCid`.
    ///
    /// # Errors
    /// Returns `Error::BadIndexValue` if `indexes` is invalid, or a backend
    /// error if the batch write fails.
    pub async fn put<T: Serialize>(
        &self,
        tenant: &str,
        message: &T,
        indexes: &BTreeMap<String, Scalar>,
        cancel: Option<&CancelToken>,
    ) -> Result<String> {
        let (message_cid, bytes) = content_address(message)?;
        let tenant_kv = self.kv.partition(tenant);

        let mut ops = self.index.put_ops(&tenant_kv, &message_cid, indexes, cancel).await?;
        ops.push(BatchOp::Put(message_key(&message_cid), bytes));
        tenant_kv.batch(ops, cancel).await?;

        self.events.publish(tenant, &message_cid, indexes).await;
        Ok(message_cid)
    }

    /// Fetch and deserialize the message stored under `message_cid`, if
    /// any.
    ///
    /// # Errors
    /// Returns an error if the backend read fails or the stored bytes are
    /// not valid dag-cbor for `T`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        tenant: &str,
        message_cid: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<T>> {
        let tenant_kv = self.kv.partition(tenant);
        let Some(bytes) = tenant_kv.get(&message_key(message_cid), cancel).await? else {
            return Ok(None);
        };
        Ok(Some(decode_message(&bytes)?))
    }

    /// Evaluate `filters` against the tenant's indexed messages, sorted by
    /// `sort` and paginated per `page`, fetching and
    /// deserializing each surviving message.
    ///
    /// # Errors
    /// Returns `Error::BadFilter` if `filters` is malformed, `Error::Corrupted`
    /// if an indexed `messageCid` has no stored bytes, or an error if a
    /// backend read fails or a message's stored bytes are invalid.
    pub async fn query<T: DeserializeOwned>(
        &self,
        tenant: &str,
        filters: &[Filter],
        sort: &Sort,
        page: &Page,
        cancel: Option<&CancelToken>,
    ) -> Result<QueryResult<T>> {
        let (message_cids, pagination_message_cid) = self.index.query(tenant, filters, sort, page, cancel).await?;
        let tenant_kv = self.kv.partition(tenant);

        let mut messages = Vec::with_capacity(message_cids.len());
        for message_cid in &message_cids {
            let Some(bytes) = tenant_kv.get(&message_key(message_cid), cancel).await? else {
                tracing::warn!(tenant, message_cid, "indexed message has no stored bytes");
                return Err(Error::Corrupted(format!("{message_cid} is indexed but has no stored message bytes")));
            };
            messages.push(decode_message(&bytes)?);
        }

        Ok(QueryResult { messages, pagination_message_cid })
    }

    /// Remove `message_cid`'s bytes and index entries atomically. A no-op
    /// if it was never stored.
    ///
    /// # Errors
    /// Returns an error if the backend read or write fails.
    pub async fn delete(&self, tenant: &str, message_cid: &str, cancel: Option<&CancelToken>) -> Result<()> {
        let tenant_kv = self.kv.partition(tenant);
        let mut ops = self.index.delete_ops(&tenant_kv, message_cid, cancel).await?;
        ops.push(BatchOp::Delete(message_key(message_cid)));
        tenant_kv.batch(ops, cancel).await
    }
}

fn message_key(message_cid: &str) -> Vec<u8> {
    join_key(&[MESSAGES_PREFIX, message_cid.as_bytes()])
}

fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(|e| Error::Serde(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::query::{Direction, FilterValue};
    use serde::Deserialize;

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Note {
        schema: String,
        body: String,
    }

    async fn store() -> MessageStore {
        let store = MessageStore::new(Arc::new(MemoryKv::new()), Arc::new(EventBus::new()));
        store.open().await.unwrap();
        store
    }

    fn indexes(schema: &str, timestamp: f64) -> BTreeMap<String, Scalar> {
        [
            ("schema".to_string(), Scalar::from(schema)),
            ("messageTimestamp".to_string(), Scalar::from(timestamp)),
        ]
        .into()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_the_message() {
        let store = store().await;
        let note = Note { schema: "note".into(), body: "hello".into() };
        let message_cid = store.put("did:example:alice", &note, &indexes("note", 1.0), None).await.unwrap();

        let got: Note = store.get("did:example:alice", &message_cid, None).await.unwrap().unwrap();
        assert_eq!(got, note);
    }

    #[tokio::test]
    async fn get_is_tenant_scoped() {
        let store = store().await;
        let note = Note { schema: "note".into(), body: "hello".into() };
        let message_cid = store.put("did:example:alice", &note, &indexes("note", 1.0), None).await.unwrap();

        let got: Option<Note> = store.get("did:example:bob", &message_cid, None).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn reput_with_same_bytes_yields_the_same_message_cid() {
        let store = store().await;
        let note = Note { schema: "note".into(), body: "hello".into() };
        let cid1 = store.put("did:example:alice", &note, &indexes("note", 1.0), None).await.unwrap();
        let cid2 = store.put("did:example:alice", &note, &indexes("note", 2.0), None).await.unwrap();
        assert_eq!(cid1, cid2, "content address depends only on the message bytes");
    }

    #[tokio::test]
    async fn query_fetches_matching_messages_in_sort_order() {
        let store = store().await;
        store.put("did:example:alice", &Note { schema: "note".into(), body: "a".into() }, &indexes("note", 2.0), None).await.unwrap();
        store.put("did:example:alice", &Note { schema: "note".into(), body: "b".into() }, &indexes("note", 1.0), None).await.unwrap();

        let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("note")))].into();
        let sort = Sort { property: "messageTimestamp".to_string(), direction: Direction::Asc };
        let result: QueryResult<Note> =
            store.query("did:example:alice", &[filter], &sort, &Page::default(), None).await.unwrap();

        assert_eq!(result.messages.iter().map(|n| n.body.clone()).collect::<Vec<_>>(), vec!["b".to_string(), "a".to_string()]);
        assert!(result.pagination_message_cid.is_none());
    }

    #[tokio::test]
    async fn delete_removes_message_and_index() {
        let store = store().await;
        let note = Note { schema: "note".into(), body: "hello".into() };
        let message_cid = store.put("did:example:alice", &note, &indexes("note", 1.0), None).await.unwrap();

        store.delete("did:example:alice", &message_cid, None).await.unwrap();

        let got: Option<Note> = store.get("did:example:alice", &message_cid, None).await.unwrap();
        assert!(got.is_none());
        assert!(store.index.get_indexes("did:example:alice", &message_cid, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_of_unknown_message_cid_is_a_no_op() {
        let store = store().await;
        store.delete("did:example:alice", "bafynotfound", None).await.unwrap();
    }
}
