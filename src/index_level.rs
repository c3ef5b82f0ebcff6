//! # IndexLevel
//!
//! The secondary-index layer. Stores one "indexes record" per item
//! (`itemId` → its flat `property → Scalar` map) plus one secondary key per
//! indexed property, and answers [`Filter`]-based queries by picking a
//! driver property per conjunct, scanning its secondary-key range, and
//! re-checking every candidate against the full conjunct.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::kv::{BatchOp, Kv, ScanOptions, join_key, prefix_upper_bound};
use crate::query::{Direction, Filter, FilterValue, Page, RangeFilter, Sort, matches_filter, validate_query};
use crate::scalar::{self, Scalar};

const INDEXES_PREFIX: &[u8] = b"__indexes";

/// The secondary-index layer for one [`Kv`] root, tenant-partitioned.
pub struct IndexLevel {
    kv: Arc<dyn Kv>,
}

impl IndexLevel {
    /// Wrap `kv` as an index level. `kv` should be a root store; tenants are
    /// partitioned internally.
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// The sub-store holding `tenant`'s keys.
    pub(crate) fn tenant(&self, tenant: &str) -> Arc<dyn Kv> {
        self.kv.partition(tenant)
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

    /// Delete every indexed item across every tenant. Intended for tests.
    ///
    /// # Errors
    /// Returns an error if the backend fails to clear.
    pub async fn clear(&self) -> Result<()> {
        self.kv.clear(None).await
    }

    /// Index `item_id` under `indexes`, replacing whatever was previously
    /// indexed for it. Validates every property name and value before
    /// issuing any write, then applies the old-key deletes and new-key puts
    /// as a single atomic batch.
    ///
    /// # Errors
    /// Returns `Error::BadIndexValue` if a property name or value is
    /// invalid, or a backend error if the batch write fails.
    pub async fn put(
        &self,
        tenant: &str,
        item_id: &str,
        indexes: &BTreeMap<String, Scalar>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let tenant_kv = self.tenant(tenant);
        let ops = self.put_ops(&tenant_kv, item_id, indexes, cancel).await?;
        tenant_kv.batch(ops, cancel).await
    }

    /// Build (without committing) the batch of writes `put` would issue:
    /// deletes for `item_id`'s previous secondary keys, then the new
    /// indexes record and secondary keys. Exposed so [`crate::message_store`]
    /// can fold these into a single batch alongside a message-bytes write,
    /// keeping the message and its index atomic.
    ///
    /// # Errors
    /// Returns `Error::BadIndexValue` if a property name or value is
    /// invalid, or a backend error if the previous record can't be read.
    pub(crate) async fn put_ops(
        &self,
        tenant_kv: &Arc<dyn Kv>,
        item_id: &str,
        indexes: &BTreeMap<String, Scalar>,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<BatchOp>> {
        for (property, value) in indexes {
            scalar::validate_property(property)?;
            scalar::encode_scalar(value)?;
        }

        let previous = self.read_indexes(tenant_kv, item_id, cancel).await?;

        let mut ops = Vec::new();
        if let Some(previous) = &previous {
            for (property, value) in previous {
                ops.push(BatchOp::Delete(secondary_key(property, value, item_id)?));
            }
        }
        ops.push(BatchOp::Put(indexes_key(item_id), serde_json::to_vec(indexes)?));
        for (property, value) in indexes {
            ops.push(BatchOp::Put(secondary_key(property, value, item_id)?, item_id.as_bytes().to_vec()));
        }
        Ok(ops)
    }

    /// Remove `item_id` and every secondary key it owns. A no-op if it was
    /// never indexed.
    ///
    /// # Errors
    /// Returns an error if the backend fails to read or write.
    pub async fn delete(&self, tenant: &str, item_id: &str, cancel: Option<&CancelToken>) -> Result<()> {
        let tenant_kv = self.tenant(tenant);
        let ops = self.delete_ops(&tenant_kv, item_id, cancel).await?;
        tenant_kv.batch(ops, cancel).await
    }

    /// Build (without committing) the batch of deletes `delete` would
    /// issue. Empty if `item_id` was never indexed. See [`Self::put_ops`]
    /// for why this is exposed.
    ///
    /// # Errors
    /// Returns an error if the backend fails to read the existing record.
    pub(crate) async fn delete_ops(
        &self,
        tenant_kv: &Arc<dyn Kv>,
        item_id: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<BatchOp>> {
        let Some(indexes) = self.read_indexes(tenant_kv, item_id, cancel).await? else {
            return Ok(Vec::new());
        };

        let mut ops = Vec::with_capacity(indexes.len() + 1);
        for (property, value) in &indexes {
            ops.push(BatchOp::Delete(secondary_key(property, value, item_id)?));
        }
        ops.push(BatchOp::Delete(indexes_key(item_id)));
        Ok(ops)
    }

    /// The indexes currently recorded for `item_id`, if any.
    ///
    /// # Errors
    /// Returns an error if the backend fails to read, or the stored record
    /// is not valid JSON.
    pub async fn get_indexes(
        &self,
        tenant: &str,
        item_id: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<BTreeMap<String, Scalar>>> {
        let tenant_kv = self.tenant(tenant);
        self.read_indexes(&tenant_kv, item_id, cancel).await
    }

    async fn read_indexes(
        &self,
        tenant_kv: &Arc<dyn Kv>,
        item_id: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<BTreeMap<String, Scalar>>> {
        let Some(bytes) = tenant_kv.get(&indexes_key(item_id), cancel).await? else {
            return Ok(None);
        };
        let indexes = serde_json::from_slice(&bytes)?;
        Ok(Some(indexes))
    }

    /// Evaluate `filters` (an OR of AND-conjuncts) against everything
    /// indexed for `tenant`, sorted by `sort` and paginated per `page`.
    ///
    /// Returns the matching `itemId`s for this page, and a pagination
    /// cursor token if more results remain.
    ///
    /// # Errors
    /// Returns `Error::BadFilter` if `filters` is structurally invalid, or a
    /// backend error if a scan or read fails.
    pub async fn query(
        &self,
        tenant: &str,
        filters: &[Filter],
        sort: &Sort,
        page: &Page,
        cancel: Option<&CancelToken>,
    ) -> Result<(Vec<String>, Option<String>)> {
        validate_query(filters)?;

        // Limit 0 returns no results and no cursor regardless
        // of how many items match.
        if page.limit == Some(0) {
            return Ok((Vec::new(), None));
        }

        let tenant_kv = self.tenant(tenant);
        let mut seen: HashSet<String> = HashSet::new();
        let mut matches: Vec<(Scalar, String)> = Vec::new();

        for conjunct in filters {
            let candidates = self.scan_conjunct(&tenant_kv, conjunct, sort, cancel).await?;
            for item_id in candidates {
                if seen.contains(&item_id) {
                    continue;
                }
                let Some(indexes) = self.read_indexes(&tenant_kv, &item_id, cancel).await? else {
                    tracing::warn!(tenant, item_id, "secondary key referenced a missing indexes record");
                    continue;
                };
                if !matches_filter(&indexes, conjunct) {
                    continue;
                }
                let Some(sort_value) = indexes.get(&sort.property).cloned() else {
                    tracing::warn!(tenant, item_id, property = %sort.property, "item has no value for the sort property");
                    continue;
                };
                seen.insert(item_id.clone());
                matches.push((sort_value, item_id));
            }
        }

        matches.sort_by(|a, b| {
            let ord = scalar::compare(&a.0, &b.0).then_with(|| a.1.cmp(&b.1));
            if sort.direction == Direction::Desc { ord.reverse() } else { ord }
        });

        let start = match &page.cursor {
            None => 0,
            Some(cursor) => {
                let after = |value: &Scalar, item_id: &str| {
                    let ord = scalar::compare(value, &cursor.sort_value).then_with(|| item_id.cmp(&cursor.message_cid));
                    match sort.direction {
                        Direction::Asc => ord == std::cmp::Ordering::Greater,
                        Direction::Desc => ord == std::cmp::Ordering::Less,
                    }
                };
                matches.iter().position(|(v, id)| after(v, id)).unwrap_or(matches.len())
            }
        };
        let remaining = &matches[start..];

        let (page_items, has_more): (Vec<_>, bool) = match page.limit {
            Some(limit) => {
                let limit = limit as usize;
                (remaining.iter().take(limit).cloned().collect(), remaining.len() > limit)
            }
            None => (remaining.to_vec(), false),
        };

        let pagination_cursor = if has_more {
            page_items.last().map(|(sort_value, message_cid)| {
                crate::query::Cursor { sort_value: sort_value.clone(), message_cid: message_cid.clone() }
            })
        } else {
            None
        };
        let pagination_token = pagination_cursor.map(|c| c.encode()).transpose()?;

        Ok((page_items.into_iter().map(|(_, id)| id).collect(), pagination_token))
    }

    /// Pick a driver for `conjunct` and return every `itemId`
    /// its secondary keys reference. Callers re-check every candidate
    /// against the full conjunct, so this only needs to be a superset.
    async fn scan_conjunct(
        &self,
        tenant_kv: &Arc<dyn Kv>,
        conjunct: &Filter,
        sort: &Sort,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        if let Some(FilterValue::Range(range)) = conjunct.get(&sort.property) {
            return self.scan_range(tenant_kv, &sort.property, range, cancel).await;
        }

        // BTreeMap iterates in property-name order, giving us the
        // "canonical order" tie-break the driver choice needs.
        for (property, condition) in conjunct {
            match condition {
                FilterValue::Equal(value) => return self.scan_equal(tenant_kv, property, value, cancel).await,
                FilterValue::OneOf(values) => return self.scan_one_of(tenant_kv, property, values, cancel).await,
                FilterValue::Range(_) => {}
            }
        }

        // Every condition is a range on a non-sort property: fall back to
        // scanning the sort property's whole keyspace and let the per-item
        // re-check in `query` filter it down.
        self.scan_whole_property(tenant_kv, &sort.property, cancel).await
    }

    async fn scan_equal(
        &self,
        tenant_kv: &Arc<dyn Kv>,
        property: &str,
        value: &Scalar,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let prefix = value_prefix(property, value)?;
        self.scan_prefix(tenant_kv, &prefix, cancel).await
    }

    async fn scan_one_of(
        &self,
        tenant_kv: &Arc<dyn Kv>,
        property: &str,
        values: &[Scalar],
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let mut sorted = values.to_vec();
        sorted.sort_by(scalar::compare);
        let mut out = Vec::new();
        for value in &sorted {
            out.extend(self.scan_equal(tenant_kv, property, value, cancel).await?);
        }
        Ok(out)
    }

    async fn scan_range(
        &self,
        tenant_kv: &Arc<dyn Kv>,
        property: &str,
        range: &RangeFilter,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let opts = range_scan_options(property, range)?;
        self.scan_opts(tenant_kv, opts, cancel).await
    }

    async fn scan_whole_property(
        &self,
        tenant_kv: &Arc<dyn Kv>,
        property: &str,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let mut prefix = property.as_bytes().to_vec();
        prefix.push(0);
        self.scan_prefix(tenant_kv, &prefix, cancel).await
    }

    async fn scan_prefix(&self, tenant_kv: &Arc<dyn Kv>, prefix: &[u8], cancel: Option<&CancelToken>) -> Result<Vec<String>> {
        self.scan_opts(tenant_kv, ScanOptions::prefix(prefix), cancel).await
    }

    async fn scan_opts(&self, tenant_kv: &Arc<dyn Kv>, opts: ScanOptions, cancel: Option<&CancelToken>) -> Result<Vec<String>> {
        let mut it = tenant_kv.scan(opts, cancel).await?;
        let mut out = Vec::new();
        while let Some((_, value)) = it.next(cancel).await? {
            out.push(String::from_utf8(value).map_err(|e| Error::Corrupted(e.to_string()))?);
        }
        Ok(out)
    }
}

/// `__indexes\0<itemId>` → the item's full `property → Scalar` map, JSON
/// encoded.
fn indexes_key(item_id: &str) -> Vec<u8> {
    join_key(&[INDEXES_PREFIX, item_id.as_bytes()])
}

/// `<property>\0<encoded value>\0<itemId>` → `itemId`.
fn secondary_key(property: &str, value: &Scalar, item_id: &str) -> Result<Vec<u8>> {
    let mut key = value_prefix(property, value)?;
    key.extend_from_slice(item_id.as_bytes());
    Ok(key)
}

/// The prefix `<property>\0<encoded value>\0` shared by every secondary key
/// for `property == value`, regardless of `itemId`.
fn value_prefix(property: &str, value: &Scalar) -> Result<Vec<u8>> {
    let mut key = property.as_bytes().to_vec();
    key.push(0);
    key.extend(scalar::encode_scalar(value)?);
    key.push(0);
    Ok(key)
}

/// Translate a [`RangeFilter`] on `property` into [`ScanOptions`] bounds
/// over that property's secondary-key range.
///
/// Because a value's secondary keys are `property\0value\0itemId` rather
/// than the bare `property\0value`, an exact-bound comparison against
/// `property\0encode(v)` always sorts *before* every key for that value (the
/// trailing `\0itemId` makes them greater). So:
/// - `gte(v)`/`lt(v)` can bound directly against `property\0encode(v)`.
/// - `gt(v)`/`lte(v)` must bound against the prefix-upper-bound of
///   `property\0encode(v)` instead, to skip over (or include the whole of)
///   that value's key range rather than stopping partway through it.
fn range_scan_options(property: &str, range: &RangeFilter) -> Result<ScanOptions> {
    let at = |value: &Scalar| -> Result<Vec<u8>> {
        let mut key = property.as_bytes().to_vec();
        key.push(0);
        key.extend(scalar::encode_scalar(value)?);
        Ok(key)
    };
    let mut property_prefix = property.as_bytes().to_vec();
    property_prefix.push(0);

    let gte = if let Some(v) = &range.gt {
        prefix_upper_bound(&at(v)?)
    } else if let Some(v) = &range.gte {
        at(v)?
    } else {
        property_prefix.clone()
    };
    let lt = if let Some(v) = &range.lt {
        at(v)?
    } else if let Some(v) = &range.lte {
        prefix_upper_bound(&at(v)?)
    } else {
        prefix_upper_bound(&property_prefix)
    };
    Ok(ScanOptions { gte: Some(gte), lt: Some(lt), ..ScanOptions::default() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use crate::query::{Cursor, Direction};

    fn idx(pairs: &[(&str, Scalar)]) -> BTreeMap<String, Scalar> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    fn sort_by(property: &str) -> Sort {
        Sort { property: property.to_string(), direction: Direction::Asc }
    }

    async fn seeded() -> IndexLevel {
        let level = IndexLevel::new(Arc::new(MemoryKv::new()));
        level.open().await.unwrap();
        level
            .put(
                "did:example:alice",
                "item1",
                &idx(&[("schema", Scalar::from("foo")), ("messageTimestamp", Scalar::from(1.0))]),
                None,
            )
            .await
            .unwrap();
        level
            .put(
                "did:example:alice",
                "item2",
                &idx(&[("schema", Scalar::from("bar")), ("messageTimestamp", Scalar::from(2.0))]),
                None,
            )
            .await
            .unwrap();
        level
            .put(
                "did:example:alice",
                "item3",
                &idx(&[("schema", Scalar::from("foo")), ("messageTimestamp", Scalar::from(3.0))]),
                None,
            )
            .await
            .unwrap();
        level
    }

    #[tokio::test]
    async fn equality_query_returns_only_matching_items() {
        let level = seeded().await;
        let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("foo")))].into();
        let (items, cursor) =
            level.query("did:example:alice", &[filter], &sort_by("messageTimestamp"), &Page::default(), None).await.unwrap();
        assert_eq!(items, vec!["item1".to_string(), "item3".to_string()]);
        assert!(cursor.is_none());
    }

    #[tokio::test]
    async fn query_is_tenant_scoped() {
        let level = seeded().await;
        let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("foo")))].into();
        let (items, _) =
            level.query("did:example:bob", &[filter], &sort_by("messageTimestamp"), &Page::default(), None).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn range_query_on_sort_property_uses_it_as_driver() {
        let level = seeded().await;
        let range = RangeFilter { gte: Some(Scalar::from(2.0)), ..Default::default() };
        let filter: Filter = [("messageTimestamp".to_string(), FilterValue::Range(range))].into();
        let (items, _) =
            level.query("did:example:alice", &[filter], &sort_by("messageTimestamp"), &Page::default(), None).await.unwrap();
        assert_eq!(items, vec!["item2".to_string(), "item3".to_string()]);
    }

    #[tokio::test]
    async fn disjunction_unions_and_dedups_across_conjuncts() {
        let level = seeded().await;
        let f1: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("foo")))].into();
        let f2: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("bar")))].into();
        let (items, _) = level
            .query("did:example:alice", &[f1, f2], &sort_by("messageTimestamp"), &Page::default(), None)
            .await
            .unwrap();
        assert_eq!(items, vec!["item1".to_string(), "item2".to_string(), "item3".to_string()]);
    }

    #[tokio::test]
    async fn pagination_walks_forward_with_cursor() {
        let level = seeded().await;
        let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("foo")))].into();
        let page = Page { limit: Some(1), cursor: None };
        let (first, cursor) =
            level.query("did:example:alice", &[filter.clone()], &sort_by("messageTimestamp"), &page, None).await.unwrap();
        assert_eq!(first, vec!["item1".to_string()]);
        let cursor = cursor.expect("more results remain");

        let page2 = Page { limit: Some(1), cursor: Some(Cursor::decode(&cursor).unwrap()) };
        let (second, cursor2) =
            level.query("did:example:alice", &[filter], &sort_by("messageTimestamp"), &page2, None).await.unwrap();
        assert_eq!(second, vec!["item3".to_string()]);
        assert!(cursor2.is_none());
    }

    #[tokio::test]
    async fn zero_limit_returns_nothing_and_no_cursor() {
        let level = seeded().await;
        let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("foo")))].into();
        let page = Page { limit: Some(0), cursor: None };
        let (items, cursor) =
            level.query("did:example:alice", &[filter], &sort_by("messageTimestamp"), &page, None).await.unwrap();
        assert!(items.is_empty());
        assert!(cursor.is_none());
    }

    #[tokio::test]
    async fn delete_removes_item_from_future_queries() {
        let level = seeded().await;
        level.delete("did:example:alice", "item1", None).await.unwrap();
        assert!(level.get_indexes("did:example:alice", "item1", None).await.unwrap().is_none());

        let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("foo")))].into();
        let (items, _) =
            level.query("did:example:alice", &[filter], &sort_by("messageTimestamp"), &Page::default(), None).await.unwrap();
        assert_eq!(items, vec!["item3".to_string()]);
    }

    #[tokio::test]
    async fn reindexing_an_item_drops_its_old_secondary_keys() {
        let level = seeded().await;
        level
            .put("did:example:alice", "item1", &idx(&[("schema", Scalar::from("bar")), ("messageTimestamp", Scalar::from(1.0))]), None)
            .await
            .unwrap();

        let filter: Filter = [("schema".to_string(), FilterValue::Equal(Scalar::from("foo")))].into();
        let (items, _) =
            level.query("did:example:alice", &[filter], &sort_by("messageTimestamp"), &Page::default(), None).await.unwrap();
        assert_eq!(items, vec!["item3".to_string()]);
    }
}
