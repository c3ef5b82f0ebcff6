//! # Query types
//!
//! The filter/sort/page vocabulary shared by [`crate::index_level`],
//! [`crate::message_store`], and [`crate::event`] (event fan-out reuses the
//! same single-item predicate evaluator as the query engine).

use std::collections::BTreeMap;

use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scalar::{self, Scalar};

/// One property's condition within a [`Filter`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FilterValue {
    /// `property == value`.
    Equal(Scalar),
    /// `property` is one of `values` (an OR within this conjunct).
    OneOf(Vec<Scalar>),
    /// A bound on `property`, at least one side set.
    Range(RangeFilter),
}

/// A range condition. `gt`/`gte` and `lt`/`lte` are each mutually
/// exclusive; at least one side overall must be set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RangeFilter {
    /// Exclusive lower bound.
    pub gt: Option<Scalar>,
    /// Inclusive lower bound.
    pub gte: Option<Scalar>,
    /// Exclusive upper bound.
    pub lt: Option<Scalar>,
    /// Inclusive upper bound.
    pub lte: Option<Scalar>,
}

impl RangeFilter {
    fn validate(&self) -> Result<()> {
        if self.gt.is_some() && self.gte.is_some() {
            return Err(Error::BadFilter("range has both `gt` and `gte`".into()));
        }
        if self.lt.is_some() && self.lte.is_some() {
            return Err(Error::BadFilter("range has both `lt` and `lte`".into()));
        }
        if self.gt.is_none() && self.gte.is_none() && self.lt.is_none() && self.lte.is_none() {
            return Err(Error::BadFilter("range has no bound set".into()));
        }
        Ok(())
    }

    fn contains(&self, value: &Scalar) -> bool {
        if let Some(gt) = &self.gt {
            if scalar::compare(value, gt) != std::cmp::Ordering::Greater {
                return false;
            }
        }
        if let Some(gte) = &self.gte {
            if scalar::compare(value, gte) == std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(lt) = &self.lt {
            if scalar::compare(value, lt) != std::cmp::Ordering::Less {
                return false;
            }
        }
        if let Some(lte) = &self.lte {
            if scalar::compare(value, lte) == std::cmp::Ordering::Greater {
                return false;
            }
        }
        true
    }
}

/// One conjunct: an AND over its property → condition pairs. A query
/// (`Vec<Filter>`) is the OR over its conjuncts.
pub type Filter = BTreeMap<String, FilterValue>;

/// Validate one conjunct in isolation (used both for a standalone conjunct
/// and as part of [`validate_query`]).
fn validate_filter(filter: &Filter) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::BadFilter("filter has no conditions".into()));
    }
    for (property, condition) in filter {
        scalar::validate_property(property)?;
        if let FilterValue::Range(range) = condition {
            range.validate()?;
        }
    }
    Ok(())
}

/// Validate a whole query: rejects `[]`, rejects
/// any empty conjunct (so `[{}]` and `[{...}, {}]` are both rejected), and
/// validates every range within every conjunct.
pub fn validate_query(filters: &[Filter]) -> Result<()> {
    if filters.is_empty() {
        return Err(Error::BadFilter("query has no filters".into()));
    }
    for filter in filters {
        validate_filter(filter)?;
    }
    Ok(())
}

/// Whether `indexes` satisfies every condition in `filter`.
#[must_use]
pub fn matches_filter(indexes: &BTreeMap<String, Scalar>, filter: &Filter) -> bool {
    filter.iter().all(|(property, condition)| {
        let Some(value) = indexes.get(property) else { return false };
        match condition {
            FilterValue::Equal(expected) => value == expected,
            FilterValue::OneOf(options) => options.contains(value),
            FilterValue::Range(range) => range.contains(value),
        }
    })
}

/// Whether `indexes` satisfies at least one conjunct in `filters` (the
/// outer OR).
#[must_use]
pub fn matches_any(indexes: &BTreeMap<String, Scalar>, filters: &[Filter]) -> bool {
    filters.iter().any(|f| matches_filter(indexes, f))
}

/// Sort direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Oldest/lowest first.
    #[default]
    Asc,
    /// Newest/highest first.
    Desc,
}

/// The property and direction results are ordered by.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sort {
    /// The indexed property to sort on.
    pub property: String,
    /// Sort direction.
    pub direction: Direction,
}

impl Default for Sort {
    fn default() -> Self {
        Self { property: "messageTimestamp".to_string(), direction: Direction::Asc }
    }
}

/// Pagination token: the `(sortValue, messageCid)` of the last item
/// returned by a previous page. Opaque to callers; they're expected to
/// decode whatever [`crate::message_store::QueryResult::pagination_message_cid`]
/// returned and pass it back as the next [`Page`]'s `cursor`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    /// The sort property's value on the last returned item.
    pub sort_value: Scalar,
    /// The last returned item's `MessageCid`.
    pub message_cid: String,
}

impl Cursor {
    /// Encode as an opaque, URL-safe token.
    ///
    /// # Errors
    /// Returns an error if the cursor cannot be serialized.
    pub fn encode(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(Base64UrlUnpadded::encode_string(&bytes))
    }

    /// Decode a token produced by [`Self::encode`].
    ///
    /// # Errors
    /// Returns an error if `token` is not a validly encoded cursor.
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = Base64UrlUnpadded::decode_vec(token)
            .map_err(|e| Error::BadFilter(format!("invalid cursor: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Pagination request.
#[derive(Clone, Debug, Default)]
pub struct Page {
    /// Maximum number of items to return. `None` means "no limit"; callers
    /// with large result sets should set this.
    pub limit: Option<u32>,
    /// Resume after this cursor.
    pub cursor: Option<Cursor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(pairs: &[(&str, FilterValue)]) -> Filter {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn empty_query_rejected() {
        assert!(validate_query(&[]).is_err());
    }

    #[test]
    fn single_empty_filter_rejected() {
        assert!(validate_query(&[Filter::new()]).is_err());
    }

    #[test]
    fn empty_filter_inside_multi_filter_query_rejected() {
        let ok = filter(&[("schema", FilterValue::Equal(Scalar::from("schema2")))]);
        assert!(validate_query(&[ok, Filter::new()]).is_err());
    }

    #[test]
    fn range_with_both_gt_and_gte_rejected() {
        let range = RangeFilter { gt: Some(Scalar::from(1.0)), gte: Some(Scalar::from(1.0)), ..Default::default() };
        let f = filter(&[("x", FilterValue::Range(range))]);
        assert!(validate_query(&[f]).is_err());
    }

    #[test]
    fn range_with_no_bounds_rejected() {
        let f = filter(&[("x", FilterValue::Range(RangeFilter::default()))]);
        assert!(validate_query(&[f]).is_err());
    }

    #[test]
    fn matches_filter_checks_all_conditions() {
        let mut indexes = BTreeMap::new();
        indexes.insert("schema".to_string(), Scalar::from("schema2"));
        indexes.insert("published".to_string(), Scalar::from(true));

        let f = filter(&[
            ("schema", FilterValue::Equal(Scalar::from("schema2"))),
            ("published", FilterValue::Equal(Scalar::from(true))),
        ]);
        assert!(matches_filter(&indexes, &f));

        let f2 = filter(&[("schema", FilterValue::Equal(Scalar::from("schema1")))]);
        assert!(!matches_filter(&indexes, &f2));
    }

    #[test]
    fn missing_property_does_not_match() {
        let indexes = BTreeMap::new();
        let f = filter(&[("schema", FilterValue::Equal(Scalar::from("schema2")))]);
        assert!(!matches_filter(&indexes, &f));
    }

    #[test]
    fn cursor_round_trips_through_its_token() {
        let cursor = Cursor { sort_value: Scalar::from(42.0), message_cid: "bafy123".to_string() };
        let token = cursor.encode().unwrap();
        assert_eq!(Cursor::decode(&token).unwrap(), cursor);
    }
}
