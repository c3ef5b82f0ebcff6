//! # Content addressing
//!
//! Message content address: canonical dag-cbor bytes, SHA-256, rendered as a
//! CIDv1 with the `dag-cbor` codec and base32 multibase encoding (the
//! default `Display` of [`cid::Cid`] for a v1 CID). `serde_ipld_dagcbor`
//! encodes maps with their keys in canonical byte-lexicographic order, so
//! two callers serializing the same logical value always produce identical
//! bytes and therefore identical CIDs.

use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;

use crate::error::{Error, Result};

const DAG_CBOR: u64 = 0x71;
const RAW: u64 = 0x55;

/// Canonical dag-cbor bytes for `value` and the CIDv1 content address
/// computed over them. Returning both avoids re-encoding the value a second
/// time to persist it.
///
/// # Errors
/// Returns an error if `value` cannot be represented in dag-cbor (e.g. a map
/// with non-string keys).
pub fn content_address<T: Serialize>(value: &T) -> Result<(String, Vec<u8>)> {
    let bytes = serde_ipld_dagcbor::to_vec(value).map_err(|e| Error::Serde(e.to_string()))?;
    let hash = Code::Sha2_256.digest(&bytes);
    let cid = cid::Cid::new_v1(DAG_CBOR, hash);
    Ok((cid.to_string(), bytes))
}

/// A CIDv1 content address over raw, uninterpreted `bytes` (a
/// `dataCid`, when a caller wants this crate to compute it rather than
/// supplying one already computed upstream).
#[must_use]
pub fn raw_cid(bytes: &[u8]) -> String {
    let hash = Code::Sha2_256.digest(bytes);
    cid::Cid::new_v1(RAW, hash).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_address_is_deterministic() {
        let value = serde_json::json!({"b": 1, "a": 2});
        let (cid1, bytes1) = content_address(&value).unwrap();
        let (cid2, bytes2) = content_address(&value).unwrap();
        assert_eq!(cid1, cid2);
        assert_eq!(bytes1, bytes2);
        assert!(cid1.starts_with('b'), "CIDv1 default display is base32, prefixed with 'b'");
    }

    #[test]
    fn raw_cid_differs_from_dag_cbor_cid_over_same_bytes() {
        let bytes = b"hello world";
        let raw = raw_cid(bytes);
        let (dag, _) = content_address(&"hello world").unwrap();
        assert_ne!(raw, dag);
    }
}
