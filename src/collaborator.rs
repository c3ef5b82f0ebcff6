//! # Collaborator contracts
//!
//! Thin, opaque seams for the concerns this crate explicitly does not
//! implement: signing, schema validation, and authorization. A handler
//! built on top of [`crate::message_store::MessageStore`] is expected to
//! call these *before* `put`; the store itself never invokes them. Only
//! null test doubles live here — real implementations belong upstream.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// Produces a signature over arbitrary bytes. Algorithm choice, key
/// management, and verification are out of scope: the store only ever
/// treats the resulting bytes as opaque payload that gets hashed along with
/// the rest of the message.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign `bytes`, returning the signature.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    async fn sign(&self, bytes: &[u8]) -> Result<Vec<u8>>;
}

/// Validates a value against a named schema. Called by handlers before
/// `put`; the store never validates message content itself.
pub trait SchemaValidator: Send + Sync {
    /// Validate `value` against the schema named `kind`.
    ///
    /// # Errors
    /// Returns an error describing the validation failure.
    fn validate(&self, kind: &str, value: &Value) -> Result<()>;
}

/// Authorizes a message for a tenant. Called by handlers before `put`; the
/// store never authorizes anything itself.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Authorize `message` for `tenant`.
    ///
    /// # Errors
    /// Returns an error describing why authorization was denied.
    async fn authorize(&self, tenant: &str, message: &Value) -> Result<()>;
}

/// A [`Signer`] that returns an empty signature. For tests wiring up a
/// `Provider`-shaped dependency graph without a real signing key.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSigner;

#[async_trait]
impl Signer for NullSigner {
    async fn sign(&self, _bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// A [`SchemaValidator`] that accepts everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullValidator;

impl SchemaValidator for NullValidator {
    fn validate(&self, _kind: &str, _value: &Value) -> Result<()> {
        Ok(())
    }
}

/// An [`Authorizer`] that allows everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAuthorizer;

#[async_trait]
impl Authorizer for NullAuthorizer {
    async fn authorize(&self, _tenant: &str, _message: &Value) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_signer_returns_an_empty_signature() {
        assert_eq!(NullSigner.sign(b"anything").await.unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn null_validator_accepts_anything() {
        assert!(NullValidator.validate("any-schema", &serde_json::json!({"x": 1})).is_ok());
    }

    #[tokio::test]
    async fn null_authorizer_allows_everything() {
        assert!(NullAuthorizer.authorize("did:example:alice", &serde_json::json!({})).await.is_ok());
    }
}
