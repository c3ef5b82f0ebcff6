//! # dwn-store
//!
//! A tenant-partitioned, multi-index message store for a Decentralized Web
//! Node: a durable `(tenant, messageCid) -> message` mapping
//! ([`message_store`]) backed by a secondary-index layer ([`index_level`])
//! and a disjunction-of-conjunctions query engine ([`query`]), plus
//! content-addressed blob storage ([`blob_store`]) and in-process event
//! fan-out ([`event`]).
//!
//! Everything above the ordered key-value substrate ([`kv`]) is written
//! against the [`kv::Kv`] trait, so callers can run on the durable `sled`
//! backend or the in-memory backend used by this crate's own tests.
//!
//! Signing, schema validation, authorization, DID resolution, and wire
//! transport are explicitly out of scope; [`collaborator`] defines the
//! minimal seams a handler built on top of this crate plugs real
//! implementations into.

pub mod blob_store;
pub mod cancel;
pub mod cid;
pub mod collaborator;
pub mod error;
pub mod event;
pub mod index_level;
pub mod kv;
pub mod message_store;
pub mod query;
pub mod scalar;

pub use blob_store::BlobStore;
pub use error::{Error, Result};
pub use event::EventBus;
pub use index_level::IndexLevel;
pub use message_store::MessageStore;
