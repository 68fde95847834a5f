//! factline storage - collaborator traits, cache layer, in-memory backends
//!
//! Defines the storage abstractions the resolution pipeline depends on. Real
//! deployments plug in their own [`KvBackend`], [`FactStore`] and
//! [`IdentityStore`]; the in-memory implementations here back tests and
//! single-process runs.

pub mod cache;
mod memory;
mod traits;

pub use cache::{CacheKey, CacheKeyBuilder, CacheLayer, CacheStats};
pub use memory::{InMemoryFactStore, InMemoryIdentityStore, MemoryKvBackend};
pub use traits::{
    CredentialUpdate, FactFilter, FactStore, IdentityStore, IdentityUpdate, KvBackend,
};
