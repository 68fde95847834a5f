//! Collaborator traits
//!
//! The resolution pipeline talks to three external capabilities: a key/value
//! store with atomic counters (cache and quota), a persistent fact store, and
//! an identity store. Each is an object-safe async trait so services can hold
//! `Arc<dyn ...>` and tests can swap in fakes.

use async_trait::async_trait;
use factline_core::{Category, Credential, EntityId, Fact, Identity, NewFact, StorageResult};
use std::time::Duration;

// ============================================================================
// KEY/VALUE BACKEND
// ============================================================================

/// Backing store for the cache layer and the quota counters.
///
/// Values are opaque strings. Every key carries an expiry; reads past expiry
/// behave as if the key were absent.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read a value, `None` if absent or expired.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write a value, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> StorageResult<()>;

    /// Remove a key. Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Atomically add `by` to a counter and return the new value.
    ///
    /// A missing or expired counter starts at zero and receives `ttl`; an
    /// existing counter keeps its expiry.
    async fn incr_with_expiry(&self, key: &str, by: u64, ttl: Duration) -> StorageResult<u64>;

    /// Add `member` to the set at `key`.
    ///
    /// The set's expiry becomes the later of its current expiry and
    /// `now + ttl`; it is never shortened.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> StorageResult<()>;

    /// Members of the set at `key`, empty if absent or expired.
    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>>;
}

// ============================================================================
// FACT STORE
// ============================================================================

/// Query constraints for fact lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactFilter {
    pub category: Option<Category>,
    /// Require this verification flag when set.
    pub verified: Option<bool>,
    /// Exclude generator-sourced records.
    pub exclude_generated: bool,
}

impl FactFilter {
    /// Verified facts, optionally constrained to a category.
    pub fn verified(category: Option<Category>) -> Self {
        Self {
            category,
            verified: Some(true),
            exclude_generated: false,
        }
    }

    pub fn excluding_generated(mut self, exclude: bool) -> Self {
        self.exclude_generated = exclude;
        self
    }

    /// Whether `fact` satisfies every constraint.
    pub fn matches(&self, fact: &Fact) -> bool {
        if let Some(category) = self.category {
            if fact.category != category {
                return false;
            }
        }
        if let Some(verified) = self.verified {
            if fact.verified != verified {
                return false;
            }
        }
        !(self.exclude_generated && fact.generated)
    }
}

/// Persistent fact storage.
#[async_trait]
pub trait FactStore: Send + Sync {
    /// First matching fact in storage order.
    async fn find_one(&self, filter: &FactFilter) -> StorageResult<Option<Fact>>;

    /// Uniform random sample of one matching fact.
    async fn sample_one(&self, filter: &FactFilter) -> StorageResult<Option<Fact>>;

    /// Insert a new fact and return the stored record.
    async fn insert(&self, fact: NewFact) -> StorageResult<Fact>;

    /// Fetch a fact by id.
    async fn get(&self, id: EntityId) -> StorageResult<Option<Fact>>;

    /// Increment the view counter. Fails with `NotFound` for unknown ids.
    async fn record_view(&self, id: EntityId) -> StorageResult<Fact>;

    /// Increment the like counter. Fails with `NotFound` for unknown ids.
    async fn record_like(&self, id: EntityId) -> StorageResult<Fact>;
}

// ============================================================================
// IDENTITY STORE
// ============================================================================

/// Mutation applied by an identity store to a freshly read record.
pub type IdentityUpdate<'a> = &'a (dyn Fn(&mut Identity) + Send + Sync);

/// Mutation applied by an identity store to a freshly read record.
pub type CredentialUpdate<'a> = &'a (dyn Fn(&mut Credential) + Send + Sync);

/// Identity and credential storage.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up a credential by the SHA-256 hex digest of its secret, along
    /// with its owning identity. Status is not filtered here.
    async fn find_by_credential(
        &self,
        secret_hash: &str,
    ) -> StorageResult<Option<(Identity, Credential)>>;

    /// Apply `update` to the current identity record under the store's own
    /// synchronization and return the result.
    async fn update_identity(
        &self,
        id: EntityId,
        update: IdentityUpdate<'_>,
    ) -> StorageResult<Identity>;

    /// Apply `update` to the current credential record under the store's own
    /// synchronization and return the result.
    async fn update_credential(
        &self,
        id: EntityId,
        update: CredentialUpdate<'_>,
    ) -> StorageResult<Credential>;
}
