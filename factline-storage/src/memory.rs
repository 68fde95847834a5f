//! In-memory reference backends.
//!
//! Used by tests and single-process deployments. Expiry is lazy: entries past
//! their deadline are dropped when next touched, never swept in the
//! background.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use factline_core::{
    Clock, Credential, EntityId, Fact, Identity, NewFact, StorageError, StorageResult,
};
use rand::seq::IndexedRandom;

use crate::traits::{CredentialUpdate, FactFilter, FactStore, IdentityStore, IdentityUpdate, KvBackend};

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ============================================================================
// KEY/VALUE BACKEND
// ============================================================================

#[derive(Debug, Clone)]
enum KvValue {
    Text(String),
    Counter(u64),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: KvValue,
    expires_at: DateTime<Utc>,
}

impl KvEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

fn wrong_type(key: &str, expected: &str) -> StorageError {
    StorageError::Unavailable {
        reason: format!("key {} does not hold a {}", key, expected),
    }
}

/// Concurrent in-memory [`KvBackend`].
///
/// Counter increments and set additions hold the per-key shard lock for the
/// whole read-modify-write, so they are atomic with respect to each other.
pub struct MemoryKvBackend {
    entries: DashMap<String, KvEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryKvBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries held, including expired ones not yet touched.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a live (unexpired) key exists.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    fn live(&self, key: &str) -> Option<KvEntry> {
        let now = self.clock.now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Some(entry.value().clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        None
    }
}

impl std::fmt::Debug for MemoryKvBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKvBackend")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[async_trait]
impl KvBackend for MemoryKvBackend {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        match self.live(key).map(|entry| entry.value) {
            None => Ok(None),
            Some(KvValue::Text(text)) => Ok(Some(text)),
            Some(KvValue::Counter(count)) => Ok(Some(count.to_string())),
            Some(KvValue::Set(_)) => Err(wrong_type(key, "string")),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> StorageResult<()> {
        let expires_at = expiry(self.clock.now(), ttl);
        self.entries.insert(
            key.to_string(),
            KvEntry {
                value: KvValue::Text(value),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn incr_with_expiry(&self, key: &str, by: u64, ttl: Duration) -> StorageResult<u64> {
        let now = self.clock.now();
        let fresh = || KvEntry {
            value: KvValue::Counter(0),
            expires_at: expiry(now, ttl),
        };

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(fresh);
        if entry.is_expired(now) {
            *entry = fresh();
        }

        let current = match &entry.value {
            KvValue::Counter(count) => *count,
            KvValue::Text(text) => text
                .parse::<u64>()
                .map_err(|_| wrong_type(key, "counter"))?,
            KvValue::Set(_) => return Err(wrong_type(key, "counter")),
        };
        let next = current.saturating_add(by);
        entry.value = KvValue::Counter(next);
        Ok(next)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> StorageResult<()> {
        let now = self.clock.now();
        let deadline = expiry(now, ttl);
        let fresh = || KvEntry {
            value: KvValue::Set(BTreeSet::new()),
            expires_at: deadline,
        };

        let mut entry = self.entries.entry(key.to_string()).or_insert_with(fresh);
        if entry.is_expired(now) {
            *entry = fresh();
        }

        match &mut entry.value {
            KvValue::Set(members) => {
                members.insert(member.to_string());
            }
            _ => return Err(wrong_type(key, "set")),
        }
        if deadline > entry.expires_at {
            entry.expires_at = deadline;
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>> {
        match self.live(key).map(|entry| entry.value) {
            None => Ok(Vec::new()),
            Some(KvValue::Set(members)) => Ok(members.into_iter().collect()),
            Some(_) => Err(wrong_type(key, "set")),
        }
    }
}

// ============================================================================
// FACT STORE
// ============================================================================

/// In-memory [`FactStore`]. Storage order is insertion order.
pub struct InMemoryFactStore {
    facts: RwLock<Vec<Fact>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryFactStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            facts: RwLock::new(Vec::new()),
            clock,
        }
    }

    /// Store pre-built facts as-is.
    pub fn with_facts(clock: Arc<dyn Clock>, facts: Vec<Fact>) -> Self {
        Self {
            facts: RwLock::new(facts),
            clock,
        }
    }

    /// Number of stored facts.
    pub fn len(&self) -> StorageResult<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.read()?.is_empty())
    }

    /// Snapshot of every stored fact.
    pub fn all(&self) -> StorageResult<Vec<Fact>> {
        Ok(self.read()?.clone())
    }

    fn read(&self) -> StorageResult<std::sync::RwLockReadGuard<'_, Vec<Fact>>> {
        self.facts.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> StorageResult<std::sync::RwLockWriteGuard<'_, Vec<Fact>>> {
        self.facts.write().map_err(|_| StorageError::LockPoisoned)
    }

    fn bump(&self, id: EntityId, apply: impl FnOnce(&mut Fact)) -> StorageResult<Fact> {
        let mut facts = self.write()?;
        let fact = facts
            .iter_mut()
            .find(|fact| fact.id == id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "fact".to_string(),
                id: id.to_string(),
            })?;
        apply(fact);
        Ok(fact.clone())
    }
}

impl std::fmt::Debug for InMemoryFactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryFactStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn find_one(&self, filter: &FactFilter) -> StorageResult<Option<Fact>> {
        Ok(self.read()?.iter().find(|fact| filter.matches(fact)).cloned())
    }

    async fn sample_one(&self, filter: &FactFilter) -> StorageResult<Option<Fact>> {
        let facts = self.read()?;
        let candidates: Vec<&Fact> = facts.iter().filter(|fact| filter.matches(fact)).collect();
        Ok(candidates.choose(&mut rand::rng()).map(|fact| (*fact).clone()))
    }

    async fn insert(&self, fact: NewFact) -> StorageResult<Fact> {
        let fact = fact.into_fact(self.clock.now());
        self.write()?.push(fact.clone());
        Ok(fact)
    }

    async fn get(&self, id: EntityId) -> StorageResult<Option<Fact>> {
        Ok(self.read()?.iter().find(|fact| fact.id == id).cloned())
    }

    async fn record_view(&self, id: EntityId) -> StorageResult<Fact> {
        self.bump(id, |fact| fact.views += 1)
    }

    async fn record_like(&self, id: EntityId) -> StorageResult<Fact> {
        self.bump(id, |fact| fact.likes += 1)
    }
}

// ============================================================================
// IDENTITY STORE
// ============================================================================

#[derive(Debug, Default)]
struct IdentityTables {
    identities: HashMap<EntityId, Identity>,
    credentials: HashMap<EntityId, Credential>,
    by_hash: HashMap<String, EntityId>,
}

/// In-memory [`IdentityStore`].
///
/// All tables sit behind one lock so update closures always see, and
/// replace, the latest record.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    tables: RwLock<IdentityTables>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_identity(&self, identity: Identity) -> StorageResult<()> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        if tables.identities.contains_key(&identity.id) {
            return Err(StorageError::InsertFailed {
                entity: "identity".to_string(),
                reason: "already exists".to_string(),
            });
        }
        tables.identities.insert(identity.id, identity);
        Ok(())
    }

    /// Insert a credential. Its owning identity must already exist.
    pub fn insert_credential(&self, credential: Credential) -> StorageResult<()> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        if !tables.identities.contains_key(&credential.identity_id) {
            return Err(StorageError::InsertFailed {
                entity: "credential".to_string(),
                reason: format!("identity {} does not exist", credential.identity_id),
            });
        }
        if tables.by_hash.contains_key(&credential.secret_hash) {
            return Err(StorageError::InsertFailed {
                entity: "credential".to_string(),
                reason: "secret already registered".to_string(),
            });
        }
        tables
            .by_hash
            .insert(credential.secret_hash.clone(), credential.id);
        tables.credentials.insert(credential.id, credential);
        Ok(())
    }

    pub fn identity(&self, id: EntityId) -> StorageResult<Option<Identity>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.identities.get(&id).cloned())
    }

    pub fn credential(&self, id: EntityId) -> StorageResult<Option<Credential>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(tables.credentials.get(&id).cloned())
    }
}

#[async_trait]
impl IdentityStore for InMemoryIdentityStore {
    async fn find_by_credential(
        &self,
        secret_hash: &str,
    ) -> StorageResult<Option<(Identity, Credential)>> {
        let tables = self.tables.read().map_err(|_| StorageError::LockPoisoned)?;
        let Some(credential) = tables
            .by_hash
            .get(secret_hash)
            .and_then(|id| tables.credentials.get(id))
        else {
            return Ok(None);
        };
        Ok(tables
            .identities
            .get(&credential.identity_id)
            .map(|identity| (identity.clone(), credential.clone())))
    }

    async fn update_identity(
        &self,
        id: EntityId,
        update: IdentityUpdate<'_>,
    ) -> StorageResult<Identity> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let identity = tables
            .identities
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "identity".to_string(),
                id: id.to_string(),
            })?;
        update(identity);
        Ok(identity.clone())
    }

    async fn update_credential(
        &self,
        id: EntityId,
        update: CredentialUpdate<'_>,
    ) -> StorageResult<Credential> {
        let mut tables = self.tables.write().map_err(|_| StorageError::LockPoisoned)?;
        let credential = tables
            .credentials
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound {
                entity: "credential".to_string(),
                id: id.to_string(),
            })?;
        update(credential);
        Ok(credential.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factline_core::{Category, CredentialKind, ManualClock, PlanTier};

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at_epoch_secs(1_717_200_000))
    }

    #[tokio::test]
    async fn test_kv_expiry_is_lazy() {
        let clock = clock();
        let kv = MemoryKvBackend::new(clock.clone());
        kv.set("a", "1".to_string(), Duration::from_secs(10)).await.unwrap();
        assert_eq!(kv.len(), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.get("a").await.unwrap(), None);
        assert_eq!(kv.len(), 0);
    }

    #[tokio::test]
    async fn test_incr_keeps_first_expiry() {
        let clock = clock();
        let kv = MemoryKvBackend::new(clock.clone());
        assert_eq!(kv.incr_with_expiry("c", 1, Duration::from_secs(10)).await.unwrap(), 1);

        clock.advance(Duration::from_secs(5));
        assert_eq!(kv.incr_with_expiry("c", 2, Duration::from_secs(60)).await.unwrap(), 3);

        clock.advance(Duration::from_secs(5));
        assert_eq!(kv.incr_with_expiry("c", 1, Duration::from_secs(10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_get_reads_counter_as_text() {
        let kv = MemoryKvBackend::new(clock());
        kv.incr_with_expiry("c", 4, Duration::from_secs(10)).await.unwrap();
        assert_eq!(kv.get("c").await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_set_add_extends_never_shortens() {
        let clock = clock();
        let kv = MemoryKvBackend::new(clock.clone());
        kv.set_add("tag", "k1", Duration::from_secs(100)).await.unwrap();
        kv.set_add("tag", "k2", Duration::from_secs(10)).await.unwrap();

        clock.advance(Duration::from_secs(50));
        let members = kv.set_members("tag").await.unwrap();
        assert_eq!(members, vec!["k1".to_string(), "k2".to_string()]);

        clock.advance(Duration::from_secs(50));
        assert!(kv.set_members("tag").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type_errors() {
        let kv = MemoryKvBackend::new(clock());
        kv.set_add("tag", "k1", Duration::from_secs(10)).await.unwrap();
        assert!(kv.get("tag").await.is_err());
        assert!(kv.incr_with_expiry("tag", 1, Duration::from_secs(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_fact_store_filters_and_counters() {
        let store = InMemoryFactStore::new(clock());
        store
            .insert(NewFact::verified("Venus spins in the opposite direction to most planets.", Category::Space))
            .await
            .unwrap();
        let generated = store
            .insert(NewFact::generated("A day on Mercury lasts longer than its year.", Category::Space))
            .await
            .unwrap();

        let verified = store
            .find_one(&FactFilter::verified(Some(Category::Space)))
            .await
            .unwrap()
            .unwrap();
        assert!(verified.verified);
        assert!(store
            .sample_one(&FactFilter::verified(Some(Category::Food)))
            .await
            .unwrap()
            .is_none());

        let liked = store.record_like(generated.id).await.unwrap();
        assert_eq!(liked.likes, 1);
        let viewed = store.record_view(generated.id).await.unwrap();
        assert_eq!(viewed.views, 1);
        assert_eq!(viewed.likes, 1);

        let missing = store.record_view(factline_core::new_entity_id()).await;
        assert!(matches!(missing, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_identity_store_lookup_and_update() {
        let now = Utc::now();
        let store = InMemoryIdentityStore::new();
        let identity = Identity::new(PlanTier::Basic, now);
        let credential = Credential::new(&identity, CredentialKind::ApiKey, "fl_key", now);
        store.insert_identity(identity.clone()).unwrap();
        store.insert_credential(credential.clone()).unwrap();

        let (found_identity, found_credential) = store
            .find_by_credential(&factline_core::hash_secret("fl_key"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found_identity.id, identity.id);
        assert_eq!(found_credential.id, credential.id);

        let updated = store
            .update_credential(credential.id, &|c: &mut Credential| c.usage.error_count += 1)
            .await
            .unwrap();
        assert_eq!(updated.usage.error_count, 1);
        assert!(store.find_by_credential("nope").await.unwrap().is_none());
    }

    #[test]
    fn test_credential_requires_identity() {
        let store = InMemoryIdentityStore::new();
        let identity = Identity::new(PlanTier::Basic, Utc::now());
        let credential = Credential::new(&identity, CredentialKind::ApiKey, "orphan", Utc::now());
        assert!(matches!(
            store.insert_credential(credential),
            Err(StorageError::InsertFailed { .. })
        ));
    }
}
