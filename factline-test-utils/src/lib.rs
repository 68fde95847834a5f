//! factline Test Utilities
//!
//! Shared test infrastructure for the factline workspace:
//! - Fakes for the external collaborators (KV backend, stores, completion)
//! - Proptest generators for the core types
//! - Fixtures for common scenarios
//! - Assertions for factline error shapes

pub use factline_core::{
    hash_secret, Category, Clock, Credential, CredentialKind, CredentialStatus, EntityId, Fact,
    Identity, IdentityStatus, LlmError, ManualClock, NewFact, PlanTier, QuotaLimit,
    StorageError, StorageResult, Timestamp,
};
pub use factline_storage::{
    FactFilter, FactStore, IdentityStore, InMemoryFactStore, InMemoryIdentityStore, KvBackend,
    MemoryKvBackend,
};

use async_trait::async_trait;
use factline_llm::{CompletionOptions, TextCompletion};
use factline_storage::{CredentialUpdate, IdentityUpdate};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn offline(what: &str) -> StorageError {
    StorageError::Unavailable {
        reason: format!("{} offline", what),
    }
}

// ============================================================================
// FAKE COLLABORATORS
// ============================================================================

/// KV backend whose every call fails.
#[derive(Debug, Default)]
pub struct FailingKvBackend {
    calls: AtomicUsize,
}

impl FailingKvBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls attempted so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> StorageResult<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(offline("kv"))
    }
}

#[async_trait]
impl KvBackend for FailingKvBackend {
    async fn get(&self, _key: &str) -> StorageResult<Option<String>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> StorageResult<()> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> StorageResult<bool> {
        self.fail()
    }

    async fn incr_with_expiry(&self, _key: &str, _by: u64, _ttl: Duration) -> StorageResult<u64> {
        self.fail()
    }

    async fn set_add(&self, _key: &str, _member: &str, _ttl: Duration) -> StorageResult<()> {
        self.fail()
    }

    async fn set_members(&self, _key: &str) -> StorageResult<Vec<String>> {
        self.fail()
    }
}

/// Completion fake that replays scripted replies, then repeats a default.
#[derive(Debug)]
pub struct ScriptedCompletion {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    default_reply: Result<String, LlmError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedCompletion {
    /// Always reply with `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_reply: Ok(text.into()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always fail with `error`.
    pub fn failing(error: LlmError) -> Self {
        Self {
            default_reply: Err(error),
            ..Self::always("")
        }
    }

    /// Reply with `replies` in order, then fall back to the default.
    pub fn then(self, replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            ..self
        }
    }

    /// Sleep before answering; use with a paused tokio clock.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextCompletion for ScriptedCompletion {
    async fn complete(&self, _prompt: &str, _options: &CompletionOptions) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        scripted.unwrap_or_else(|| self.default_reply.clone())
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}

/// Fact store wrapper that counts calls and can be switched to fail.
#[derive(Debug)]
pub struct CountingFactStore {
    inner: InMemoryFactStore,
    lookups: AtomicUsize,
    inserts: AtomicUsize,
    fail_lookups: AtomicBool,
    fail_inserts: AtomicBool,
}

impl CountingFactStore {
    pub fn new(inner: InMemoryFactStore) -> Self {
        Self {
            inner,
            lookups: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
            fail_lookups: AtomicBool::new(false),
            fail_inserts: AtomicBool::new(false),
        }
    }

    pub fn inner(&self) -> &InMemoryFactStore {
        &self.inner
    }

    /// `find_one` plus `sample_one` calls.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    fn lookup_guard(&self) -> StorageResult<()> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(offline("fact store"));
        }
        Ok(())
    }
}

#[async_trait]
impl FactStore for CountingFactStore {
    async fn find_one(&self, filter: &FactFilter) -> StorageResult<Option<Fact>> {
        self.lookup_guard()?;
        self.inner.find_one(filter).await
    }

    async fn sample_one(&self, filter: &FactFilter) -> StorageResult<Option<Fact>> {
        self.lookup_guard()?;
        self.inner.sample_one(filter).await
    }

    async fn insert(&self, fact: NewFact) -> StorageResult<Fact> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StorageError::InsertFailed {
                entity: "fact".to_string(),
                reason: "fact store offline".to_string(),
            });
        }
        self.inner.insert(fact).await
    }

    async fn get(&self, id: EntityId) -> StorageResult<Option<Fact>> {
        self.inner.get(id).await
    }

    async fn record_view(&self, id: EntityId) -> StorageResult<Fact> {
        self.inner.record_view(id).await
    }

    async fn record_like(&self, id: EntityId) -> StorageResult<Fact> {
        self.inner.record_like(id).await
    }
}

/// Identity store whose every call fails.
#[derive(Debug, Default)]
pub struct FailingIdentityStore;

#[async_trait]
impl IdentityStore for FailingIdentityStore {
    async fn find_by_credential(
        &self,
        _secret_hash: &str,
    ) -> StorageResult<Option<(Identity, Credential)>> {
        Err(offline("identity store"))
    }

    async fn update_identity(
        &self,
        _id: EntityId,
        _update: IdentityUpdate<'_>,
    ) -> StorageResult<Identity> {
        Err(offline("identity store"))
    }

    async fn update_credential(
        &self,
        _id: EntityId,
        _update: CredentialUpdate<'_>,
    ) -> StorageResult<Credential> {
        Err(offline("identity store"))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for factline types.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    /// Any of the fixed categories.
    pub fn arb_category() -> impl Strategy<Value = Category> {
        proptest::sample::select(Category::ALL.to_vec())
    }

    /// A category spelled the way a caller might: any case, padded.
    pub fn arb_category_spelling() -> impl Strategy<Value = (Category, String)> {
        (arb_category(), any::<bool>(), "[ ]{0,2}").prop_map(|(category, upper, pad)| {
            let name = if upper {
                category.as_str().to_uppercase()
            } else {
                category.as_str().to_string()
            };
            (category, format!("{}{}{}", pad, name, pad))
        })
    }

    /// Strings that are never a valid category.
    pub fn arb_unknown_category() -> impl Strategy<Value = String> {
        "[a-z]{3,12}".prop_filter("must not be a known category", |s| {
            s.parse::<Category>().is_err()
        })
    }

    pub fn arb_plan_tier() -> impl Strategy<Value = PlanTier> {
        prop_oneof![
            Just(PlanTier::Basic),
            Just(PlanTier::Premium),
            Just(PlanTier::Platinum),
        ]
    }

    /// Small limits, so tests can exhaust them.
    pub fn arb_small_limit() -> impl Strategy<Value = QuotaLimit> {
        prop_oneof![
            4 => (0u64..40).prop_map(QuotaLimit::Limited),
            1 => Just(QuotaLimit::Unlimited),
        ]
    }

    pub fn arb_credential_status() -> impl Strategy<Value = CredentialStatus> {
        prop_oneof![
            Just(CredentialStatus::Active),
            Just(CredentialStatus::Suspended),
            Just(CredentialStatus::Revoked),
        ]
    }

    pub fn arb_identity_status() -> impl Strategy<Value = IdentityStatus> {
        prop_oneof![
            Just(IdentityStatus::Active),
            Just(IdentityStatus::Suspended),
            Just(IdentityStatus::Locked),
        ]
    }

    /// Credential secrets.
    pub fn arb_secret() -> impl Strategy<Value = String> {
        "fl_[a-zA-Z0-9]{16,40}"
    }

    /// Timestamps between 2020 and 2030, whole seconds.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800i64..1_893_456_000i64)
            .prop_map(|secs| Utc.timestamp_opt(secs, 0).single().unwrap_or_default())
    }

    /// Fact text of an acceptable length.
    pub fn arb_fact_text() -> impl Strategy<Value = String> {
        "[A-Z][a-z]{3,10}( [a-z]{2,10}){4,12}\\."
    }

    pub fn arb_new_fact() -> impl Strategy<Value = NewFact> {
        (arb_fact_text(), arb_category(), any::<bool>(), any::<bool>()).prop_map(
            |(text, category, verified, generated)| NewFact {
                text,
                category,
                verified,
                generated,
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    /// 2024-05-10T13:22:41Z, mid-window and mid-month.
    pub const EPOCH_SECS: i64 = 1_715_347_361;

    /// Manual clock pinned at [`EPOCH_SECS`].
    pub fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at_epoch_secs(EPOCH_SECS))
    }

    /// A verified, stored fact.
    pub fn verified_fact(category: Category, now: Timestamp) -> Fact {
        NewFact::verified(
            format!("A verified {} fact that is long enough to serve.", category),
            category,
        )
        .into_fact(now)
    }

    /// A generator-sourced fact that has since been verified, so only an
    /// `exclude_generated` filter keeps it out of lookups.
    pub fn generated_fact(category: Category, now: Timestamp) -> Fact {
        let mut fact = NewFact::generated(
            format!("A generated {} fact that is long enough to serve.", category),
            category,
        )
        .into_fact(now);
        fact.verified = true;
        fact
    }

    /// An identity plus one credential, not yet stored.
    pub fn identity_with_credential(
        plan: PlanTier,
        kind: CredentialKind,
        secret: &str,
        now: Timestamp,
    ) -> (Identity, Credential) {
        let identity = Identity::new(plan, now);
        let credential = Credential::new(&identity, kind, secret, now);
        (identity, credential)
    }

    /// Insert an identity with an API key and return both records.
    pub fn seed_api_key(
        store: &InMemoryIdentityStore,
        plan: PlanTier,
        secret: &str,
        now: Timestamp,
    ) -> StorageResult<(Identity, Credential)> {
        seed_with(store, plan, secret, now, |_, _| {})
    }

    /// Insert an identity with an API key after `configure` adjusts them.
    pub fn seed_with(
        store: &InMemoryIdentityStore,
        plan: PlanTier,
        secret: &str,
        now: Timestamp,
        configure: impl FnOnce(&mut Identity, &mut Credential),
    ) -> StorageResult<(Identity, Credential)> {
        let (mut identity, mut credential) =
            identity_with_credential(plan, CredentialKind::ApiKey, secret, now);
        configure(&mut identity, &mut credential);
        store.insert_identity(identity.clone())?;
        store.insert_credential(credential.clone())?;
        Ok((identity, credential))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for factline error shapes.

    use super::*;

    /// Assert that a storage result is an `Unavailable` error.
    #[track_caller]
    pub fn assert_unavailable<T: std::fmt::Debug>(result: &StorageResult<T>) {
        match result {
            Err(StorageError::Unavailable { .. }) => {}
            other => panic!("Expected Unavailable, got: {:?}", other),
        }
    }

    /// Assert that a generation result was rejected as invalid output.
    #[track_caller]
    pub fn assert_invalid_response<T: std::fmt::Debug>(result: &Result<T, LlmError>) {
        match result {
            Err(LlmError::InvalidResponse { .. }) => {}
            other => panic!("Expected InvalidResponse, got: {:?}", other),
        }
    }

    /// Assert that a fact carries the expected provenance flags.
    #[track_caller]
    pub fn assert_provenance(fact: &Fact, generated: bool, verified: bool) {
        assert_eq!(fact.generated, generated, "generated flag of {}", fact.id);
        assert_eq!(fact.verified, verified, "verified flag of {}", fact.id);
    }
}

// ============================================================================
// TESTS
// ============================================================================
