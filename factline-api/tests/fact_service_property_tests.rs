//! Property-Based Tests for Fact Resolution
//!
//! **Property 1: Unknown categories are rejected before any lookup**
//!
//! For any string outside the fixed category set, `resolve_fact` fails with
//! `InvalidCategory`, never touches the cache or store, and consumes no
//! quota.
//!
//! **Property 2: A cached entry short-circuits the pipeline**
//!
//! For any category, once a fact has been resolved, repeated requests are
//! served from the cache without calling the store or the generator.
//!
//! **Property 3: Category spelling does not matter**
//!
//! For any category written in any case with surrounding whitespace,
//! resolution behaves as for the canonical name.

use factline_api::{
    AuthError, ClientContext, CredentialMaterial, FactRequest, FactService, ResolutionError,
    ServiceConfig, ServiceDeps, ServiceError,
};
use factline_core::{Category, Clock, FactSource, LlmError, PlanTier, QuotaLimit};
use factline_test_utils::{
    fixtures, generators, CountingFactStore, CredentialStatus, Fact, FactStore,
    FailingIdentityStore, FailingKvBackend, InMemoryFactStore, InMemoryIdentityStore, KvBackend,
    ManualClock, MemoryKvBackend, NewFact, ScriptedCompletion,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &str = "fl_live_5f0c2a9e1b7d";
const GENERATED: &str = "Fact: Octopuses have three hearts and blue blood.";

// ============================================================================
// HARNESS
// ============================================================================

struct Harness {
    service: FactService,
    clock: Arc<ManualClock>,
    facts: Arc<CountingFactStore>,
    identities: Arc<InMemoryIdentityStore>,
    completion: Arc<ScriptedCompletion>,
}

fn harness(facts: Vec<Fact>) -> Harness {
    let clock = fixtures::clock();
    let kv = Arc::new(MemoryKvBackend::new(clock.clone()));
    build(clock, kv, facts, ServiceConfig::default(), ScriptedCompletion::always(GENERATED))
}

fn build(
    clock: Arc<ManualClock>,
    kv: Arc<dyn KvBackend>,
    facts: Vec<Fact>,
    config: ServiceConfig,
    completion: ScriptedCompletion,
) -> Harness {
    let facts = Arc::new(CountingFactStore::new(InMemoryFactStore::with_facts(
        clock.clone(),
        facts,
    )));
    let identities = Arc::new(InMemoryIdentityStore::new());
    let completion = Arc::new(completion);
    let deps = ServiceDeps {
        kv,
        facts: facts.clone(),
        identities: identities.clone(),
        completion: Some(completion.clone()),
        clock: clock.clone(),
    };
    let service = FactService::new(deps, config).unwrap();
    Harness {
        service,
        clock,
        facts,
        identities,
        completion,
    }
}

fn ctx() -> ClientContext {
    ClientContext::new("/facts/random")
}

fn key() -> Option<CredentialMaterial> {
    Some(CredentialMaterial::api_key(SECRET))
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// **Property 1: Unknown categories are rejected before any lookup**
    #[test]
    fn prop_unknown_category_rejected_early(value in generators::arb_unknown_category()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = harness(vec![]);
            let now = h.clock.now();
            let (identity, credential) =
                fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, now).unwrap();

            let result = h
                .service
                .resolve_fact(FactRequest::for_category(value.clone()), key(), &ctx())
                .await;
            prop_assert_eq!(
                result.unwrap_err(),
                ServiceError::Resolution(ResolutionError::InvalidCategory { value })
            );
            prop_assert_eq!(h.facts.lookups(), 0);
            prop_assert_eq!(h.completion.calls(), 0);

            let stats = h.service.resolver().cache().stats();
            prop_assert_eq!(stats.hits + stats.misses, 0);

            let identity = h.identities.identity(identity.id).unwrap().unwrap();
            prop_assert_eq!(identity.monthly.count, 0);
            let credential = h.identities.credential(credential.id).unwrap().unwrap();
            prop_assert_eq!(credential.usage.error_count, 1);
            Ok(())
        })?;
    }

    /// **Property 2: A cached entry short-circuits the pipeline**
    #[test]
    fn prop_cache_hit_skips_store_and_generator(category in generators::arb_category(), repeats in 1usize..8) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let h = harness(vec![]);
            fixtures::seed_api_key(&h.identities, PlanTier::Premium, SECRET, h.clock.now()).unwrap();
            let request = FactRequest::for_category(category.as_str());

            let first = h.service.resolve_fact(request.clone(), key(), &ctx()).await.unwrap();
            prop_assert_eq!(first.source, FactSource::Generated);
            let lookups = h.facts.lookups();

            for _ in 0..repeats {
                let again = h.service.resolve_fact(request.clone(), key(), &ctx()).await.unwrap();
                prop_assert_eq!(again.source, FactSource::Cache);
                prop_assert_eq!(again.fact.id, first.fact.id);
            }
            prop_assert_eq!(h.facts.lookups(), lookups);
            prop_assert_eq!(h.completion.calls(), 1);
            Ok(())
        })?;
    }

    /// **Property 3: Category spelling does not matter**
    #[test]
    fn prop_category_spelling_normalized((category, spelled) in generators::arb_category_spelling()) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let now = fixtures::clock().now();
            let h = harness(vec![fixtures::verified_fact(category, now)]);
            fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, now).unwrap();

            let response = h
                .service
                .resolve_fact(FactRequest::for_category(spelled), key(), &ctx())
                .await
                .unwrap();
            prop_assert_eq!(response.source, FactSource::Store);
            prop_assert_eq!(response.fact.category, category);
            Ok(())
        })?;
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_store_miss_falls_back_to_generator_and_caches() {
    let h = harness(vec![]);
    fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, h.clock.now()).unwrap();

    let response = h
        .service
        .resolve_fact(FactRequest::for_category("science"), key(), &ctx())
        .await
        .unwrap();
    assert_eq!(response.source, FactSource::Generated);
    assert_eq!(response.fact.category, Category::Science);
    assert!(response.fact.generated);
    assert_eq!(h.facts.inserts(), 1);

    let cache_key = h
        .service
        .resolver()
        .cache_key(Some(Category::Science), false)
        .unwrap();
    let cached: Option<Fact> = h.service.resolver().cache().get(&cache_key).await;
    assert_eq!(cached.map(|f| f.id), Some(response.fact.id));
}

#[tokio::test]
async fn test_exclude_generated_skips_generated_records() {
    let now = fixtures::clock().now();
    let h = harness(vec![fixtures::generated_fact(Category::Food, now)]);
    fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, now).unwrap();

    let included = h
        .service
        .resolve_fact(FactRequest::for_category("food"), key(), &ctx())
        .await
        .unwrap();
    assert_eq!(included.source, FactSource::Store);

    let excluded = h
        .service
        .resolve_fact(FactRequest::for_category("food").exclude_generated(), key(), &ctx())
        .await
        .unwrap();
    assert_eq!(excluded.source, FactSource::Generated);
}

#[tokio::test]
async fn test_generator_failure_is_no_fact_available() {
    let clock = fixtures::clock();
    let kv = Arc::new(MemoryKvBackend::new(clock.clone()));
    let h = build(
        clock,
        kv,
        vec![],
        ServiceConfig::default(),
        ScriptedCompletion::always("I'm sorry, I cannot help with that request."),
    );
    fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, h.clock.now()).unwrap();

    let err = h
        .service
        .resolve_fact(FactRequest::any(), key(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Resolution(ResolutionError::NoFactAvailable { .. })
    ));
    assert_eq!(h.facts.inserts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_generator_timeout_is_no_fact_available() {
    let clock = fixtures::clock();
    let kv = Arc::new(MemoryKvBackend::new(clock.clone()));
    let h = build(
        clock,
        kv,
        vec![],
        ServiceConfig::default(),
        ScriptedCompletion::always(GENERATED).with_delay(Duration::from_secs(60)),
    );
    fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, h.clock.now()).unwrap();

    let err = h
        .service
        .resolve_fact(FactRequest::for_category("space"), key(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Resolution(ResolutionError::NoFactAvailable { .. })
    ));
}

#[tokio::test]
async fn test_persistence_failure_still_returns_generated_fact() {
    let h = harness(vec![]);
    fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, h.clock.now()).unwrap();
    h.facts.set_fail_inserts(true);

    let response = h
        .service
        .resolve_fact(FactRequest::for_category("nature"), key(), &ctx())
        .await
        .unwrap();
    assert_eq!(response.source, FactSource::Generated);
    assert!(h.facts.inner().is_empty().unwrap());
}

#[tokio::test]
async fn test_store_failure_falls_through_to_generator() {
    let h = harness(vec![]);
    fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, h.clock.now()).unwrap();
    h.facts.set_fail_lookups(true);

    let response = h
        .service
        .resolve_fact(FactRequest::any(), key(), &ctx())
        .await
        .unwrap();
    assert_eq!(response.source, FactSource::Generated);
    assert_eq!(response.fact.category, Category::General);
}

#[tokio::test]
async fn test_kv_outage_fails_open() {
    let clock = fixtures::clock();
    let now = clock.now();
    let kv = Arc::new(FailingKvBackend::new());
    let h = build(
        clock,
        kv.clone(),
        vec![fixtures::verified_fact(Category::History, now)],
        ServiceConfig::default(),
        ScriptedCompletion::failing(LlmError::ProviderNotConfigured),
    );
    fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, now).unwrap();

    // Well past the basic plan's 100-per-window limit.
    for _ in 0..150 {
        let response = h
            .service
            .resolve_fact(FactRequest::for_category("history"), key(), &ctx())
            .await
            .unwrap();
        assert_eq!(response.source, FactSource::Store);
    }
    assert_eq!(h.facts.lookups(), 150);
    assert!(kv.calls() > 0);
    assert_eq!(h.completion.calls(), 0);
}

#[tokio::test]
async fn test_basic_plan_request_101_is_quota_exceeded() {
    let now = fixtures::clock().now();
    let h = harness(vec![fixtures::verified_fact(Category::Space, now)]);
    fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, now).unwrap();

    for _ in 0..100 {
        h.service
            .resolve_fact(FactRequest::for_category("space"), key(), &ctx())
            .await
            .unwrap();
    }
    let err = h
        .service
        .resolve_fact(FactRequest::for_category("space"), key(), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err_code(&err), "QUOTA_EXCEEDED");
    match err {
        ServiceError::Quota(quota) => {
            assert_eq!(quota.remaining(), 0);
            assert_eq!(quota.limit(), 100);
        }
        other => panic!("expected quota error, got {:?}", other),
    }
}

fn err_code(err: &ServiceError) -> String {
    serde_json::to_value(err.code())
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[tokio::test]
async fn test_window_rollover_after_reset() {
    let now = fixtures::clock().now();
    let h = harness(vec![fixtures::verified_fact(Category::Animals, now)]);
    fixtures::seed_with(&h.identities, PlanTier::Premium, SECRET, now, |_, credential| {
        credential.rate_limit_override = Some(QuotaLimit::Limited(1));
    })
    .unwrap();

    let first = h
        .service
        .resolve_fact(FactRequest::for_category("animals"), key(), &ctx())
        .await
        .unwrap();
    let rate = first.meta.rate_limit.expect("rate limit info");
    assert_eq!(rate.remaining, 0);

    let denied = h
        .service
        .resolve_fact(FactRequest::for_category("animals"), key(), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err_code(&denied), "RATE_LIMITED");

    h.clock.set(rate.reset_at);
    let again = h
        .service
        .resolve_fact(FactRequest::for_category("animals"), key(), &ctx())
        .await
        .unwrap();
    assert_eq!(again.meta.rate_limit.map(|r| r.remaining), Some(0));
}

#[tokio::test]
async fn test_failed_request_does_not_consume_monthly_quota() {
    let clock = fixtures::clock();
    let now = clock.now();
    let kv = Arc::new(MemoryKvBackend::new(clock.clone()));
    let mut config = ServiceConfig::default();
    config.resolver.fallback_enabled = false;
    let h = build(clock, kv, vec![], config, ScriptedCompletion::always(GENERATED));
    let (identity, credential) =
        fixtures::seed_with(&h.identities, PlanTier::Basic, SECRET, now, |identity, _| {
            identity.monthly.limit = QuotaLimit::Limited(1);
        })
        .unwrap();

    for _ in 0..2 {
        let err = h
            .service
            .resolve_fact(FactRequest::any(), key(), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Resolution(ResolutionError::NoFactAvailable { .. })
        ));
    }

    h.facts
        .inner()
        .insert(NewFact::verified(
            "Honey found in ancient tombs can still be edible.",
            Category::Food,
        ))
        .await
        .unwrap();
    let served = h
        .service
        .resolve_fact(FactRequest::any(), key(), &ctx())
        .await
        .unwrap();
    assert_eq!(served.source, FactSource::Store);

    let denied = h
        .service
        .resolve_fact(FactRequest::for_category("food"), key(), &ctx())
        .await
        .unwrap_err();
    assert_eq!(err_code(&denied), "QUOTA_EXCEEDED");

    let identity = h.identities.identity(identity.id).unwrap().unwrap();
    assert_eq!(identity.monthly.count, 1);
    let credential = h.identities.credential(credential.id).unwrap().unwrap();
    assert_eq!(credential.usage.error_count, 3);
}

#[tokio::test]
async fn test_revoked_credential_rejected_and_not_charged() {
    let now = fixtures::clock().now();
    let h = harness(vec![fixtures::verified_fact(Category::Space, now)]);
    let (identity, credential) =
        fixtures::seed_with(&h.identities, PlanTier::Platinum, SECRET, now, |_, credential| {
            credential.status = CredentialStatus::Revoked;
        })
        .unwrap();

    let err = h
        .service
        .resolve_fact(FactRequest::any(), key(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Auth(AuthError::CredentialInactive { .. })
    ));
    assert_eq!(h.facts.lookups(), 0);

    let identity = h.identities.identity(identity.id).unwrap().unwrap();
    assert_eq!(identity.monthly.count, 0);
    let credential = h.identities.credential(credential.id).unwrap().unwrap();
    assert_eq!(credential.usage.error_count, 0);
}

#[tokio::test]
async fn test_missing_credential() {
    let h = harness(vec![]);
    let err = h
        .service
        .resolve_fact(FactRequest::any(), None, &ctx())
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::Auth(AuthError::MissingCredential));
}

#[tokio::test]
async fn test_identity_store_outage_is_unavailable() {
    let clock = fixtures::clock();
    let deps = ServiceDeps {
        kv: Arc::new(MemoryKvBackend::new(clock.clone())),
        facts: Arc::new(InMemoryFactStore::new(clock.clone())),
        identities: Arc::new(FailingIdentityStore),
        completion: None,
        clock,
    };
    let service = FactService::new(deps, ServiceConfig::default()).unwrap();
    let err = service
        .resolve_fact(FactRequest::any(), key(), &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unavailable { .. }));
}

#[tokio::test]
async fn test_usage_recorded_on_success() {
    let now = fixtures::clock().now();
    let h = harness(vec![fixtures::verified_fact(Category::Geography, now)]);
    let (identity, credential) =
        fixtures::seed_api_key(&h.identities, PlanTier::Basic, SECRET, now).unwrap();

    h.service
        .resolve_fact(FactRequest::for_category("geography"), key(), &ctx())
        .await
        .unwrap();

    let identity = h.identities.identity(identity.id).unwrap().unwrap();
    assert_eq!(identity.monthly.count, 1);
    let credential = h.identities.credential(credential.id).unwrap().unwrap();
    assert_eq!(credential.usage.total_requests, 1);
    assert_eq!(credential.usage.monthly.count, 1);
    assert_eq!(credential.usage.error_count, 0);
    assert_eq!(credential.usage.last_used_at, Some(now));
    assert_eq!(credential.usage.popular_endpoints[0].endpoint, "/facts/random");
}

#[tokio::test]
async fn test_record_view_and_like() {
    let now = fixtures::clock().now();
    let fact = fixtures::verified_fact(Category::Sports, now);
    let h = harness(vec![fact.clone()]);

    let viewed = h.service.record_view(fact.id).await.unwrap();
    assert_eq!(viewed.views, 1);
    let liked = h.service.record_like(fact.id).await.unwrap();
    assert_eq!(liked.likes, 1);

    let missing = h.service.record_view(factline_core::new_entity_id()).await;
    assert!(matches!(missing, Err(ServiceError::NotFound { .. })));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let clock = fixtures::clock();
    let mut config = ServiceConfig::default();
    config.generator.timeout = Duration::from_secs(45);
    let deps = ServiceDeps {
        kv: Arc::new(MemoryKvBackend::new(clock.clone())),
        facts: Arc::new(InMemoryFactStore::new(clock.clone())),
        identities: Arc::new(InMemoryIdentityStore::new()),
        completion: None,
        clock,
    };
    assert!(FactService::new(deps, config).is_err());
    assert!(ServiceDeps::completion_from_config(&ServiceConfig::default().generator).is_none());
}
