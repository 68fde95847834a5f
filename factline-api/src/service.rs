//! Fact Service
//!
//! The single call the HTTP layer makes: authenticate, validate the
//! category, reserve quota, resolve, then record usage exactly once.

use crate::auth::{AuthGate, AuthenticatedCaller, ClientContext, CredentialMaterial};
use crate::config::{GeneratorConfig, ServiceConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::quota::{QuotaAllowance, QuotaTracker};
use crate::resolver::{FactRequest, FactResolver, ResolvedFact};
use crate::usage::{UsageOutcome, UsageRecorder};
use axum::{
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use factline_core::{Category, Clock, ConfigError, EntityId, Fact, FactSource, StorageError};
use factline_llm::{FallbackGenerator, OpenAiCompletionClient, TextCompletion};
use factline_storage::{CacheLayer, FactStore, IdentityStore, KvBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

// ============================================================================
// RESPONSE TYPES
// ============================================================================

/// Client-visible state of the request-rate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitInfo {
    /// `None` for unlimited windows.
    pub fn from_allowance(allowance: &QuotaAllowance) -> Option<Self> {
        Some(Self {
            limit: allowance.limit.value()?,
            remaining: allowance.remaining?,
            reset_at: allowance.reset_at,
        })
    }

    /// `x-ratelimit-limit`, `x-ratelimit-remaining` and `x-ratelimit-reset`
    /// (epoch seconds).
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-ratelimit-limit"),
            HeaderValue::from(self.limit),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-remaining"),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            HeaderName::from_static("x-ratelimit-reset"),
            HeaderValue::from(self.reset_at.timestamp().max(0)),
        );
        headers
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactResponse {
    pub fact: Fact,
    pub source: FactSource,
    pub meta: ResponseMeta,
}

impl IntoResponse for FactResponse {
    fn into_response(self) -> Response {
        let headers = self
            .meta
            .rate_limit
            .map(|info| info.headers())
            .unwrap_or_default();
        (StatusCode::OK, headers, Json(self)).into_response()
    }
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// External collaborators the service is built from.
#[derive(Clone)]
pub struct ServiceDeps {
    pub kv: Arc<dyn KvBackend>,
    pub facts: Arc<dyn FactStore>,
    pub identities: Arc<dyn IdentityStore>,
    /// `None` leaves the generator tier unavailable.
    pub completion: Option<Arc<dyn TextCompletion>>,
    pub clock: Arc<dyn Clock>,
}

impl ServiceDeps {
    /// HTTP completion client built from config, when an API key is set.
    pub fn completion_from_config(config: &GeneratorConfig) -> Option<Arc<dyn TextCompletion>> {
        let api_key = config.api_key.clone()?;
        let client = OpenAiCompletionClient::new(api_key, config.model.clone())
            .with_base_url(config.base_url.clone());
        Some(Arc::new(client))
    }
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct FactService {
    auth: AuthGate,
    quota: QuotaTracker,
    resolver: FactResolver,
    usage: UsageRecorder,
    facts: Arc<dyn FactStore>,
    clock: Arc<dyn Clock>,
}

impl FactService {
    /// Wire the pipeline from its collaborators. Fails on invalid config.
    pub fn new(deps: ServiceDeps, config: ServiceConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let generator = deps.completion.map(|client| {
            FallbackGenerator::new(client)
                .with_timeout(config.generator.timeout)
                .with_options(config.generator.completion_options())
        });
        let cache = Arc::new(CacheLayer::new(deps.kv.clone()));

        Ok(Self {
            auth: AuthGate::new(deps.identities.clone(), deps.clock.clone()),
            quota: QuotaTracker::new(deps.kv, deps.clock.clone(), config.quota),
            resolver: FactResolver::new(
                cache,
                deps.facts.clone(),
                generator,
                deps.clock.clone(),
                config.resolver,
            ),
            usage: UsageRecorder::new(deps.identities, config.usage),
            facts: deps.facts,
            clock: deps.clock,
        })
    }

    pub fn resolver(&self) -> &FactResolver {
        &self.resolver
    }

    /// Resolve one fact for a caller.
    pub async fn resolve_fact(
        &self,
        request: FactRequest,
        material: Option<CredentialMaterial>,
        ctx: &ClientContext,
    ) -> ServiceResult<FactResponse> {
        let started = Instant::now();
        let caller = self.auth.resolve(material.as_ref(), ctx).await?;

        let result = self.resolve_for(&caller, &request).await;
        let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let status = match &result {
            Ok(_) => StatusCode::OK.as_u16(),
            Err(err) => err.status_code().as_u16(),
        };
        let outcome = UsageOutcome {
            status,
            endpoint: ctx.endpoint.clone(),
            latency_ms: response_time_ms,
            at: self.clock.now(),
        };
        if let Err(error) = self
            .usage
            .record(caller.identity.id, caller.credential.id, &outcome)
            .await
        {
            warn!(identity_id = %caller.identity.id, %error, "usage not recorded");
        }

        let (resolved, allowance) = result?;
        info!(
            identity_id = %caller.identity.id,
            category = %resolved.fact.category,
            source = resolved.source.as_str(),
            response_time_ms,
            "fact resolved"
        );

        Ok(FactResponse {
            fact: resolved.fact,
            source: resolved.source,
            meta: ResponseMeta {
                response_time_ms,
                rate_limit: RateLimitInfo::from_allowance(&allowance),
            },
        })
    }

    async fn resolve_for(
        &self,
        caller: &AuthenticatedCaller,
        request: &FactRequest,
    ) -> ServiceResult<(ResolvedFact, QuotaAllowance)> {
        let category: Option<Category> = request.parse_category()?;
        let allowance = self.quota.check_and_reserve(caller, 1).await?;
        let resolved = self.resolver.resolve(category, request).await?;
        Ok((resolved, allowance))
    }

    /// Count a view of a fact.
    pub async fn record_view(&self, fact_id: EntityId) -> ServiceResult<Fact> {
        self.facts
            .record_view(fact_id)
            .await
            .map_err(|e| fact_store_error(e, fact_id))
    }

    /// Count a like of a fact.
    pub async fn record_like(&self, fact_id: EntityId) -> ServiceResult<Fact> {
        self.facts
            .record_like(fact_id)
            .await
            .map_err(|e| fact_store_error(e, fact_id))
    }
}

impl std::fmt::Debug for FactService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactService")
            .field("quota", &self.quota)
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}

fn fact_store_error(error: StorageError, fact_id: EntityId) -> ServiceError {
    match error {
        StorageError::NotFound { .. } => ServiceError::NotFound {
            entity: "fact".to_string(),
            id: fact_id,
        },
        other => ServiceError::Unavailable {
            reason: format!("fact store: {}", other),
        },
    }
}
