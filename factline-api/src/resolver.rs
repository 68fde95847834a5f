//! Fact Resolver
//!
//! Tiered resolution for one request:
//!
//! ```text
//! CACHE_LOOKUP -> STORE_LOOKUP -> GENERATE -> PERSIST -> RESPOND
//! ```
//!
//! Any tier that yields a fact exits straight to RESPOND. Whatever tier
//! produced the fact, it is written back under the same deterministic key
//! that CACHE_LOOKUP read, tagged for group invalidation.

use crate::config::ResolverConfig;
use crate::error::ResolutionError;
use factline_core::{Category, Clock, Fact, FactSource, NewFact};
use factline_llm::FallbackGenerator;
use factline_storage::{CacheKey, CacheLayer, FactFilter, FactStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cache key segment used when no category filter is given.
const ANY: &str = "any";

// ============================================================================
// REQUEST / RESULT
// ============================================================================

/// Shape of a fact request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactRequest {
    /// Raw category as supplied by the caller; validated before any lookup.
    pub category: Option<String>,
    /// Skip the cache read. The result is still written back.
    #[serde(default)]
    pub force_new: bool,
    /// Ignore generator-sourced records in the store.
    #[serde(default)]
    pub exclude_generated: bool,
    /// Persist a generated fact. The deployment switch can still veto it.
    #[serde(default = "default_true")]
    pub persist_generated: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FactRequest {
    fn default() -> Self {
        Self {
            category: None,
            force_new: false,
            exclude_generated: false,
            persist_generated: true,
        }
    }
}

impl FactRequest {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Self::default()
        }
    }

    pub fn force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    pub fn exclude_generated(mut self) -> Self {
        self.exclude_generated = true;
        self
    }

    pub fn without_persist(mut self) -> Self {
        self.persist_generated = false;
        self
    }

    /// Validate the category. A blank value means unfiltered.
    pub fn parse_category(&self) -> Result<Option<Category>, ResolutionError> {
        match self.category.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse::<Category>()
                .map(Some)
                .map_err(|_| ResolutionError::InvalidCategory {
                    value: raw.to_string(),
                }),
        }
    }
}

/// A fact plus the tier that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedFact {
    pub fact: Fact,
    pub source: FactSource,
}

// ============================================================================
// RESOLVER
// ============================================================================

pub struct FactResolver {
    cache: Arc<CacheLayer>,
    store: Arc<dyn FactStore>,
    generator: Option<FallbackGenerator>,
    clock: Arc<dyn Clock>,
    config: ResolverConfig,
}

impl FactResolver {
    pub fn new(
        cache: Arc<CacheLayer>,
        store: Arc<dyn FactStore>,
        generator: Option<FallbackGenerator>,
        clock: Arc<dyn Clock>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            cache,
            store,
            generator,
            clock,
            config,
        }
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    /// Whether the generator tier can run at all.
    pub fn fallback_available(&self) -> bool {
        self.config.fallback_enabled && self.generator.is_some()
    }

    /// `{ns}:random:{category|any}`, plus `:stored-only` when generated
    /// records are excluded.
    pub fn cache_key(&self, category: Option<Category>, exclude_generated: bool) -> Option<CacheKey> {
        let mut builder = CacheKey::builder(self.config.cache_namespace.as_str())
            .segment("random")
            .segment(category.map(|c| c.as_str()).unwrap_or(ANY));
        if exclude_generated {
            builder = builder.segment("stored-only");
        }
        match builder.build() {
            Ok(key) => Some(key),
            Err(error) => {
                warn!(%error, "cannot build cache key, caching skipped");
                None
            }
        }
    }

    /// `all`, the requested filter (`any` when unfiltered), and the fact's
    /// own category when it differs, so either handle invalidates it.
    fn tags(&self, category: Option<Category>, fact: &Fact) -> Vec<CacheKey> {
        let ns = self.config.cache_namespace.as_str();
        let requested = category.map(|c| c.as_str()).unwrap_or(ANY);
        let mut tags = vec![
            CacheKey::tag(ns, &["all"]),
            CacheKey::tag(ns, &["category", requested]),
        ];
        if fact.category.as_str() != requested {
            tags.push(CacheKey::tag(ns, &["category", fact.category.as_str()]));
        }
        tags.into_iter().filter_map(Result::ok).collect()
    }

    /// Resolve one fact for an already-validated category.
    pub async fn resolve(
        &self,
        category: Option<Category>,
        request: &FactRequest,
    ) -> Result<ResolvedFact, ResolutionError> {
        let label = category.map(|c| c.as_str()).unwrap_or(ANY);
        let key = self.cache_key(category, request.exclude_generated);

        // CACHE_LOOKUP
        if let Some(key) = key.as_ref().filter(|_| !request.force_new) {
            if let Some(fact) = self.cache.get::<Fact>(key).await {
                debug!(category = label, cache_key = %key, "served from cache");
                return Ok(ResolvedFact {
                    fact,
                    source: FactSource::Cache,
                });
            }
            debug!(category = label, cache_key = %key, "cache miss");
        }

        // STORE_LOOKUP
        if let Some(fact) = self.lookup_store(category, request.exclude_generated).await {
            debug!(category = label, fact_id = %fact.id, "served from store");
            self.write_back(key.as_ref(), category, &fact, self.config.store_cache_ttl)
                .await;
            return Ok(ResolvedFact {
                fact,
                source: FactSource::Store,
            });
        }

        // GENERATE
        let generator = match self.generator.as_ref() {
            Some(generator) if self.config.fallback_enabled => generator,
            _ => {
                debug!(category = label, "store empty and fallback disabled");
                return Err(ResolutionError::NoFactAvailable {
                    reason: format!("no stored fact for {}", label),
                });
            }
        };

        let generated = generator.generate(category).await.map_err(|error| {
            warn!(category = label, %error, "fallback generation failed");
            ResolutionError::NoFactAvailable {
                reason: format!("generation failed: {}", error),
            }
        })?;

        // PERSIST
        let new_fact = NewFact::generated(generated.text, generated.category);
        let fact = if request.persist_generated && self.config.persist_generated {
            match self.store.insert(new_fact.clone()).await {
                Ok(stored) => stored,
                Err(error) => {
                    warn!(category = label, %error, "generated fact not persisted");
                    new_fact.into_fact(self.clock.now())
                }
            }
        } else {
            new_fact.into_fact(self.clock.now())
        };

        debug!(category = label, fact_id = %fact.id, "served from generator");
        self.write_back(key.as_ref(), category, &fact, self.config.generated_cache_ttl)
            .await;
        Ok(ResolvedFact {
            fact,
            source: FactSource::Generated,
        })
    }

    /// A store failure counts as an empty result for this tier.
    async fn lookup_store(&self, category: Option<Category>, exclude_generated: bool) -> Option<Fact> {
        let filter = FactFilter::verified(category).excluding_generated(exclude_generated);
        let result = match category {
            Some(_) => self.store.find_one(&filter).await,
            None => self.store.sample_one(&filter).await,
        };
        result.unwrap_or_else(|error| {
            warn!(category = ?category, %error, "fact store lookup failed, treating as empty");
            None
        })
    }

    async fn write_back(
        &self,
        key: Option<&CacheKey>,
        category: Option<Category>,
        fact: &Fact,
        ttl: Duration,
    ) {
        let Some(key) = key else {
            return;
        };
        if !self
            .cache
            .set_with_tags(key, fact, &self.tags(category, fact), ttl)
            .await
        {
            debug!(cache_key = %key, "cache write-back incomplete");
        }
    }

    /// Drop cached facts for one category filter (`None` is the unfiltered
    /// key). Unfiltered entries are also dropped by their fact's category.
    /// Returns the number of keys removed.
    pub async fn invalidate_category(&self, category: Option<Category>) -> usize {
        let ns = self.config.cache_namespace.as_str();
        match CacheKey::tag(ns, &["category", category.map(|c| c.as_str()).unwrap_or(ANY)]) {
            Ok(tag) => self.cache.invalidate_by_tag(&tag).await,
            Err(_) => 0,
        }
    }

    /// Drop every cached fact in this namespace.
    pub async fn invalidate_all(&self) -> usize {
        match CacheKey::tag(self.config.cache_namespace.as_str(), &["all"]) {
            Ok(tag) => self.cache.invalidate_by_tag(&tag).await,
            Err(_) => 0,
        }
    }
}

impl std::fmt::Debug for FactResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactResolver")
            .field("config", &self.config)
            .field("fallback_available", &self.fallback_available())
            .finish_non_exhaustive()
    }
}
