//! Identity and credential types

use crate::quota::{QuotaLimit, QuotaWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Identifier for identities, credentials and facts (UUIDv7, time-sortable).
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 EntityId.
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// SHA-256 hex digest of a credential secret.
///
/// Stores only ever see this digest; presented material is hashed before
/// lookup.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// PLAN TIERS
// ============================================================================

/// Subscription plan. Ordered: basic < premium < platinum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Basic,
    Premium,
    Platinum,
}

impl PlanTier {
    /// Default request-rate limit per request window.
    pub fn request_rate_limit(&self) -> QuotaLimit {
        match self {
            Self::Basic => QuotaLimit::Limited(100),
            Self::Premium => QuotaLimit::Limited(1_000),
            Self::Platinum => QuotaLimit::Unlimited,
        }
    }

    /// Default monthly request quota.
    pub fn monthly_quota(&self) -> QuotaLimit {
        match self {
            Self::Basic => QuotaLimit::Limited(10_000),
            Self::Premium => QuotaLimit::Limited(250_000),
            Self::Platinum => QuotaLimit::Unlimited,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Premium => "premium",
            Self::Platinum => "platinum",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// STATUS ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Suspended,
    Locked,
}

impl IdentityStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Locked => "locked",
        }
    }
}

impl fmt::Display for IdentityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Suspended,
    Revoked,
}

impl CredentialStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Revoked => "revoked",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a credential is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    SessionToken,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey => f.write_str("api_key"),
            Self::SessionToken => f.write_str("session_token"),
        }
    }
}

// ============================================================================
// IDENTITY
// ============================================================================

/// The authenticated account behind a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: EntityId,
    pub plan: PlanTier,
    pub status: IdentityStatus,
    /// Calendar-month usage counter; limit is the plan quota unless overridden.
    pub monthly: QuotaWindow,
    /// Capability strings granted to this identity.
    pub features: Vec<String>,
    pub created_at: Timestamp,
}

impl Identity {
    /// New active identity on `plan` with the plan's monthly quota.
    pub fn new(plan: PlanTier, now: Timestamp) -> Self {
        Self {
            id: new_entity_id(),
            plan,
            status: IdentityStatus::Active,
            monthly: QuotaWindow::monthly(plan.monthly_quota(), now),
            features: Vec::new(),
            created_at: now,
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }
}

// ============================================================================
// CREDENTIAL
// ============================================================================

/// One entry in a credential's most-popular-endpoints list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointHit {
    pub endpoint: String,
    pub hits: u64,
}

/// Usage counters kept on each credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialUsage {
    pub total_requests: u64,
    pub monthly: QuotaWindow,
    pub error_count: u64,
    pub avg_response_ms: f64,
    pub last_used_at: Option<Timestamp>,
    /// Sorted by hits, descending; bounded by the recorder.
    pub popular_endpoints: Vec<EndpointHit>,
}

impl CredentialUsage {
    pub fn new(monthly_limit: QuotaLimit, now: Timestamp) -> Self {
        Self {
            total_requests: 0,
            monthly: QuotaWindow::monthly(monthly_limit, now),
            error_count: 0,
            avg_response_ms: 0.0,
            last_used_at: None,
            popular_endpoints: Vec::new(),
        }
    }

    /// Count one hit for `endpoint`, keeping at most `max_entries` entries.
    ///
    /// When the list is full and `endpoint` is new, the least-hit entry is
    /// evicted to make room.
    pub fn record_endpoint(&mut self, endpoint: &str, max_entries: usize) {
        if max_entries == 0 {
            return;
        }
        if let Some(hit) = self
            .popular_endpoints
            .iter_mut()
            .find(|hit| hit.endpoint == endpoint)
        {
            hit.hits += 1;
        } else {
            if self.popular_endpoints.len() >= max_entries {
                self.popular_endpoints
                    .sort_by(|a, b| b.hits.cmp(&a.hits));
                self.popular_endpoints.truncate(max_entries - 1);
            }
            self.popular_endpoints.push(EndpointHit {
                endpoint: endpoint.to_string(),
                hits: 1,
            });
        }
        self.popular_endpoints.sort_by(|a, b| b.hits.cmp(&a.hits));
    }
}

/// A bearer secret bound to exactly one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: EntityId,
    pub identity_id: EntityId,
    pub kind: CredentialKind,
    /// SHA-256 hex digest of the secret, see [`hash_secret`].
    pub secret_hash: String,
    pub status: CredentialStatus,
    pub expires_at: Option<Timestamp>,
    /// Allowed IPs or origins; empty means unrestricted.
    pub allowed_origins: Vec<String>,
    pub rate_limit_override: Option<QuotaLimit>,
    pub usage: CredentialUsage,
    pub created_at: Timestamp,
}

impl Credential {
    /// New active credential for `identity` whose secret is `secret`.
    pub fn new(identity: &Identity, kind: CredentialKind, secret: &str, now: Timestamp) -> Self {
        Self {
            id: new_entity_id(),
            identity_id: identity.id,
            kind,
            secret_hash: hash_secret(secret),
            status: CredentialStatus::Active,
            expires_at: None,
            allowed_origins: Vec::new(),
            rate_limit_override: None,
            usage: CredentialUsage::new(identity.monthly.limit, now),
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    /// Active and not expired.
    pub fn is_usable(&self, now: Timestamp) -> bool {
        self.status.is_active() && !self.is_expired(now)
    }

    pub fn is_restricted(&self) -> bool {
        !self.allowed_origins.is_empty()
    }
}
