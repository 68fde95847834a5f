//! Authentication Module
//!
//! Resolves presented credential material into an [`AuthenticatedCaller`].
//! Two kinds of material are accepted:
//! 1. API keys (via the `X-API-Key` header)
//! 2. Session tokens (via `Authorization: Bearer`)
//!
//! The gate is read-only. Usage is charged later by the usage recorder so
//! rejected requests never consume quota.

use crate::error::{AuthError, ServiceError, ServiceResult};
use factline_core::{
    hash_secret, Clock, Credential, CredentialKind, Identity, QuotaLimit,
};
use factline_storage::IdentityStore;
use secrecy::{ExposeSecret, SecretString};
use std::net::IpAddr;
use std::sync::Arc;

// ============================================================================
// CREDENTIAL MATERIAL
// ============================================================================

/// A secret exactly as presented by the caller.
#[derive(Clone)]
pub enum CredentialMaterial {
    ApiKey(SecretString),
    SessionToken(SecretString),
}

impl CredentialMaterial {
    pub fn api_key(secret: impl Into<String>) -> Self {
        Self::ApiKey(SecretString::from(secret.into()))
    }

    pub fn session_token(secret: impl Into<String>) -> Self {
        Self::SessionToken(SecretString::from(secret.into()))
    }

    /// Extract material from request headers.
    ///
    /// The API key header wins when both are present. An `Authorization`
    /// header that is not a non-empty `Bearer` token counts as no material.
    pub fn from_headers(x_api_key: Option<&str>, authorization: Option<&str>) -> Option<Self> {
        if let Some(key) = x_api_key.map(str::trim).filter(|k| !k.is_empty()) {
            return Some(Self::api_key(key));
        }

        authorization
            .and_then(|value| value.trim().strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(Self::session_token)
    }

    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::ApiKey(_) => CredentialKind::ApiKey,
            Self::SessionToken(_) => CredentialKind::SessionToken,
        }
    }

    /// Digest used for store lookup.
    pub fn secret_hash(&self) -> String {
        match self {
            Self::ApiKey(secret) | Self::SessionToken(secret) => {
                hash_secret(secret.expose_secret())
            }
        }
    }
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CredentialMaterial")
            .field(&self.kind())
            .field(&"[REDACTED]")
            .finish()
    }
}

// ============================================================================
// CLIENT CONTEXT
// ============================================================================

/// Where a request came from and what it asked for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientContext {
    pub ip: Option<IpAddr>,
    /// Value of the `Origin` header, e.g. `https://app.example.com`.
    pub origin: Option<String>,
    /// Endpoint path, recorded by the usage recorder.
    pub endpoint: String,
}

impl ClientContext {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Identifier used in rejection errors and logs.
    fn caller_label(&self) -> Option<String> {
        self.origin
            .clone()
            .or_else(|| self.ip.map(|ip| ip.to_string()))
    }
}

/// Host part of an origin: scheme, path and port removed.
fn origin_host(origin: &str) -> &str {
    let rest = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin);
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.starts_with('[') {
        // Bracketed IPv6 literal
        return authority
            .split_once(']')
            .map(|(host, _)| host.trim_start_matches('['))
            .unwrap_or(authority);
    }
    authority
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
}

/// Check a caller against a credential's restriction list.
///
/// An empty list is unrestricted. Entries match an exact IP, an exact
/// origin, or `*.domain` against the origin host (subdomains only).
pub fn origin_allowed(allowed: &[String], ctx: &ClientContext) -> bool {
    if allowed.is_empty() {
        return true;
    }

    allowed.iter().any(|entry| {
        if let Ok(ip) = entry.parse::<IpAddr>() {
            return ctx.ip == Some(ip);
        }

        let Some(origin) = ctx.origin.as_deref() else {
            return false;
        };
        if entry == origin {
            return true;
        }
        if let Some(domain) = entry.strip_prefix("*.") {
            let host = origin_host(origin);
            return host
                .strip_suffix(domain)
                .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.'));
        }
        false
    })
}

// ============================================================================
// AUTHENTICATED CALLER
// ============================================================================

/// Where the effective request-rate limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitSource {
    CredentialOverride,
    Plan,
}

/// Result of a successful authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedCaller {
    pub identity: Identity,
    pub credential: Credential,
    pub effective_rate_limit: QuotaLimit,
    pub rate_limit_source: RateLimitSource,
}

impl AuthenticatedCaller {
    fn new(identity: Identity, credential: Credential) -> Self {
        let (effective_rate_limit, rate_limit_source) = match credential.rate_limit_override {
            Some(limit) => (limit, RateLimitSource::CredentialOverride),
            None => (identity.plan.request_rate_limit(), RateLimitSource::Plan),
        };
        Self {
            identity,
            credential,
            effective_rate_limit,
            rate_limit_source,
        }
    }
}

// ============================================================================
// AUTH GATE
// ============================================================================

/// Validates credential material against the identity store.
#[derive(Clone)]
pub struct AuthGate {
    store: Arc<dyn IdentityStore>,
    clock: Arc<dyn Clock>,
}

impl AuthGate {
    pub fn new(store: Arc<dyn IdentityStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Resolve `material` into an authenticated caller.
    ///
    /// Checks run in a fixed order: presence, lookup, credential status and
    /// expiry, origin restriction, identity status. A credential that is not
    /// active never authorizes, whatever the identity's status.
    pub async fn resolve(
        &self,
        material: Option<&CredentialMaterial>,
        ctx: &ClientContext,
    ) -> ServiceResult<AuthenticatedCaller> {
        let material = material.ok_or(AuthError::MissingCredential)?;

        let found = self
            .store
            .find_by_credential(&material.secret_hash())
            .await
            .map_err(|e| ServiceError::Unavailable {
                reason: format!("identity store: {}", e),
            })?;

        let (identity, credential) = match found {
            Some(pair) if pair.1.kind == material.kind() => pair,
            Some((_, credential)) => {
                tracing::debug!(
                    credential_id = %credential.id,
                    presented = %material.kind(),
                    stored = %credential.kind,
                    "credential kind mismatch"
                );
                return Err(AuthError::UnknownCredential.into());
            }
            None => return Err(AuthError::UnknownCredential.into()),
        };

        let now = self.clock.now();
        if !credential.status.is_active() {
            tracing::debug!(credential_id = %credential.id, status = %credential.status, "credential rejected");
            return Err(AuthError::CredentialInactive {
                reason: credential.status.to_string(),
            }
            .into());
        }
        if credential.is_expired(now) {
            tracing::debug!(credential_id = %credential.id, "credential expired");
            return Err(AuthError::CredentialInactive {
                reason: "expired".to_string(),
            }
            .into());
        }

        if !origin_allowed(&credential.allowed_origins, ctx) {
            tracing::warn!(
                credential_id = %credential.id,
                caller = ?ctx.caller_label(),
                "caller outside credential restriction list"
            );
            return Err(AuthError::OriginNotAllowed {
                caller: ctx.caller_label(),
            }
            .into());
        }

        if !identity.status.is_active() {
            tracing::debug!(identity_id = %identity.id, status = %identity.status, "identity rejected");
            return Err(AuthError::IdentityInactive {
                reason: identity.status.to_string(),
            }
            .into());
        }

        Ok(AuthenticatedCaller::new(identity, credential))
    }
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate").finish_non_exhaustive()
    }
}
