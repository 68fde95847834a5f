//! Quota Tracker
//!
//! Each identity has two independent windows: a short request-rate window
//! and a calendar-month plan quota.
//!
//! The request-rate window is fixed-window counting over the KV backend's
//! atomic increment. A counter key names its bucket, so a new bucket always
//! starts from zero and old buckets simply expire. Check-and-increment is
//! one `incr_with_expiry` call: concurrent callers can each push the counter
//! past the limit, but only the ones whose post-increment count stays within
//! it are allowed.
//!
//! The monthly window is only read here, from the identity's own
//! `QuotaWindow`. It is charged by the usage recorder once a request has
//! succeeded, so failed requests never consume plan quota.

use crate::auth::{AuthenticatedCaller, RateLimitSource};
use crate::config::QuotaConfig;
use crate::error::QuotaError;
use chrono::{DateTime, Utc};
use factline_core::{Clock, EntityId, QuotaLimit, QuotaWindow, WindowGranularity, WindowKind};
use factline_storage::KvBackend;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

// ============================================================================
// DECISIONS
// ============================================================================

/// A reservation that went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaAllowance {
    pub window: WindowKind,
    pub limit: QuotaLimit,
    /// `None` when the limit is unlimited.
    pub remaining: Option<u64>,
    pub reset_at: DateTime<Utc>,
}

/// A reservation that was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDenial {
    pub window: WindowKind,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Duration,
}

impl QuotaDenial {
    /// Convert into the caller-facing error. Only an exhausted credential
    /// override on the request-rate window is reported as `RateLimited`.
    pub fn into_error(self, source: RateLimitSource) -> QuotaError {
        let retry_after_secs = self.retry_after.as_secs().max(1);
        match (self.window, source) {
            (WindowKind::RequestRate, RateLimitSource::CredentialOverride) => {
                QuotaError::RateLimited {
                    limit: self.limit,
                    reset_at: self.reset_at,
                    retry_after_secs,
                }
            }
            _ => QuotaError::QuotaExceeded {
                window: self.window,
                limit: self.limit,
                reset_at: self.reset_at,
                retry_after_secs,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Allowed(QuotaAllowance),
    Denied(QuotaDenial),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

// ============================================================================
// TRACKER
// ============================================================================

/// Counter-store backed quota checks.
#[derive(Clone)]
pub struct QuotaTracker {
    kv: Arc<dyn KvBackend>,
    clock: Arc<dyn Clock>,
    config: QuotaConfig,
}

impl QuotaTracker {
    pub fn new(kv: Arc<dyn KvBackend>, clock: Arc<dyn Clock>, config: QuotaConfig) -> Self {
        Self { kv, clock, config }
    }

    pub fn rate_granularity(&self) -> WindowGranularity {
        WindowGranularity::Fixed(self.config.rate_window)
    }

    /// Reserve `cost` in the request-rate window and check it against the
    /// monthly quota.
    ///
    /// The request-rate window is checked first; the monthly window only
    /// when the rate window allows. On success the request-rate allowance
    /// is returned, since that is what clients see in headers.
    pub async fn check_and_reserve(
        &self,
        caller: &AuthenticatedCaller,
        cost: u64,
    ) -> Result<QuotaAllowance, QuotaError> {
        let identity_id = caller.identity.id;

        if !self.config.enabled {
            let now = self.clock.now();
            let granularity = self.rate_granularity();
            return Ok(QuotaAllowance {
                window: WindowKind::RequestRate,
                limit: QuotaLimit::Unlimited,
                remaining: None,
                reset_at: granularity.bucket_end(granularity.bucket_start(now)),
            });
        }

        let rate = match self
            .reserve_window(
                identity_id,
                WindowKind::RequestRate,
                self.rate_granularity(),
                caller.effective_rate_limit,
                cost,
            )
            .await
        {
            QuotaDecision::Allowed(allowance) => allowance,
            QuotaDecision::Denied(denial) => {
                return Err(denial.into_error(caller.rate_limit_source));
            }
        };

        match self.check_monthly(&caller.identity.monthly, cost) {
            QuotaDecision::Allowed(_) => Ok(rate),
            QuotaDecision::Denied(denial) => {
                debug!(identity_id = %identity_id, limit = denial.limit, "monthly quota exhausted");
                Err(denial.into_error(RateLimitSource::Plan))
            }
        }
    }

    /// Check whether `cost` more requests fit in a monthly window, without
    /// charging it. A stale window counts as empty.
    pub fn check_monthly(&self, monthly: &QuotaWindow, cost: u64) -> QuotaDecision {
        let now = self.clock.now();
        let mut window = monthly.clone();
        window.rollover_if_stale(now);
        let reset_at = window.reset_at();
        let projected = window.count.saturating_add(cost);

        match window.limit {
            QuotaLimit::Limited(max) if !window.limit.allows(projected) => {
                QuotaDecision::Denied(QuotaDenial {
                    window: WindowKind::Monthly,
                    limit: max,
                    reset_at,
                    retry_after: until(now, reset_at),
                })
            }
            limit => QuotaDecision::Allowed(QuotaAllowance {
                window: WindowKind::Monthly,
                limit,
                remaining: limit.remaining(projected),
                reset_at,
            }),
        }
    }

    /// Reserve `cost` in one window.
    ///
    /// Unlimited windows never touch the counter store. A counter-store
    /// failure allows the request with the full limit remaining.
    pub async fn reserve_window(
        &self,
        identity_id: EntityId,
        window: WindowKind,
        granularity: WindowGranularity,
        limit: QuotaLimit,
        cost: u64,
    ) -> QuotaDecision {
        let now = self.clock.now();
        let bucket_start = granularity.bucket_start(now);
        let reset_at = granularity.bucket_end(bucket_start);

        let QuotaLimit::Limited(max) = limit else {
            return QuotaDecision::Allowed(QuotaAllowance {
                window,
                limit,
                remaining: None,
                reset_at,
            });
        };

        let key = counter_key(window, identity_id, bucket_start);
        let ttl = until(now, reset_at);

        let count = match self.kv.incr_with_expiry(&key, cost, ttl).await {
            Ok(count) => count,
            Err(error) => {
                warn!(
                    identity_id = %identity_id,
                    window = %window,
                    %error,
                    "quota counter unavailable, allowing request"
                );
                return QuotaDecision::Allowed(QuotaAllowance {
                    window,
                    limit,
                    remaining: Some(max),
                    reset_at,
                });
            }
        };

        if limit.allows(count) {
            debug!(identity_id = %identity_id, window = %window, count, limit = max, "quota reserved");
            QuotaDecision::Allowed(QuotaAllowance {
                window,
                limit,
                remaining: limit.remaining(count),
                reset_at,
            })
        } else {
            debug!(identity_id = %identity_id, window = %window, count, limit = max, "quota denied");
            QuotaDecision::Denied(QuotaDenial {
                window,
                limit: max,
                reset_at,
                retry_after: until(now, reset_at),
            })
        }
    }
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// `quota:{kind}:{identity_id}:{bucket_start_epoch_secs}`
pub fn counter_key(window: WindowKind, identity_id: EntityId, bucket_start: DateTime<Utc>) -> String {
    format!(
        "quota:{}:{}:{}",
        window.as_str(),
        identity_id,
        bucket_start.timestamp()
    )
}

/// Whole seconds from `now` until `until`, rounded up, at least one.
fn until(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    let millis = (until - now).num_milliseconds().max(0) as u64;
    Duration::from_secs(millis.div_ceil(1000).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use factline_core::{Credential, CredentialKind, Identity, ManualClock, PlanTier};
    use factline_storage::MemoryKvBackend;

    fn tracker(clock: Arc<ManualClock>) -> (QuotaTracker, Arc<MemoryKvBackend>) {
        let kv = Arc::new(MemoryKvBackend::new(clock.clone()));
        let tracker = QuotaTracker::new(kv.clone(), clock, QuotaConfig::default());
        (tracker, kv)
    }

    fn caller(plan: PlanTier, clock: &ManualClock, override_limit: Option<u64>) -> AuthenticatedCaller {
        let now = clock.now();
        let identity = Identity::new(plan, now);
        let mut credential = Credential::new(&identity, CredentialKind::ApiKey, "k", now);
        credential.rate_limit_override = override_limit.map(QuotaLimit::Limited);
        let (effective_rate_limit, rate_limit_source) = match credential.rate_limit_override {
            Some(limit) => (limit, RateLimitSource::CredentialOverride),
            None => (plan.request_rate_limit(), RateLimitSource::Plan),
        };
        AuthenticatedCaller {
            identity,
            credential,
            effective_rate_limit,
            rate_limit_source,
        }
    }

    #[tokio::test]
    async fn test_basic_plan_request_101_is_quota_exceeded() {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_100));
        let (tracker, _) = tracker(clock.clone());
        let caller = caller(PlanTier::Basic, &clock, None);

        for i in 0..100u64 {
            let allowance = tracker.check_and_reserve(&caller, 1).await.unwrap();
            assert_eq!(allowance.remaining, Some(99 - i));
        }

        let err = tracker.check_and_reserve(&caller, 1).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::QuotaExceeded {
                window: WindowKind::RequestRate,
                limit: 100,
                ..
            }
        ));
        assert_eq!(err.remaining(), 0);
        assert!(err.retry_after_secs() >= 1);
    }

    #[tokio::test]
    async fn test_override_denial_is_rate_limited() {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_100));
        let (tracker, _) = tracker(clock.clone());
        let caller = caller(PlanTier::Premium, &clock, Some(2));

        tracker.check_and_reserve(&caller, 1).await.unwrap();
        tracker.check_and_reserve(&caller, 1).await.unwrap();
        let err = tracker.check_and_reserve(&caller, 1).await.unwrap_err();
        assert!(matches!(err, QuotaError::RateLimited { limit: 2, .. }));
    }

    #[tokio::test]
    async fn test_unlimited_never_touches_store() {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_100));
        let (tracker, kv) = tracker(clock.clone());
        let caller = caller(PlanTier::Platinum, &clock, None);

        for _ in 0..500 {
            let allowance = tracker.check_and_reserve(&caller, 1).await.unwrap();
            assert_eq!(allowance.remaining, None);
        }
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn test_window_rollover_starts_fresh() {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_100));
        let (tracker, _) = tracker(clock.clone());
        let caller = caller(PlanTier::Premium, &clock, Some(1));

        let first = tracker.check_and_reserve(&caller, 1).await.unwrap();
        assert!(tracker.check_and_reserve(&caller, 1).await.is_err());

        clock.set(first.reset_at);
        let again = tracker.check_and_reserve(&caller, 1).await.unwrap();
        assert_eq!(again.remaining, Some(0));
        assert!(again.reset_at > first.reset_at);
    }

    #[tokio::test]
    async fn test_reset_at_is_bucket_end() {
        let clock = Arc::new(ManualClock::at_epoch_secs(900 * 10 + 17));
        let (tracker, _) = tracker(clock.clone());
        let caller = caller(PlanTier::Basic, &clock, None);

        let allowance = tracker.check_and_reserve(&caller, 1).await.unwrap();
        assert_eq!(allowance.reset_at.timestamp(), 900 * 11);
        assert_eq!(allowance.limit, QuotaLimit::Limited(100));
    }

    #[tokio::test]
    async fn test_monthly_quota_checked_after_rate() {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_100));
        let (tracker, _) = tracker(clock.clone());
        let mut caller = caller(PlanTier::Basic, &clock, Some(1_000));
        caller.identity.monthly.limit = QuotaLimit::Limited(1);

        tracker.check_and_reserve(&caller, 1).await.unwrap();
        caller.identity.monthly.increment(1, clock.now());
        let err = tracker.check_and_reserve(&caller, 1).await.unwrap_err();
        assert!(matches!(
            err,
            QuotaError::QuotaExceeded {
                window: WindowKind::Monthly,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_monthly_check_does_not_charge() {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_100));
        let (tracker, kv) = tracker(clock.clone());
        let mut caller = caller(PlanTier::Basic, &clock, None);
        caller.identity.monthly.limit = QuotaLimit::Limited(1);

        for _ in 0..3 {
            let decision = tracker.check_monthly(&caller.identity.monthly, 1);
            let QuotaDecision::Allowed(allowance) = decision else {
                panic!("monthly check denied an unused window");
            };
            assert_eq!(allowance.remaining, Some(0));
        }
        tracker.check_and_reserve(&caller, 1).await.unwrap();
        assert_eq!(kv.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_monthly_window_counts_as_empty() {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_100));
        let (tracker, _) = tracker(clock.clone());
        let mut monthly = QuotaWindow::monthly(QuotaLimit::Limited(1), clock.now());
        monthly.increment(1, clock.now());
        assert!(!tracker.check_monthly(&monthly, 1).is_allowed());

        clock.set(monthly.reset_at());
        assert!(tracker.check_monthly(&monthly, 1).is_allowed());
    }

    #[tokio::test]
    async fn test_disabled_always_allows() {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_100));
        let kv = Arc::new(MemoryKvBackend::new(clock.clone()));
        let config = QuotaConfig {
            enabled: false,
            ..Default::default()
        };
        let tracker = QuotaTracker::new(kv.clone(), clock.clone(), config);
        let caller = caller(PlanTier::Basic, &clock, Some(0));

        assert!(tracker.check_and_reserve(&caller, 1).await.is_ok());
        assert!(kv.is_empty());
    }

    #[test]
    fn test_until_rounds_up() {
        let now = DateTime::<Utc>::UNIX_EPOCH;
        assert_eq!(until(now, now), Duration::from_secs(1));
        assert_eq!(
            until(now, now + chrono::Duration::milliseconds(1500)),
            Duration::from_secs(2)
        );
    }
}
