//! Usage Recorder
//!
//! Post-response bookkeeping, applied once per authenticated request.
//! Updates are closures handed to the identity store, which applies them to
//! the current record. Nothing here trusts the copy carried through the
//! pipeline, so a concurrent plan change is never overwritten.

use crate::config::UsageConfig;
use chrono::{DateTime, Utc};
use factline_core::{Credential, EntityId, Identity, StorageResult};
use factline_storage::IdentityStore;
use std::sync::Arc;

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageOutcome {
    /// HTTP-equivalent status code.
    pub status: u16,
    pub endpoint: String,
    pub latency_ms: u64,
    pub at: DateTime<Utc>,
}

impl UsageOutcome {
    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

/// Applies usage counters through the identity store.
#[derive(Clone)]
pub struct UsageRecorder {
    store: Arc<dyn IdentityStore>,
    config: UsageConfig,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn IdentityStore>, config: UsageConfig) -> Self {
        Self { store, config }
    }

    /// Record one finished request.
    ///
    /// Success charges the identity's monthly counter (the one the quota
    /// tracker checks plan quota against) and the credential's
    /// total and monthly counters, folds the latency into the moving
    /// average and counts the endpoint. Failure only bumps the credential's
    /// error counter.
    pub async fn record(
        &self,
        identity_id: EntityId,
        credential_id: EntityId,
        outcome: &UsageOutcome,
    ) -> StorageResult<()> {
        if !outcome.is_success() {
            self.store
                .update_credential(credential_id, &|credential: &mut Credential| {
                    credential.usage.error_count = credential.usage.error_count.saturating_add(1);
                })
                .await?;
            return Ok(());
        }

        let at = outcome.at;
        self.store
            .update_identity(identity_id, &|identity: &mut Identity| {
                identity.monthly.increment(1, at);
            })
            .await?;

        let max_endpoints = self.config.max_popular_endpoints;
        self.store
            .update_credential(credential_id, &|credential: &mut Credential| {
                let usage = &mut credential.usage;
                usage.total_requests = usage.total_requests.saturating_add(1);
                usage.avg_response_ms =
                    moving_average(usage.avg_response_ms, usage.total_requests, outcome.latency_ms);
                usage.monthly.increment(1, at);
                usage.last_used_at = Some(at);
                usage.record_endpoint(&outcome.endpoint, max_endpoints);
            })
            .await?;

        Ok(())
    }
}

impl std::fmt::Debug for UsageRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageRecorder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// `(old * (n - 1) + latest) / n`, where `n` counts the latest sample.
pub fn moving_average(old: f64, n: u64, latest_ms: u64) -> f64 {
    if n == 0 {
        return old;
    }
    let n = n as f64;
    (old * (n - 1.0) + latest_ms as f64) / n
}
