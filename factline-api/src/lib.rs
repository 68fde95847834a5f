//! factline API - the quota-aware fact resolution pipeline
//!
//! [`FactService::resolve_fact`] is the entry point an HTTP layer calls:
//!
//! 1. [`AuthGate`] turns credential material into an authenticated caller
//! 2. the requested category is validated
//! 3. [`QuotaTracker`] reserves the request-rate window and checks the monthly one
//! 4. [`FactResolver`] tries cache, store, then the fallback generator
//! 5. [`UsageRecorder`] charges usage, monthly quota included, once the outcome is known
//!
//! Cache and counter-store failures are absorbed along the way; only
//! identity- and fact-store outages surface as [`ServiceError::Unavailable`].

pub mod auth;
pub mod config;
pub mod error;
pub mod quota;
pub mod resolver;
pub mod service;
pub mod telemetry;
pub mod usage;

pub use auth::{
    origin_allowed, AuthGate, AuthenticatedCaller, ClientContext, CredentialMaterial,
    RateLimitSource,
};
pub use config::{GeneratorConfig, QuotaConfig, ResolverConfig, ServiceConfig, UsageConfig};
pub use error::{
    ApiError, ApiResult, AuthError, ErrorCode, QuotaError, ResolutionError, ServiceError,
    ServiceResult,
};
pub use quota::{QuotaAllowance, QuotaDecision, QuotaDenial, QuotaTracker};
pub use resolver::{FactRequest, FactResolver, ResolvedFact};
pub use service::{FactResponse, FactService, RateLimitInfo, ResponseMeta, ServiceDeps};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
pub use usage::{UsageOutcome, UsageRecorder};
