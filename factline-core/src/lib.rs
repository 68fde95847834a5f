//! factline core - entity types
//!
//! Pure data structures shared by every other crate: identities and
//! credentials, facts and categories, quota windows, the clock abstraction,
//! and the error enums. No I/O lives here.

mod clock;
mod error;
mod fact;
mod identity;
mod quota;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{
    ConfigError, FactlineError, FactlineResult, LlmError, StorageError, StorageResult,
    ValidationError,
};
pub use fact::{Category, Fact, FactSource, NewFact};
pub use identity::{
    hash_secret, new_entity_id, Credential, CredentialKind, CredentialStatus, CredentialUsage,
    EndpointHit, EntityId, Identity, IdentityStatus, PlanTier, Timestamp,
};
pub use quota::{QuotaLimit, QuotaWindow, WindowGranularity, WindowKind};
