//! Cache layer
//!
//! A namespaced, TTL-aware key/value cache with tag-based group invalidation
//! and a get-or-populate primitive, built on any [`KvBackend`].
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheLayer::new(backend);
//! let key = CacheKey::new("facts", &["random", "science"])?;
//! let tag = CacheKey::tag("facts", &["category", "science"])?;
//!
//! cache.set_with_tags(&key, &fact, &[tag.clone()], Duration::from_secs(300)).await;
//! let hit: Option<Fact> = cache.get(&key).await;
//!
//! // Moderation removed a fact: drop everything cached for the category.
//! cache.invalidate_by_tag(&tag).await;
//! ```
//!
//! [`KvBackend`]: crate::KvBackend

mod key;
mod layer;
mod stats;

pub use key::{CacheKey, CacheKeyBuilder};
pub use layer::CacheLayer;
pub use stats::CacheStats;
