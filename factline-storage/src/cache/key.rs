//! Namespaced cache keys.
//!
//! Keys render as `"{namespace}:{segment}:{segment}..."`. Segments may not be
//! empty or contain the `:` separator, so two different segment lists never
//! collide on the same key.

use factline_core::ValidationError;
use std::fmt;

const SEPARATOR: char = ':';

/// A validated, namespaced cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    rendered: String,
    namespace_len: usize,
}

impl CacheKey {
    /// Start building a key under `namespace`.
    pub fn builder(namespace: impl Into<String>) -> CacheKeyBuilder {
        CacheKeyBuilder {
            namespace: namespace.into(),
            segments: Vec::new(),
        }
    }

    /// Build a key from a namespace and a segment list.
    pub fn new(namespace: &str, segments: &[&str]) -> Result<Self, ValidationError> {
        segments
            .iter()
            .fold(Self::builder(namespace), |builder, segment| builder.segment(*segment))
            .build()
    }

    /// Tag key: `"{namespace}:tag:{segments...}"`.
    pub fn tag(namespace: &str, segments: &[&str]) -> Result<Self, ValidationError> {
        let mut all = Vec::with_capacity(segments.len() + 1);
        all.push("tag");
        all.extend_from_slice(segments);
        Self::new(namespace, &all)
    }

    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    pub fn namespace(&self) -> &str {
        &self.rendered[..self.namespace_len]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

/// Builder for [`CacheKey`]. Validation happens in [`CacheKeyBuilder::build`].
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    namespace: String,
    segments: Vec<String>,
}

impl CacheKeyBuilder {
    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    pub fn build(self) -> Result<CacheKey, ValidationError> {
        validate_part("namespace", &self.namespace)?;
        if self.segments.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "cache_key.segments".to_string(),
            });
        }
        for segment in &self.segments {
            validate_part("cache_key.segment", segment)?;
        }

        let mut rendered = self.namespace.clone();
        for segment in &self.segments {
            rendered.push(SEPARATOR);
            rendered.push_str(segment);
        }

        Ok(CacheKey {
            rendered,
            namespace_len: self.namespace.len(),
        })
    }
}

fn validate_part(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    if value.contains(SEPARATOR) {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            reason: format!("must not contain '{}'", SEPARATOR),
        });
    }
    Ok(())
}
