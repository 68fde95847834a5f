//! Fact types

use crate::error::ValidationError;
use crate::identity::{new_entity_id, EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of fact categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    General,
    Science,
    History,
    Technology,
    Nature,
    Space,
    Animals,
    Geography,
    Food,
    Sports,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::General,
        Category::Science,
        Category::History,
        Category::Technology,
        Category::Nature,
        Category::Space,
        Category::Animals,
        Category::Geography,
        Category::Food,
        Category::Sports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Science => "science",
            Self::History => "history",
            Self::Technology => "technology",
            Self::Nature => "nature",
            Self::Space => "space",
            Self::Animals => "animals",
            Self::Geography => "geography",
            Self::Food => "food",
            Self::Sports => "sports",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownCategory {
                value: s.to_string(),
            })
    }
}

/// Which tier answered a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactSource {
    Cache,
    Store,
    Generated,
}

impl FactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Store => "store",
            Self::Generated => "generated",
        }
    }
}

impl fmt::Display for FactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A retrievable unit of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub id: EntityId,
    pub text: String,
    pub category: Category,
    pub verified: bool,
    /// True when produced by the fallback generator.
    pub generated: bool,
    pub views: u64,
    pub likes: u64,
    pub created_at: Timestamp,
}

/// Insert payload for a fact store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewFact {
    pub text: String,
    pub category: Category,
    pub verified: bool,
    pub generated: bool,
}

impl NewFact {
    /// Unverified, generator-sourced fact.
    pub fn generated(text: impl Into<String>, category: Category) -> Self {
        Self {
            text: text.into(),
            category,
            verified: false,
            generated: true,
        }
    }

    /// Verified, curated fact.
    pub fn verified(text: impl Into<String>, category: Category) -> Self {
        Self {
            text: text.into(),
            category,
            verified: true,
            generated: false,
        }
    }

    /// Materialize as a fact with a fresh id and zeroed counters.
    pub fn into_fact(self, now: Timestamp) -> Fact {
        Fact {
            id: new_entity_id(),
            text: self.text,
            category: self.category,
            verified: self.verified,
            generated: self.generated,
            views: 0,
            likes: 0,
            created_at: now,
        }
    }
}
