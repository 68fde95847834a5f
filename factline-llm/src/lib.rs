//! factline LLM - fallback generation
//!
//! The text-completion capability is an external collaborator behind
//! [`TextCompletion`]. This crate owns the invocation policy around it: the
//! prompt, the timeout, and how a reply is accepted or rejected
//! ([`FallbackGenerator`]). An OpenAI-compatible HTTP client is provided in
//! [`providers`].

pub mod generator;
pub mod providers;

pub use generator::{
    fact_prompt, interpret_output, FallbackGenerator, GeneratedFact, DEFAULT_TIMEOUT,
    MAX_FACT_CHARS, MIN_FACT_CHARS,
};
pub use providers::OpenAiCompletionClient;

use async_trait::async_trait;
use factline_core::LlmError;
use serde::{Deserialize, Serialize};

// ============================================================================
// TEXT COMPLETION TRAIT
// ============================================================================

/// Options for a single completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    /// Maximum tokens in the completion.
    pub max_tokens: u32,
    /// Sampling temperature, 0.0 to 2.0.
    pub temperature: f32,
    /// Optional system instruction sent ahead of the prompt.
    pub system: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            max_tokens: 120,
            temperature: 0.7,
            system: None,
        }
    }
}

impl CompletionOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Opaque text-completion capability.
/// Implementations must be thread-safe (Send + Sync).
///
/// # Example
/// ```ignore
/// struct LocalModel { /* ... */ }
///
/// #[async_trait]
/// impl TextCompletion for LocalModel {
///     async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, LlmError> {
///         // Run the model
///     }
///
///     fn provider_name(&self) -> &str {
///         "local"
///     }
/// }
/// ```
#[async_trait]
pub trait TextCompletion: Send + Sync {
    /// Complete `prompt` and return the raw text.
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, LlmError>;

    /// Short provider name used in errors and logs.
    fn provider_name(&self) -> &str;
}
