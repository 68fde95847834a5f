//! Fallback fact generator.
//!
//! Decides how the text-completion collaborator is asked for a fact and how
//! its reply is interpreted. Every failure mode (provider error, timeout,
//! unusable text) surfaces as an [`LlmError`]; there is no further tier to
//! fall back to.

use std::sync::Arc;
use std::time::Duration;

use factline_core::{Category, LlmError};
use tracing::{debug, warn};

use crate::{CompletionOptions, TextCompletion};

/// Shortest acceptable fact, in characters.
pub const MIN_FACT_CHARS: usize = 20;

/// Longest acceptable fact, in characters.
pub const MAX_FACT_CHARS: usize = 500;

/// Default hard limit on one generation call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const SYSTEM_PROMPT: &str = "You write short, accurate trivia facts. \
     Reply with exactly one sentence containing one true, verifiable fact. \
     Do not add a preface, a label, quotation marks, or a follow-up question.";

const REFUSAL_PREFIXES: [&str; 5] = ["i'm sorry", "i am sorry", "i cannot", "i can't", "as an ai"];

/// A fact produced by the generator, not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFact {
    pub text: String,
    pub category: Category,
}

/// Prompt for one fact, scoped to `category` when given.
pub fn fact_prompt(category: Option<Category>) -> String {
    match category {
        Some(category) => format!(
            "Give me one interesting, true fact about {}. Keep it to a single concise sentence.",
            category
        ),
        None => "Give me one interesting, true fact about any topic. \
                 Keep it to a single concise sentence."
            .to_string(),
    }
}

/// Normalize raw completion text into a fact, or reject it.
///
/// Trims, collapses whitespace, strips a leading `Fact:` label and
/// surrounding quotes, then enforces length bounds and refusal detection.
pub fn interpret_output(provider: &str, raw: &str) -> Result<String, LlmError> {
    let reject = |reason: String| LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason,
    };

    let mut text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    text = strip_label(&text).to_string();
    text = strip_quotes(&text).to_string();
    text = strip_label(&text).trim().to_string();

    if text.is_empty() {
        return Err(reject("empty completion".to_string()));
    }

    let lowered = text.to_lowercase();
    if REFUSAL_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return Err(reject("completion is a refusal".to_string()));
    }

    let chars = text.chars().count();
    if chars < MIN_FACT_CHARS {
        return Err(reject(format!(
            "completion too short: {} chars, minimum {}",
            chars, MIN_FACT_CHARS
        )));
    }
    if chars > MAX_FACT_CHARS {
        return Err(reject(format!(
            "completion too long: {} chars, maximum {}",
            chars, MAX_FACT_CHARS
        )));
    }

    Ok(text)
}

fn strip_label(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.get(..5) {
        Some(head) if head.eq_ignore_ascii_case("fact:") => trimmed[5..].trim_start(),
        _ => trimmed,
    }
}

fn strip_quotes(text: &str) -> &str {
    const PAIRS: [(char, char); 3] = [('"', '"'), ('\'', '\''), ('\u{201c}', '\u{201d}')];
    let trimmed = text.trim();
    for (open, close) in PAIRS {
        if trimmed.chars().count() >= 2 && trimmed.starts_with(open) && trimmed.ends_with(close) {
            return trimmed[open.len_utf8()..trimmed.len() - close.len_utf8()].trim();
        }
    }
    trimmed
}

/// Timeout-bounded generator over a [`TextCompletion`] collaborator.
#[derive(Clone)]
pub struct FallbackGenerator {
    client: Arc<dyn TextCompletion>,
    options: CompletionOptions,
    timeout: Duration,
}

impl FallbackGenerator {
    pub fn new(client: Arc<dyn TextCompletion>) -> Self {
        Self {
            client,
            options: CompletionOptions::default().with_system(SYSTEM_PROMPT),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace completion options. A missing system prompt gets the default.
    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = if options.system.is_some() {
            options
        } else {
            options.with_system(SYSTEM_PROMPT)
        };
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ask the collaborator for one fact.
    ///
    /// Unfiltered requests are filed under [`Category::General`].
    pub async fn generate(&self, category: Option<Category>) -> Result<GeneratedFact, LlmError> {
        let provider = self.client.provider_name().to_string();
        let prompt = fact_prompt(category);

        let raw = match tokio::time::timeout(self.timeout, self.client.complete(&prompt, &self.options)).await
        {
            Ok(Ok(raw)) => raw,
            Ok(Err(error)) => {
                warn!(provider = %provider, %error, "fact generation failed");
                return Err(error);
            }
            Err(_) => {
                warn!(provider = %provider, timeout_ms = self.timeout.as_millis() as u64, "fact generation timed out");
                return Err(LlmError::Timeout {
                    elapsed: self.timeout,
                });
            }
        };

        let text = interpret_output(&provider, &raw).inspect_err(|error| {
            warn!(provider = %provider, %error, "generated fact rejected");
        })?;

        let category = category.unwrap_or(Category::General);
        debug!(provider = %provider, category = %category, "fact generated");
        Ok(GeneratedFact { text, category })
    }
}

impl std::fmt::Debug for FallbackGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackGenerator")
            .field("provider", &self.client.provider_name())
            .field("timeout", &self.timeout)
            .field("options", &self.options)
            .finish()
    }
}
