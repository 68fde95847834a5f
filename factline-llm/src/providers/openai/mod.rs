//! OpenAI provider implementation
//!
//! Chat-completion based text generation for the fallback generator.

pub mod client;
pub mod types;

pub use client::{OpenAiCompletionClient, DEFAULT_BASE_URL};
