//! Service Configuration Module
//!
//! Quota, resolver, generator and usage settings. Configuration is loaded
//! from environment variables with defaults suitable for development, then
//! checked with [`ServiceConfig::validate`].

use std::time::Duration;

use factline_core::ConfigError;
use factline_llm::{CompletionOptions, DEFAULT_TIMEOUT};
use secrecy::SecretString;

/// Generation calls at or above this are a configuration error.
pub const MAX_GENERATOR_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// SECTIONS
// ============================================================================

/// Quota tracker settings.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Whether quota checks run at all.
    pub enabled: bool,
    /// Length of the request-rate window.
    pub rate_window: Duration,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_window: Duration::from_secs(15 * 60),
        }
    }
}

/// Fact resolver settings.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Whether the generator tier may be used.
    pub fallback_enabled: bool,
    /// Cache TTL for store-sourced facts.
    pub store_cache_ttl: Duration,
    /// Cache TTL for generated facts.
    pub generated_cache_ttl: Duration,
    /// Deployment-wide switch for persisting generated facts.
    pub persist_generated: bool,
    /// Cache key namespace.
    pub cache_namespace: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
            store_cache_ttl: Duration::from_secs(5 * 60),
            generated_cache_ttl: Duration::from_secs(60 * 60),
            persist_generated: true,
            cache_namespace: "facts".to_string(),
        }
    }
}

/// Fallback generator settings.
#[derive(Clone)]
pub struct GeneratorConfig {
    pub timeout: Duration,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub base_url: String,
    /// API key for the completion provider. `None` disables the HTTP client.
    pub api_key: Option<SecretString>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        let options = CompletionOptions::default();
        Self {
            timeout: DEFAULT_TIMEOUT,
            model: "gpt-4o-mini".to_string(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            base_url: factline_llm::providers::openai::DEFAULT_BASE_URL.to_string(),
            api_key: None,
        }
    }
}

impl GeneratorConfig {
    /// Completion options derived from this config.
    pub fn completion_options(&self) -> CompletionOptions {
        CompletionOptions::default()
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
    }
}

impl std::fmt::Debug for GeneratorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratorConfig")
            .field("timeout", &self.timeout)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Usage recorder settings.
#[derive(Debug, Clone)]
pub struct UsageConfig {
    /// Bound on each credential's popular-endpoints list.
    pub max_popular_endpoints: usize,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            max_popular_endpoints: 10,
        }
    }
}

// ============================================================================
// SERVICE CONFIGURATION
// ============================================================================

/// Complete service configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub quota: QuotaConfig,
    pub resolver: ResolverConfig,
    pub generator: GeneratorConfig,
    pub usage: UsageConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|s| match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => default,
        })
        .unwrap_or(default)
}

impl ServiceConfig {
    /// Create ServiceConfig from environment variables.
    ///
    /// Environment variables:
    /// - `FACTLINE_QUOTA_ENABLED`: "true" or "false" (default: true)
    /// - `FACTLINE_RATE_WINDOW_SECS`: Request-rate window (default: 900)
    /// - `FACTLINE_FALLBACK_ENABLED`: "true" or "false" (default: true)
    /// - `FACTLINE_STORE_CACHE_TTL_SECS`: TTL for store facts (default: 300)
    /// - `FACTLINE_GENERATED_CACHE_TTL_SECS`: TTL for generated facts (default: 3600)
    /// - `FACTLINE_PERSIST_GENERATED`: "true" or "false" (default: true)
    /// - `FACTLINE_CACHE_NAMESPACE`: Cache key namespace (default: "facts")
    /// - `FACTLINE_GENERATOR_TIMEOUT_MS`: Generation timeout (default: 5000)
    /// - `FACTLINE_GENERATOR_MODEL`: Model name (default: "gpt-4o-mini")
    /// - `FACTLINE_GENERATOR_MAX_TOKENS`: Completion token cap (default: 120)
    /// - `FACTLINE_GENERATOR_TEMPERATURE`: Sampling temperature (default: 0.7)
    /// - `FACTLINE_GENERATOR_BASE_URL`: OpenAI-compatible base URL
    /// - `FACTLINE_GENERATOR_API_KEY`: Provider API key (unset = no HTTP client)
    /// - `FACTLINE_MAX_POPULAR_ENDPOINTS`: Popular-endpoints bound (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let quota = QuotaConfig {
            enabled: env_flag("FACTLINE_QUOTA_ENABLED", defaults.quota.enabled),
            rate_window: env_parse("FACTLINE_RATE_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.quota.rate_window),
        };

        let resolver = ResolverConfig {
            fallback_enabled: env_flag(
                "FACTLINE_FALLBACK_ENABLED",
                defaults.resolver.fallback_enabled,
            ),
            store_cache_ttl: env_parse("FACTLINE_STORE_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.resolver.store_cache_ttl),
            generated_cache_ttl: env_parse("FACTLINE_GENERATED_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.resolver.generated_cache_ttl),
            persist_generated: env_flag(
                "FACTLINE_PERSIST_GENERATED",
                defaults.resolver.persist_generated,
            ),
            cache_namespace: std::env::var("FACTLINE_CACHE_NAMESPACE")
                .ok()
                .map(|s| s.trim().to_string())
                .unwrap_or(defaults.resolver.cache_namespace),
        };

        let generator = GeneratorConfig {
            timeout: env_parse("FACTLINE_GENERATOR_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.generator.timeout),
            model: std::env::var("FACTLINE_GENERATOR_MODEL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.generator.model),
            max_tokens: env_parse("FACTLINE_GENERATOR_MAX_TOKENS")
                .unwrap_or(defaults.generator.max_tokens),
            temperature: env_parse("FACTLINE_GENERATOR_TEMPERATURE")
                .unwrap_or(defaults.generator.temperature),
            base_url: std::env::var("FACTLINE_GENERATOR_BASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.generator.base_url),
            api_key: std::env::var("FACTLINE_GENERATOR_API_KEY")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
        };

        let usage = UsageConfig {
            max_popular_endpoints: env_parse("FACTLINE_MAX_POPULAR_ENDPOINTS")
                .unwrap_or(defaults.usage.max_popular_endpoints),
        };

        Self {
            quota,
            resolver,
            generator,
            usage,
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("quota.rate_window", self.quota.rate_window)?;
        non_zero("resolver.store_cache_ttl", self.resolver.store_cache_ttl)?;
        non_zero("resolver.generated_cache_ttl", self.resolver.generated_cache_ttl)?;
        non_zero("generator.timeout", self.generator.timeout)?;

        if self.generator.timeout >= MAX_GENERATOR_TIMEOUT {
            return Err(ConfigError::InvalidValue {
                field: "generator.timeout".to_string(),
                value: format!("{:?}", self.generator.timeout),
                reason: format!("must be under {:?}", MAX_GENERATOR_TIMEOUT),
            });
        }

        if !(0.0..=2.0).contains(&self.generator.temperature) {
            return Err(ConfigError::InvalidValue {
                field: "generator.temperature".to_string(),
                value: self.generator.temperature.to_string(),
                reason: "must be between 0 and 2".to_string(),
            });
        }

        if self.resolver.cache_namespace.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "resolver.cache_namespace".to_string(),
            });
        }
        if self.resolver.cache_namespace.contains(':') {
            return Err(ConfigError::InvalidValue {
                field: "resolver.cache_namespace".to_string(),
                value: self.resolver.cache_namespace.clone(),
                reason: "must not contain ':'".to_string(),
            });
        }

        if self.usage.max_popular_endpoints == 0 {
            return Err(ConfigError::InvalidValue {
                field: "usage.max_popular_endpoints".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

fn non_zero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: "0".to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quota.rate_window, Duration::from_secs(900));
        assert_eq!(config.resolver.store_cache_ttl, Duration::from_secs(300));
        assert_eq!(config.resolver.generated_cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.resolver.cache_namespace, "facts");
        assert_eq!(config.usage.max_popular_endpoints, 10);
    }

    #[test]
    fn test_rejects_long_generator_timeout() {
        let mut config = ServiceConfig::default();
        config.generator.timeout = Duration::from_secs(30);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "generator.timeout"));
    }

    #[test]
    fn test_rejects_zero_durations() {
        let mut config = ServiceConfig::default();
        config.resolver.store_cache_ttl = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_temperature_and_namespace() {
        let mut config = ServiceConfig::default();
        config.generator.temperature = 2.5;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.resolver.cache_namespace = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_popular_endpoints() {
        let mut config = ServiceConfig::default();
        config.usage.max_popular_endpoints = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_generator_debug_redacts_key() {
        let config = GeneratorConfig {
            api_key: Some(SecretString::from("sk-live-123".to_string())),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("sk-live-123"));
    }
}
