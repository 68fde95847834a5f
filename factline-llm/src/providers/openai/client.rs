//! OpenAI-compatible chat completion client

use super::types::{ApiError, ChatCompletionRequest, ChatCompletionResponse, Message};
use crate::providers::{invalid_response, rate_limited, request_failed};
use crate::{CompletionOptions, TextCompletion};
use async_trait::async_trait;
use factline_core::LlmError;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};

const PROVIDER: &str = "openai";

/// Default public endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat completion client for OpenAI and API-compatible servers.
pub struct OpenAiCompletionClient {
    client: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
}

impl OpenAiCompletionClient {
    /// Create a client for `model` against the public endpoint.
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
        }
    }

    /// Point the client at another OpenAI-compatible server.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// POST `body` to `{base_url}/{endpoint}` and decode the JSON reply.
    pub async fn request<Req: Serialize, Res: DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &Req,
    ) -> Result<Res, LlmError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| request_failed(PROVIDER, 0, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let retry_after_ms = parse_retry_after_ms(response.headers()).unwrap_or(0);

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| invalid_response(PROVIDER, format!("Failed to parse response: {}", e)))
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(error_for_status(status, &error_text, retry_after_ms))
        }
    }
}

/// Map a non-success reply to an [`LlmError`].
fn error_for_status(status: StatusCode, body: &str, retry_after_ms: u64) -> LlmError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return rate_limited(PROVIDER, retry_after_ms);
    }
    let message = serde_json::from_str::<ApiError>(body)
        .map(|api_error| api_error.error.message)
        .unwrap_or_else(|_| body.to_string());
    request_failed(PROVIDER, status.as_u16(), message)
}

fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|seconds| *seconds >= 0.0)
        .map(|seconds| (seconds * 1000.0) as u64)
}

#[async_trait]
impl TextCompletion for OpenAiCompletionClient {
    async fn complete(&self, prompt: &str, options: &CompletionOptions) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &options.system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(prompt));

        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: Some(options.max_tokens),
            temperature: Some(options.temperature),
        };

        let response: ChatCompletionResponse =
            self.request("chat/completions", &request).await?;

        response
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| invalid_response(PROVIDER, "No choices in response"))
    }

    fn provider_name(&self) -> &str {
        PROVIDER
    }
}

impl std::fmt::Debug for OpenAiCompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompletionClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}
