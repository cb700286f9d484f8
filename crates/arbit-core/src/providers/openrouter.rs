//! OpenRouter chat-completions provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Provider, ProviderError, ProviderReply};
use crate::dispatcher::InferenceRequest;

const PROVIDER_NAME: &str = "openrouter";
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MODEL: &str = "allenai/olmo-3.1-32b-think:free";

// Upper bound on one provider call; per-request cancellation scopes are
// expected to fire well before this.
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
    #[serde(default)]
    error: Option<ChatError>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Deserialize)]
struct ChatError {
    #[serde(default)]
    message: String,
}

/// Provider adapter for the OpenRouter chat-completions API.
#[derive(Debug, Clone)]
pub struct OpenRouterProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterProvider {
    /// Creates a provider with the given credentials.
    ///
    /// `base_url` falls back to the public OpenRouter endpoint when `None`.
    #[must_use]
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn upstream(message: impl Into<String>) -> ProviderError {
        ProviderError::Upstream {
            provider: PROVIDER_NAME.to_string(),
            message: message.into(),
        }
    }

    async fn execute(&self, request: &InferenceRequest) -> Result<ProviderReply, ProviderError> {
        let model = if request.model.is_empty() {
            DEFAULT_MODEL
        } else {
            &request.model
        };

        let payload = ChatRequest {
            model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(format!(
                "{}/chat/completions",
                self.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| Self::upstream(e.to_string()))?;

        let status = response.status();
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| Self::upstream(format!("decode response: {e}")))?;

        if !status.is_success() {
            let message = body
                .error
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("status {status}"));
            return Err(Self::upstream(message));
        }

        let Some(choice) = body.choices.into_iter().next() else {
            return Err(Self::upstream("empty choices"));
        };

        Ok(ProviderReply {
            text: choice.message.content,
            provider: PROVIDER_NAME.to_string(),
            token_usage: body.usage.map_or(0, |u| u.total_tokens),
        })
    }
}

#[async_trait]
impl Provider for OpenRouterProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn complete(
        &self,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<ProviderReply, ProviderError> {
        tokio::select! {
            result = self.execute(request) => result,
            () = cancel.cancelled() => Err(ProviderError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_model_falls_back_to_default() {
        let request = InferenceRequest {
            prompt: "hi".to_string(),
            model: String::new(),
        };
        let model = if request.model.is_empty() {
            DEFAULT_MODEL
        } else {
            &request.model
        };
        assert_eq!(model, DEFAULT_MODEL);
    }

    #[test]
    fn test_error_body_takes_precedence_over_status() {
        let body: ChatResponse = serde_json::from_str(
            r#"{"error": {"message": "model offline"}, "choices": []}"#,
        )
        .expect("decode");
        assert_eq!(body.error.map(|e| e.message).as_deref(), Some("model offline"));
    }

    #[test]
    fn test_usage_defaults_to_zero_tokens() {
        let body: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "hello"}}]}"#,
        )
        .expect("decode");
        assert_eq!(body.usage.map_or(0, |u| u.total_tokens), 0);
        assert_eq!(body.choices[0].message.content, "hello");
    }
}
