//! OpenAI-compatible completion backend.
//!
//! Works with any service implementing the chat completions API. Each
//! step prompt is sent as a single user message.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::InvokerConfig;

use super::{Invocation, InvokerError, StepInvoker};

/// Step invoker backed by an OpenAI-compatible HTTP API.
pub struct HttpInvoker {
    client: Client,
    config: InvokerConfig,
}

impl HttpInvoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Creates an invoker from `PROMPTCHAIN_*` environment variables.
    pub fn from_env() -> Self {
        Self::new(InvokerConfig::from_env())
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn build_request(&self, prompt: &str) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        }
    }

    fn parse_response(&self, response: ChatResponse) -> Result<Invocation, InvokerError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InvokerError::InvalidResponse("no choices in response".to_string()))?;

        let output = choice.message.content.unwrap_or_default();
        let usage = response.usage.unwrap_or_default();
        let tokens = if usage.total_tokens > 0 {
            usage.total_tokens
        } else {
            usage.prompt_tokens + usage.completion_tokens
        };

        Ok(Invocation {
            output,
            tokens,
            cost: self.config.price(usage.prompt_tokens, usage.completion_tokens),
        })
    }
}

#[async_trait]
impl StepInvoker for HttpInvoker {
    fn name(&self) -> &str {
        "http"
    }

    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<Invocation, InvokerError> {
        let url = format!("{}/chat/completions", self.config.api_base);

        debug!(
            "Sending completion request to {} (model {}, {} chars)",
            url,
            self.config.model,
            prompt.len()
        );

        let mut request = self
            .client
            .post(&url)
            .json(&self.build_request(prompt))
            .timeout(timeout);

        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InvokerError::Timeout
            } else {
                InvokerError::Connection(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            warn!("Completion backend rate limited the request");
            return Err(InvokerError::RateLimited);
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvokerError::Rejected(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InvokerError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| InvokerError::InvalidResponse(e.to_string()))?;

        self.parse_response(body)
    }
}

// Chat completions wire types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoker() -> HttpInvoker {
        HttpInvoker::new(InvokerConfig {
            api_base: "http://localhost:9".to_string(),
            api_key: Some("secret".to_string()),
            model: "test-model".to_string(),
            input_cost_per_1k: 1.0,
            output_cost_per_1k: 2.0,
        })
    }

    #[test]
    fn test_build_request() {
        let request = invoker().build_request("Hello");
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(
            body,
            json!({
                "model": "test-model",
                "messages": [{"role": "user", "content": "Hello"}]
            })
        );
    }

    #[test]
    fn test_parse_response_with_usage() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}}],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 500, "total_tokens": 1500}
        }))
        .unwrap();

        let invocation = invoker().parse_response(response).unwrap();
        assert_eq!(invocation.output, "Hi there");
        assert_eq!(invocation.tokens, 1500);
        assert!((invocation.cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_response_without_total() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "x"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 4}
        }))
        .unwrap();

        let invocation = invoker().parse_response(response).unwrap();
        assert_eq!(invocation.tokens, 7);
    }

    #[test]
    fn test_parse_response_no_choices() {
        let response: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        let err = invoker().parse_response(response).unwrap_err();
        assert!(matches!(err, InvokerError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_connection_error() {
        let err = invoker()
            .invoke("Hello", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokerError::Connection(_) | InvokerError::Timeout));
    }
}
