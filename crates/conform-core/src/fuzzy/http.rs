//! HTTP judges for the supported chat providers.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::error::{JudgeError, JudgeResult};
use super::judge::Judge;
use super::{clip, JudgeConfig, Provider};

/// Judge backed by a provider's HTTP API.
pub struct HttpJudge {
    provider: Provider,
    model: String,
    endpoint: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpJudge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpJudge")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl HttpJudge {
    /// Build a judge from configuration, reading the credential from the
    /// environment. A missing credential is [`JudgeError::Unavailable`].
    pub fn from_config(config: &JudgeConfig) -> JudgeResult<Self> {
        let api_key = match config.credential_var() {
            Some(var) => match std::env::var(&var) {
                Ok(key) if !key.trim().is_empty() => Some(key),
                _ => return Err(JudgeError::Unavailable(format!("{var} is not set"))),
            },
            None => None,
        };
        let client = reqwest::Client::builder()
            .user_agent(concat!("conform/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| JudgeError::Unavailable(format!("http client: {e}")))?;

        Ok(Self {
            provider: config.provider,
            model: config.model_name(),
            endpoint: config.endpoint_url(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    fn request(&self, prompt: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(&self.endpoint);
        match self.provider {
            Provider::OpenAi => {
                let body = json!({
                    "model": self.model,
                    "messages": [{"role": "user", "content": prompt}],
                    "temperature": self.temperature,
                    "max_tokens": self.max_tokens,
                });
                let builder = builder.json(&body);
                match &self.api_key {
                    Some(key) => builder.bearer_auth(key),
                    None => builder,
                }
            }
            Provider::Anthropic => {
                let body = json!({
                    "model": self.model,
                    "max_tokens": self.max_tokens,
                    "temperature": self.temperature,
                    "messages": [{"role": "user", "content": prompt}],
                });
                let builder = builder
                    .header("anthropic-version", "2023-06-01")
                    .json(&body);
                match &self.api_key {
                    Some(key) => builder.header("x-api-key", key),
                    None => builder,
                }
            }
            Provider::Ollama => builder.json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "options": {"temperature": self.temperature},
            })),
        }
    }
}

/// Pull the completion text out of a provider response body.
pub fn completion_text(provider: Provider, body: &serde_json::Value) -> JudgeResult<String> {
    let text = match provider {
        Provider::OpenAi => body
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str()),
        Provider::Anthropic => body.pointer("/content/0/text").and_then(|v| v.as_str()),
        Provider::Ollama => body.get("response").and_then(|v| v.as_str()),
    };
    text.map(str::to_string).ok_or_else(|| {
        JudgeError::MalformedResponse(format!(
            "no completion text in {}",
            clip(&body.to_string(), 200)
        ))
    })
}

#[async_trait]
impl Judge for HttpJudge {
    fn describe(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }

    async fn complete(&self, prompt: &str) -> JudgeResult<String> {
        let response = self.request(prompt).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(JudgeError::Http(format!("{status}: {}", clip(&body, 300))));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| JudgeError::MalformedResponse(e.to_string()))?;
        debug!(provider = %self.provider, model = %self.model, "judge completion received");
        completion_text(self.provider, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_text_per_provider() {
        let openai = json!({"choices": [{"message": {"content": "{\"value\": 1}"}}]});
        assert_eq!(
            completion_text(Provider::OpenAi, &openai).unwrap(),
            "{\"value\": 1}"
        );
        let anthropic = json!({"content": [{"type": "text", "text": "hi"}]});
        assert_eq!(completion_text(Provider::Anthropic, &anthropic).unwrap(), "hi");
        let ollama = json!({"response": "ok", "done": true});
        assert_eq!(completion_text(Provider::Ollama, &ollama).unwrap(), "ok");
    }

    #[test]
    fn missing_text_is_malformed() {
        let err = completion_text(Provider::OpenAi, &json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, JudgeError::MalformedResponse(_)));
    }

    #[test]
    fn malformed_preview_keeps_multibyte_text_whole() {
        let body = json!({"error": "ü".repeat(400)});
        let Err(JudgeError::MalformedResponse(message)) = completion_text(Provider::Anthropic, &body)
        else {
            panic!("expected a malformed response");
        };
        assert!(message.contains("üüü"));
    }

    #[test]
    fn missing_credential_is_unavailable() {
        let config = JudgeConfig {
            provider: Provider::Anthropic,
            api_key_env: Some("CONFORM_TEST_KEY_THAT_IS_NEVER_SET".into()),
            ..JudgeConfig::default()
        };
        let err = HttpJudge::from_config(&config).unwrap_err();
        assert!(matches!(err, JudgeError::Unavailable(_)));
    }

    #[test]
    fn ollama_needs_no_credential() {
        let config = JudgeConfig {
            provider: Provider::Ollama,
            ..JudgeConfig::default()
        };
        let judge = HttpJudge::from_config(&config).unwrap();
        assert_eq!(judge.describe(), "ollama/llama3.2");
    }
}
