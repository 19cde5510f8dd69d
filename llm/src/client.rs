use async_trait::async_trait;
use millrace_core::config::LlmConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Black-box completion seam. The classifier and the visual rewriter only
/// ever see a prompt-in / text-out surface.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    temperature: f64,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

/// HTTP client for the generate protocol:
/// POST {model, prompt, stream:false, temperature} -> {response}.
pub struct HttpLlmClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f64,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            model: config.model_name.clone(),
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            temperature: self.temperature,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        let body: GenerateResponse = response.json().await?;
        Ok(body.response)
    }
}

/// Scriptable stand-in for tests: responds per prompt-substring rule, with
/// an optional default, or fails outright.
pub struct MockLlm {
    rules: Vec<(String, String)>,
    default_response: Option<String>,
    fail: bool,
}

impl MockLlm {
    pub fn fixed(response: impl Into<String>) -> Self {
        Self {
            rules: Vec::new(),
            default_response: Some(response.into()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            rules: Vec::new(),
            default_response: None,
            fail: true,
        }
    }

    /// Route prompts containing `needle` to `response`.
    pub fn on(mut self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((needle.into(), response.into()));
        self
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        if self.fail {
            anyhow::bail!("simulated LLM outage");
        }
        for (needle, response) in &self.rules {
            if prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        match &self.default_response {
            Some(response) => Ok(response.clone()),
            None => anyhow::bail!("no scripted response for prompt"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_routes_by_substring_then_default() {
        let mock = MockLlm::fixed("default").on("chart", "chart answer");
        assert_eq!(mock.complete("explain this chart").await.unwrap(), "chart answer");
        assert_eq!(mock.complete("anything else").await.unwrap(), "default");
    }

    #[tokio::test]
    async fn failing_mock_errors() {
        assert!(MockLlm::failing().complete("x").await.is_err());
    }
}
