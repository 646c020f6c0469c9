use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::Config;

/// Standardized reply from a language-model backend.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub content: String,
    pub model: String,
    pub tokens_used: Option<u64>,
    pub latency: Option<Duration>,
}

/// A text-generation capability. Backends are selected by configuration and
/// tried in order by [`GatewayStack`].
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn generate(&self, prompt: &str) -> Result<LlmReply>;
}

/// Backend for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiBackend {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(api_key: Option<String>, base_url: String, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
            model,
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, prompt: &str) -> Result<LlmReply> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow!("no API key configured"))?;

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": 0.2,
            }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            bail!("chat completions API error ({status}): {message}");
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("no content in model response: {body}"))?
            .to_string();

        Ok(LlmReply {
            content,
            model: self.model.clone(),
            tokens_used: body["usage"]["total_tokens"].as_u64(),
            latency: Some(started.elapsed()),
        })
    }
}

/// Backend for a local Ollama server.
pub struct OllamaBackend {
    client: Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            model,
        }
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn is_available(&self) -> bool {
        // Probe the model list to see whether the server is up at all.
        self.client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn generate(&self, prompt: &str) -> Result<LlmReply> {
        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
            }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;

        if !status.is_success() {
            bail!("ollama API error ({status}): {body}");
        }

        let content = body["response"]
            .as_str()
            .ok_or_else(|| anyhow!("no response field in ollama reply: {body}"))?
            .to_string();

        Ok(LlmReply {
            content,
            model: self.model.clone(),
            tokens_used: body["eval_count"].as_u64(),
            latency: Some(started.elapsed()),
        })
    }
}

/// Ordered list of backends. Generation walks the list, skipping backends
/// that report themselves unavailable and moving on after a failed call;
/// the first successful reply wins.
pub struct GatewayStack {
    backends: Vec<Box<dyn LlmBackend>>,
}

impl GatewayStack {
    pub fn new(backends: Vec<Box<dyn LlmBackend>>) -> Self {
        Self { backends }
    }

    /// Build the configured primary backend plus the other one as fallback.
    pub fn from_config(config: &Config) -> Self {
        let openai: Box<dyn LlmBackend> = Box::new(OpenAiBackend::new(
            config.openai_api_key.clone(),
            config.openai_base_url.clone(),
            config.openai_model.clone(),
        ));
        let ollama: Box<dyn LlmBackend> = Box::new(OllamaBackend::new(
            config.ollama_base_url.clone(),
            config.ollama_model.clone(),
        ));

        let backends = match config.llm_backend.as_str() {
            "ollama" => vec![ollama, openai],
            _ => vec![openai, ollama],
        };
        Self::new(backends)
    }

    pub async fn generate(&self, prompt: &str) -> Result<LlmReply> {
        for backend in &self.backends {
            if !backend.is_available().await {
                warn!(backend = backend.name(), "backend unavailable, trying next");
                continue;
            }
            match backend.generate(prompt).await {
                Ok(reply) => {
                    debug!(
                        backend = backend.name(),
                        model = %reply.model,
                        tokens = ?reply.tokens_used,
                        "generation succeeded"
                    );
                    return Ok(reply);
                }
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, "backend failed, trying next");
                }
            }
        }
        bail!("all language-model backends failed")
    }

    pub async fn is_available(&self) -> bool {
        for backend in &self.backends {
            if backend.is_available().await {
                return true;
            }
        }
        false
    }
}
