//! LLM provider implementations.
//!
//! | Config Value | Endpoint |
//! |-------------|----------|
//! | `"openai"` | `POST {url}/chat/completions` (needs `OPENAI_API_KEY`) |
//! | `"ollama"` | `POST {url}/api/generate` with `stream: false` |
//! | `"gemini"` | `POST {url}/models/{model}:generateContent` (needs `GOOGLE_API_KEY`) |
//! | `"disabled"` | always errors |
//!
//! Each provider sends the prompt as a single user message and returns the
//! generated text unchanged.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

use pdf_rag_core::llm::LlmProvider;

use crate::config::LlmConfig;
use crate::remote::{build_client, post_json_with_retry};

pub struct DisabledLlm;

#[async_trait]
impl LlmProvider for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &str) -> Result<String> {
        bail!("LLM provider is disabled")
    }
}

struct Endpoint {
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl Endpoint {
    fn new(config: &LlmConfig, label: &str, default_url: &str) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required for {} provider", label))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| default_url.to_string())
                .trim_end_matches('/')
                .to_string(),
            max_retries: config.max_retries,
            client: build_client(config.timeout_secs)?,
        })
    }
}

// ============ OpenAI ============

pub struct OpenAILlm {
    endpoint: Endpoint,
    api_key: String,
}

impl OpenAILlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            endpoint: Endpoint::new(config, "OpenAI", "https://api.openai.com/v1")?,
            api_key,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAILlm {
    fn model_name(&self) -> &str {
        &self.endpoint.model
    }
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.endpoint.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let json = post_json_with_retry(
            &self.endpoint.client,
            &format!("{}/chat/completions", self.endpoint.url),
            &[("Authorization", format!("Bearer {}", self.api_key))],
            &body,
            self.endpoint.max_retries,
            "OpenAI",
        )
        .await?;
        parse_openai_completion(&json)
    }
}

fn parse_openai_completion(json: &serde_json::Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

// ============ Ollama ============

pub struct OllamaLlm {
    endpoint: Endpoint,
}

impl OllamaLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            endpoint: Endpoint::new(config, "Ollama", "http://localhost:11434")?,
        })
    }
}

#[async_trait]
impl LlmProvider for OllamaLlm {
    fn model_name(&self) -> &str {
        &self.endpoint.model
    }
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.endpoint.model,
            "prompt": prompt,
            "stream": false,
        });
        let json = post_json_with_retry(
            &self.endpoint.client,
            &format!("{}/api/generate", self.endpoint.url),
            &[],
            &body,
            self.endpoint.max_retries,
            "Ollama",
        )
        .await?;
        json.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing response"))
    }
}

// ============ Gemini ============

pub struct GeminiLlm {
    endpoint: Endpoint,
    api_key: String,
}

impl GeminiLlm {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| anyhow!("GOOGLE_API_KEY environment variable not set"))?;
        Ok(Self {
            endpoint: Endpoint::new(
                config,
                "Gemini",
                "https://generativelanguage.googleapis.com/v1beta",
            )?,
            api_key,
        })
    }
}

#[async_trait]
impl LlmProvider for GeminiLlm {
    fn model_name(&self) -> &str {
        &self.endpoint.model
    }
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        });
        let json = post_json_with_retry(
            &self.endpoint.client,
            &format!(
                "{}/models/{}:generateContent",
                self.endpoint.url, self.endpoint.model
            ),
            &[("x-goog-api-key", self.api_key.clone())],
            &body,
            self.endpoint.max_retries,
            "Gemini",
        )
        .await?;
        parse_gemini_completion(&json)
    }
}

/// Concatenate the text parts of the first candidate.
fn parse_gemini_completion(json: &serde_json::Value) -> Result<String> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| anyhow!("Invalid Gemini response: missing candidates[0].content.parts"))?;

    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(""))
}

pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => Ok(Arc::new(OpenAILlm::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaLlm::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiLlm::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}
