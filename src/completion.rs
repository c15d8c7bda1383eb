//! Text-completion provider abstraction and implementations.
//!
//! Defines the [`TextCompletionProvider`] trait and concrete implementations:
//! - **[`DisabledCompletion`]** — returns errors; generation degrades to its
//!   deterministic fallback path.
//! - **[`OpenAICompletion`]** — chat-completions API.
//! - **[`OllamaCompletion`]** — local Ollama `/api/generate` endpoint.
//!
//! Completion calls are the only operations expected to block for
//! seconds-to-minutes; every provider carries an explicit request timeout,
//! and transport errors are ordinary failures the generation pipeline routes
//! into repair-retry or fallback.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;

use crate::config::CompletionConfig;

/// Output-format hint passed with a completion request.
///
/// Providers that support structured output (Ollama) honor it; others
/// ignore it and rely on prompt instructions alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    Json,
}

/// Trait for language-model completion providers.
#[async_trait]
pub trait TextCompletionProvider: Send + Sync {
    /// Returns the provider name (e.g. `"ollama"`).
    fn name(&self) -> &str;
    /// Generate a completion for the prompt. May return an error or an
    /// empty string; callers treat both as a transient failure.
    async fn generate(&self, prompt: &str, hint: Option<FormatHint>) -> Result<String>;
}

// ============ Disabled Provider ============

/// A null completion provider that always returns errors.
///
/// Used when `completion.provider = "disabled"`. The generation pipeline
/// treats the error as a failed model call and falls through to its
/// deterministic fallback, so offline operation still yields questions.
pub struct DisabledCompletion;

#[async_trait]
impl TextCompletionProvider for DisabledCompletion {
    fn name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &str, _hint: Option<FormatHint>) -> Result<String> {
        bail!("Completion provider is disabled")
    }
}

// ============ OpenAI Provider ============

/// Completion provider using the OpenAI chat-completions API.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAICompletion {
    model: String,
    temperature: f64,
    timeout_secs: u64,
}

impl OpenAICompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for OpenAI provider"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self {
            model,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl TextCompletionProvider for OpenAICompletion {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, prompt: &str, _hint: Option<FormatHint>) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": self.temperature,
        });

        let response = client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("OpenAI API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let content = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing content"))?;

        Ok(content.trim().to_string())
    }
}

// ============ Ollama Provider ============

/// Completion provider using a local Ollama server.
///
/// Calls `POST {base_url}/api/generate` with `stream: false`. When a JSON
/// format hint is given, Ollama's structured-output mode is enabled.
pub struct OllamaCompletion {
    base_url: String,
    model: String,
    temperature: f64,
    timeout_secs: u64,
}

impl OllamaCompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.base_url required for Ollama provider"))?;
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for Ollama provider"))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl TextCompletionProvider for OllamaCompletion {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, prompt: &str, hint: Option<FormatHint>) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "think": false,
            "options": {
                "temperature": self.temperature,
                "num_predict": 800,
            }
        });

        if hint == Some(FormatHint::Json) {
            body["format"] = serde_json::json!("json");
        }

        let response = client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Ollama HTTP {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        let text = json
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();

        if text.is_empty() {
            bail!("Ollama returned an empty response");
        }

        Ok(text)
    }
}

/// Create the appropriate [`TextCompletionProvider`] based on configuration.
///
/// # Supported Providers
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledCompletion`] |
/// | `"openai"` | [`OpenAICompletion`] |
/// | `"ollama"` | [`OllamaCompletion`] |
pub fn create_provider(config: &CompletionConfig) -> Result<Box<dyn TextCompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledCompletion)),
        "openai" => Ok(Box::new(OpenAICompletion::new(config)?)),
        "ollama" => Ok(Box::new(OllamaCompletion::new(config)?)),
        other => bail!("Unknown completion provider: {}", other),
    }
}
