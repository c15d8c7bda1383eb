use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_search_k")]
    pub default_k: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_search_k(),
        }
    }
}

fn default_search_k() -> i64 {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            base_url: None,
            timeout_secs: default_completion_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_completion_provider() -> String {
    "disabled".to_string()
}
fn default_completion_timeout_secs() -> u64 {
    180
}
fn default_temperature() -> f64 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Model attempts before a yes/no generation degrades to fallback.
    #[serde(default = "default_yn_attempts")]
    pub yn_attempts: u32,
    /// Model attempts before a multiple-choice generation degrades to fallback.
    #[serde(default = "default_mcq_attempts")]
    pub mcq_attempts: u32,
    /// Candidate attempts per requested batch item before the item is omitted.
    #[serde(default = "default_batch_attempts")]
    pub batch_attempts_per_item: u32,
    /// Hard cap on the flattened passage context passed to the model.
    #[serde(default = "default_context_cap")]
    pub context_cap_chars: usize,
    /// Recent stems per (kind, topic) merged into prompts as "avoid these".
    #[serde(default = "default_history_limit")]
    pub history_limit: i64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            yn_attempts: default_yn_attempts(),
            mcq_attempts: default_mcq_attempts(),
            batch_attempts_per_item: default_batch_attempts(),
            context_cap_chars: default_context_cap(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_yn_attempts() -> u32 {
    3
}
fn default_mcq_attempts() -> u32 {
    5
}
fn default_batch_attempts() -> u32 {
    12
}
fn default_context_cap() -> usize {
    8000
}
fn default_history_limit() -> i64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedbackConfig {
    /// Weight delta per rating point away from the 5.5 midpoint.
    #[serde(default = "default_gain")]
    pub gain: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            gain: default_gain(),
        }
    }
}

fn default_gain() -> f64 {
    0.05
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.retrieval.default_k < 1 {
        anyhow::bail!("retrieval.default_k must be >= 1");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "hashed" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or hashed.",
            other
        ),
    }

    match config.completion.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    if config.completion.provider == "ollama" && config.completion.base_url.is_none() {
        anyhow::bail!("completion.base_url must be set for the ollama provider");
    }

    if config.generation.yn_attempts == 0 || config.generation.mcq_attempts == 0 {
        anyhow::bail!("generation attempt budgets must be >= 1");
    }

    if config.feedback.gain <= 0.0 {
        anyhow::bail!("feedback.gain must be > 0");
    }

    Ok(config)
}
