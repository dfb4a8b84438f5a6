//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//! [`load_config`] parses and validates; [`Config::from_toml`] does the same
//! for an in-memory string (tests build configs this way).

use anyhow::{Context, Result};
use docchat_core::chunk::ChunkParams;
use docchat_core::prompt::{HistoryTruncation, PromptPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Chunk size and overlap, in characters.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            overlap: default_overlap(),
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> ChunkParams {
        ChunkParams {
            target_size: self.target_size,
            overlap: self.overlap,
        }
    }
}

fn default_target_size() -> usize {
    1000
}
fn default_overlap() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the `ollama` provider, or an OpenAI-compatible override.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// OpenAI-compatible chat-completions backend.
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_generation_model")]
    pub model: String,
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: default_generation_model(),
            base_url: default_generation_base_url(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

fn default_generation_provider() -> String {
    "openai".to_string()
}
fn default_generation_model() -> String {
    "llama3-70b-8192".to_string()
}
fn default_generation_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}
fn default_api_key_env() -> String {
    "GROQ_API_KEY".to_string()
}
fn default_max_tokens() -> i64 {
    1024
}
fn default_temperature() -> f32 {
    0.7
}
fn default_generation_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self { k: default_k() }
    }
}

fn default_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_context_token_budget")]
    pub context_token_budget: i64,
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: i64,
    #[serde(default = "default_truncation")]
    pub truncation: HistoryTruncation,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            context_token_budget: default_context_token_budget(),
            history_token_budget: default_history_token_budget(),
            truncation: default_truncation(),
        }
    }
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Answer using the provided context when it is relevant.".to_string()
}
fn default_context_token_budget() -> i64 {
    1500
}
fn default_history_token_budget() -> i64 {
    1000
}
fn default_truncation() -> HistoryTruncation {
    HistoryTruncation::DropOldestTurns
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaConfig {
    /// Allocation given to accounts opened without an explicit amount.
    #[serde(default = "default_allocation")]
    pub default_allocation: i64,
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_allocation: default_allocation(),
            max_cas_attempts: default_max_cas_attempts(),
        }
    }
}

fn default_allocation() -> i64 {
    10_000
}
fn default_max_cas_attempts() -> u32 {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// Embedding attempts per ingestion run before the document is failed.
    #[serde(default = "default_ingest_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_ingest_attempts(),
            backoff_ms: default_backoff_ms(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_ingest_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_max_upload_bytes() -> u64 {
    10 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

impl Config {
    /// Parse and validate a TOML string.
    pub fn from_toml(content: &str) -> Result<Config> {
        let config: Config =
            toml::from_str(content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn prompt_policy(&self) -> PromptPolicy {
        PromptPolicy {
            context_token_budget: self.prompt.context_token_budget,
            history_token_budget: self.prompt.history_token_budget,
            max_completion_tokens: self.generation.max_tokens,
            truncation: self.prompt.truncation,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.chunking.overlap == 0 {
            anyhow::bail!("chunking.overlap must be > 0");
        }
        if self.chunking.overlap >= self.chunking.target_size {
            anyhow::bail!("chunking.overlap must be smaller than chunking.target_size");
        }

        if self.retrieval.k < 1 {
            anyhow::bail!("retrieval.k must be >= 1");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "hash" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, hash, or local.",
                other
            ),
        }
        if self.embedding.is_enabled() && self.embedding.provider != "local" {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() && self.embedding.provider != "hash" {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }

        match self.generation.provider.as_str() {
            "disabled" | "openai" => {}
            other => anyhow::bail!(
                "Unknown generation provider: '{}'. Must be disabled or openai.",
                other
            ),
        }
        if self.generation.max_tokens < 1 {
            anyhow::bail!("generation.max_tokens must be >= 1");
        }

        if self.prompt.context_token_budget < 0 || self.prompt.history_token_budget < 0 {
            anyhow::bail!("prompt token budgets must be >= 0");
        }
        if self.quota.default_allocation < 0 {
            anyhow::bail!("quota.default_allocation must be >= 0");
        }
        if self.quota.max_cas_attempts == 0 {
            anyhow::bail!("quota.max_cas_attempts must be >= 1");
        }
        if self.ingest.max_attempts == 0 {
            anyhow::bail!("ingest.max_attempts must be >= 1");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml(&content)
}
