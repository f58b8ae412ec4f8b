use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub cluster: Option<ClusterConfig>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    /// SQLite file holding both the incident store and persisted vectors.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash`, `ollama`, `openai`, or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    /// Inputs longer than this are rejected with an encoding error;
    /// callers must truncate or reject first.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            max_input_chars: default_max_input_chars(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_max_input_chars() -> usize {
    8000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Similarity metric, fixed at construction: `cosine` or `inner_product`.
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: default_metric(),
        }
    }
}

fn default_metric() -> String {
    "cosine".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    /// Relevance cutoff for assembled generation contexts. Raw `search`
    /// results are not filtered; only evidence handed to the generator is.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            min_similarity: default_min_similarity(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_min_similarity() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    /// Approximate token budget for the assembled generation context.
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
        }
    }
}

fn default_token_budget() -> usize {
    2048
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// `local` (Ollama HTTP), `remote` (OpenAI-compatible HTTP), or
    /// `template` (deterministic offline composer).
    #[serde(default = "default_generation_backend")]
    pub backend: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            backend: default_generation_backend(),
            model: None,
            url: None,
            timeout_secs: default_timeout_secs(),
            max_output_chars: default_max_output_chars(),
        }
    }
}

fn default_generation_backend() -> String {
    "template".to_string()
}
fn default_max_output_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IntentConfig {
    /// Below this, parsed intents fall back to `unknown` and entities are
    /// flagged low-confidence.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

fn default_confidence_threshold() -> f32 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScorerConfig {
    /// `heuristic` (in-process) or `remote` (HTTP model endpoint).
    #[serde(default = "default_scorer_backend")]
    pub backend: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            backend: default_scorer_backend(),
            url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_scorer_backend() -> String {
    "heuristic".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusterConfig {
    /// Base URL of the orchestration platform's status API.
    pub url: String,
    #[serde(default = "default_cluster_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_cluster_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    /// Outbound chat webhook. When absent, deliveries go to stdout.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Shared secret for verifying inbound chat callbacks.
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Identical recommendations for the same dedup key are suppressed
    /// within this window.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            channel: default_channel(),
            signing_secret: None,
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_channel() -> String {
    "#ops-incidents".to_string()
}
fn default_cooldown_secs() -> u64 {
    300
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
    "127.0.0.1:7431".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    /// When set, events scoring at or above this risk are ingested
    /// automatically; when unset, only explicit ingestion writes.
    #[serde(default)]
    pub auto_ingest_risk_threshold: Option<f32>,
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    match config.embedding.provider.as_str() {
        "hash" | "ollama" | "openai" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, ollama, openai, or disabled.",
            other
        ),
    }

    if matches!(config.embedding.provider.as_str(), "ollama" | "openai") {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.index.metric.as_str() {
        "cosine" | "inner_product" => {}
        other => anyhow::bail!(
            "Unknown similarity metric: '{}'. Must be cosine or inner_product.",
            other
        ),
    }

    if config.retrieval.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }

    if config.context.token_budget == 0 {
        anyhow::bail!("context.token_budget must be >= 1");
    }

    match config.generation.backend.as_str() {
        "template" => {}
        "local" | "remote" => {
            if config.generation.model.is_none() {
                anyhow::bail!(
                    "generation.model must be specified when backend is '{}'",
                    config.generation.backend
                );
            }
        }
        other => anyhow::bail!(
            "Unknown generation backend: '{}'. Must be local, remote, or template.",
            other
        ),
    }

    if !(0.0..=1.0).contains(&config.intent.confidence_threshold) {
        anyhow::bail!("intent.confidence_threshold must be in [0.0, 1.0]");
    }

    match config.scorer.backend.as_str() {
        "heuristic" => {}
        "remote" => {
            if config.scorer.url.is_none() {
                anyhow::bail!("scorer.url must be specified when backend is 'remote'");
            }
        }
        other => anyhow::bail!(
            "Unknown scorer backend: '{}'. Must be heuristic or remote.",
            other
        ),
    }

    if let Some(threshold) = config.policy.auto_ingest_risk_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("policy.auto_ingest_risk_threshold must be in [0.0, 1.0]");
        }
    }

    Ok(config)
}
