//! Embedding encoder abstraction and implementations.
//!
//! Defines the [`EmbeddingEncoder`] trait and concrete implementations:
//! - **[`HashEncoder`]** — deterministic token-hash vectors, fully offline.
//! - **[`OllamaEncoder`]** — calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`OpenAiEncoder`]** — calls an OpenAI-compatible embeddings API.
//! - **[`DisabledEncoder`]** — returns errors; used when embeddings are not configured.
//!
//! Encoding is deterministic for identical input and model version, has no
//! side effects, and fails with an encoding error on empty or oversized
//! input. The core performs exactly one backend call per encode — retry
//! policy belongs to callers.
//!
//! Also provides vector utilities for the persisted index:
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 BLOB codec for SQLite
//! - [`cosine_similarity`] / [`inner_product`] — similarity kernels

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::AssistError;

/// Maps text to a fixed-length vector. Stateless and deterministic per
/// (input, model version).
#[async_trait]
pub trait EmbeddingEncoder: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality.
    fn dims(&self) -> usize;
    /// Encode one text into a vector of [`dims`](EmbeddingEncoder::dims) floats.
    async fn encode(&self, text: &str) -> Result<Vec<f32>, AssistError>;
}

/// Reject empty or oversized input before any backend call. Callers must
/// truncate or reject; the encoder never does it silently.
fn check_input(text: &str, max_chars: usize) -> Result<(), AssistError> {
    if text.trim().is_empty() {
        return Err(AssistError::Encoding("input text is empty".to_string()));
    }
    let len = text.chars().count();
    if len > max_chars {
        return Err(AssistError::Encoding(format!(
            "input of {} chars exceeds the {} char limit",
            len, max_chars
        )));
    }
    Ok(())
}

// ============ Hash Encoder ============

/// Deterministic token-hash embedding.
///
/// Each lowercased alphanumeric token is hashed into a bucket of the
/// output vector; the result is L2-normalized. No model download, no
/// network, identical output for identical input — which makes it the
/// default for tests and air-gapped deployments. Similarity quality is
/// lexical rather than semantic.
pub struct HashEncoder {
    dims: usize,
    max_input_chars: usize,
}

impl HashEncoder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            dims: config.dims.unwrap_or(256),
            max_input_chars: config.max_input_chars,
        }
    }
}

#[async_trait]
impl EmbeddingEncoder for HashEncoder {
    fn model_name(&self) -> &str {
        "token-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>, AssistError> {
        check_input(text, self.max_input_chars)?;

        let mut vec = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let mut hasher = Sha256::new();
            hasher.update(token.as_bytes());
            let digest = hasher.finalize();
            let bucket = u64::from_le_bytes(digest[..8].try_into().unwrap()) as usize % self.dims;
            vec[bucket] += 1.0;
        }

        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        Ok(vec)
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '-' && c != '.')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

// ============ Ollama Encoder ============

/// Encoder backed by a local Ollama instance (`POST /api/embed`).
pub struct OllamaEncoder {
    model: String,
    dims: usize,
    url: String,
    max_input_chars: usize,
    timeout_secs: u64,
}

impl OllamaEncoder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, AssistError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| AssistError::Config("embedding.model required for Ollama".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| AssistError::Config("embedding.dims required for Ollama".into()))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            max_input_chars: config.max_input_chars,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl EmbeddingEncoder for OllamaEncoder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>, AssistError> {
        check_input(text, self.max_input_chars)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| AssistError::Encoding(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = client
            .post(format!("{}/api/embed", self.url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AssistError::Encoding(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(AssistError::Encoding(format!(
                "Ollama API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AssistError::Encoding(e.to_string()))?;
        parse_embedding_array(&json, "embeddings")
    }
}

// ============ OpenAI Encoder ============

/// Encoder backed by an OpenAI-compatible embeddings API.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiEncoder {
    model: String,
    dims: usize,
    url: String,
    max_input_chars: usize,
    timeout_secs: u64,
}

impl OpenAiEncoder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, AssistError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| AssistError::Config("embedding.model required for OpenAI".into()))?;
        let dims = config
            .dims
            .ok_or_else(|| AssistError::Config("embedding.dims required for OpenAI".into()))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(AssistError::Config(
                "OPENAI_API_KEY environment variable not set".into(),
            ));
        }

        Ok(Self {
            model,
            dims,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            max_input_chars: config.max_input_chars,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl EmbeddingEncoder for OpenAiEncoder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn encode(&self, text: &str) -> Result<Vec<f32>, AssistError> {
        check_input(text, self.max_input_chars)?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AssistError::Config("OPENAI_API_KEY not set".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| AssistError::Encoding(e.to_string()))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = client
            .post(format!("{}/embeddings", self.url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AssistError::Encoding(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(AssistError::Encoding(format!(
                "OpenAI API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AssistError::Encoding(e.to_string()))?;

        let data = json
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .and_then(|item| item.get("embedding"))
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                AssistError::Encoding("Invalid OpenAI response: missing embedding".into())
            })?;

        Ok(data
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect())
    }
}

fn parse_embedding_array(json: &serde_json::Value, key: &str) -> Result<Vec<f32>, AssistError> {
    let first = json
        .get(key)
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            AssistError::Encoding(format!("Invalid embedding response: missing {}", key))
        })?;

    Ok(first
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Disabled Encoder ============

/// A no-op encoder that always returns errors. Used when
/// `embedding.provider = "disabled"`.
pub struct DisabledEncoder;

#[async_trait]
impl EmbeddingEncoder for DisabledEncoder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn encode(&self, _text: &str) -> Result<Vec<f32>, AssistError> {
        Err(AssistError::Encoding(
            "embedding provider is disabled".to_string(),
        ))
    }
}

/// Create the appropriate [`EmbeddingEncoder`] based on configuration.
pub fn create_encoder(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingEncoder>, AssistError> {
    match config.provider.as_str() {
        "hash" => Ok(Box::new(HashEncoder::new(config))),
        "ollama" => Ok(Box::new(OllamaEncoder::new(config)?)),
        "openai" => Ok(Box::new(OpenAiEncoder::new(config)?)),
        "disabled" => Ok(Box::new(DisabledEncoder)),
        other => Err(AssistError::Config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Vector utilities ============

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Raw inner product. Returns `0.0` for empty vectors or vectors of
/// different lengths.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;

    fn hash_encoder() -> HashEncoder {
        HashEncoder::new(&EmbeddingConfig::default())
    }

    #[tokio::test]
    async fn test_hash_encoder_deterministic() {
        let enc = hash_encoder();
        let a = enc.encode("disk full on node-3").await.unwrap();
        let b = enc.encode("disk full on node-3").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), enc.dims());
    }

    #[tokio::test]
    async fn test_hash_encoder_normalized() {
        let enc = hash_encoder();
        let v = enc.encode("failed login burst from 10.1.2.3").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_similar_texts_score_high() {
        let enc = hash_encoder();
        let a = enc.encode("disk full on node-3").await.unwrap();
        let b = enc.encode("disk full alert node-3").await.unwrap();
        let c = enc.encode("certificate expired on ingress").await.unwrap();
        assert!(cosine_similarity(&a, &b) > 0.5);
        assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let enc = hash_encoder();
        let err = enc.encode("   ").await.unwrap_err();
        assert_eq!(err.category(), "encoding");
    }

    #[tokio::test]
    async fn test_oversized_input_rejected() {
        let enc = HashEncoder::new(&EmbeddingConfig {
            max_input_chars: 16,
            ..Default::default()
        });
        let err = enc.encode("this input is well past sixteen chars").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_disabled_encoder_errors() {
        let err = DisabledEncoder.encode("anything").await.unwrap_err();
        assert_eq!(err.category(), "encoding");
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_inner_product() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert!((inner_product(&a, &b) - 32.0).abs() < 1e-6);
    }
}
