//! Response generation over a pluggable language-model backend.
//!
//! [`ResponseGenerator`] owns the prompt construction, the request
//! timeout, the output-length cap, and provenance tracking; backends only
//! turn a prompt into text. Backend choice (`local` Ollama, `remote`
//! OpenAI-compatible, or the offline `template` composer) is configuration,
//! invisible to callers.
//!
//! Provenance is derived from the incidents present in the final prompt,
//! never re-parsed out of the generated text.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::timeout;

use crate::config::GenerationConfig;
use crate::error::AssistError;
use crate::models::{GenerationContext, Recommendation, SignalState};

/// A language-model backend: prompt in, completion out.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(
        &self,
        context: &GenerationContext,
        prompt: &str,
        max_chars: usize,
    ) -> Result<String, AssistError>;
}

pub struct ResponseGenerator {
    backend: Box<dyn GenerationBackend>,
    timeout: Duration,
    max_output_chars: usize,
}

impl ResponseGenerator {
    pub fn new(
        backend: Box<dyn GenerationBackend>,
        timeout: Duration,
        max_output_chars: usize,
    ) -> Self {
        Self {
            backend,
            timeout,
            max_output_chars,
        }
    }

    pub fn from_config(config: &GenerationConfig) -> Result<Self, AssistError> {
        let backend = create_backend(config)?;
        Ok(Self::new(
            backend,
            Duration::from_secs(config.timeout_secs),
            config.max_output_chars,
        ))
    }

    /// Turn an assembled context into a recommendation.
    ///
    /// Enforces the request timeout and the maximum output length. On
    /// timeout or backend failure this is a generation error — never a
    /// silent empty response. Dropping the returned future abandons the
    /// in-flight backend call.
    pub async fn generate(
        &self,
        context: &GenerationContext,
    ) -> Result<Recommendation, AssistError> {
        let prompt = build_prompt(context);

        let text = match timeout(
            self.timeout,
            self.backend.complete(context, &prompt, self.max_output_chars),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(AssistError::Generation(format!(
                    "backend '{}' timed out after {:?}",
                    self.backend.name(),
                    self.timeout
                )))
            }
        };

        if text.trim().is_empty() {
            return Err(AssistError::Generation(format!(
                "backend '{}' returned an empty completion",
                self.backend.name()
            )));
        }

        let text: String = text.chars().take(self.max_output_chars).collect();

        let provenance: Vec<String> = context
            .hits
            .iter()
            .map(|h| h.record.event_id.clone())
            .collect();
        let confidence = context.hits.first().map(|h| h.similarity);

        Ok(Recommendation {
            dedup_key: dedup_key(&provenance, &context.query_text),
            text,
            provenance,
            confidence,
        })
    }
}

/// Stable key over the evidence set; the event pipeline overrides this
/// with an event_id-derived key before dispatch.
fn dedup_key(provenance: &[String], query_text: &str) -> String {
    let mut sorted: Vec<&String> = provenance.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    if provenance.is_empty() {
        hasher.update(query_text.as_bytes());
    }
    format!("rec-{}", hex::encode(&hasher.finalize()[..8]))
}

/// Render the bounded context into the prompt handed to the backend.
pub fn build_prompt(context: &GenerationContext) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are an operations incident assistant. Using only the evidence below, \
         recommend concrete remediation steps for the current situation.\n\n",
    );
    prompt.push_str(&format!("Current situation: {}\n\n", context.query_text));

    if context.hits.is_empty() {
        prompt.push_str("No similar historical incidents were found.\n");
    } else {
        prompt.push_str("Similar past incidents:\n");
        for (i, hit) in context.hits.iter().enumerate() {
            prompt.push_str(&format!(
                "{}. [{}] (similarity {:.2}) {}\n",
                i + 1,
                hit.record.event_id,
                hit.similarity,
                hit.record.raw_text
            ));
            if let Some(resolution) = hit.record.metadata.get("resolution") {
                prompt.push_str(&format!("   resolution: {}\n", resolution));
            }
        }
    }

    match &context.signals {
        SignalState::Present(map) => {
            prompt.push_str("\nLive cluster signals:\n");
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                prompt.push_str(&format!("  {}: {}\n", key, map[key]));
            }
        }
        SignalState::Degraded(reason) => {
            prompt.push_str(&format!(
                "\nLive cluster signals are unavailable ({}); rely on historical evidence.\n",
                reason
            ));
        }
        SignalState::Skipped => {}
    }

    prompt
}

// ============ Template Backend ============

/// Deterministic offline composer. No model call: summarizes the top
/// evidence and its recorded resolutions. Used in tests and air-gapped
/// deployments.
pub struct TemplateBackend;

#[async_trait]
impl GenerationBackend for TemplateBackend {
    fn name(&self) -> &str {
        "template"
    }

    async fn complete(
        &self,
        context: &GenerationContext,
        _prompt: &str,
        _max_chars: usize,
    ) -> Result<String, AssistError> {
        let mut out = String::new();

        if context.hits.is_empty() {
            out.push_str(
                "No similar historical incidents were found for this situation. \
                 Treat it as novel: capture diagnostics and escalate to the on-call lead.",
            );
        } else {
            out.push_str(&format!(
                "Found {} similar past incident(s). Closest match {} (similarity {:.2}): \"{}\".",
                context.hits.len(),
                context.hits[0].record.event_id,
                context.hits[0].similarity,
                context.hits[0].record.raw_text
            ));
            match context.hits[0].record.metadata.get("resolution") {
                Some(resolution) => {
                    out.push_str(&format!(" It was resolved by: {}.", resolution));
                }
                None => {
                    out.push_str(" No resolution was recorded for it; review its timeline.");
                }
            }
        }

        match &context.signals {
            SignalState::Present(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let summary: Vec<String> =
                    keys.iter().map(|k| format!("{}={}", k, map[*k])).collect();
                out.push_str(&format!(" Current signals: {}.", summary.join(", ")));
            }
            SignalState::Degraded(_) => {
                out.push_str(" Live cluster signals were unavailable for this answer.");
            }
            SignalState::Skipped => {}
        }

        Ok(out)
    }
}

// ============ Local Backend (Ollama) ============

/// Locally hosted model via Ollama's `POST /api/generate`.
pub struct OllamaBackend {
    model: String,
    url: String,
}

impl OllamaBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self, AssistError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| AssistError::Config("generation.model required for local backend".into()))?;
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
        })
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn complete(
        &self,
        _context: &GenerationContext,
        prompt: &str,
        max_chars: usize,
    ) -> Result<String, AssistError> {
        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "num_predict": (max_chars / 4) as i64 },
        });

        let response = client
            .post(format!("{}/api/generate", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AssistError::Generation(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(AssistError::Generation(format!(
                "Ollama API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AssistError::Generation(e.to_string()))?;

        json.get("response")
            .and_then(|r| r.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| AssistError::Generation("Ollama response missing 'response'".into()))
    }
}

// ============ Remote Backend (OpenAI-compatible) ============

/// Remote model via an OpenAI-compatible chat completions API. Requires
/// the `OPENAI_API_KEY` environment variable.
pub struct OpenAiBackend {
    model: String,
    url: String,
}

impl OpenAiBackend {
    pub fn new(config: &GenerationConfig) -> Result<Self, AssistError> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| AssistError::Config("generation.model required for remote backend".into()))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(AssistError::Config(
                "OPENAI_API_KEY environment variable not set".into(),
            ));
        }
        Ok(Self {
            model,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn complete(
        &self,
        _context: &GenerationContext,
        prompt: &str,
        max_chars: usize,
    ) -> Result<String, AssistError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AssistError::Config("OPENAI_API_KEY not set".into()))?;

        let client = reqwest::Client::new();
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": prompt }
            ],
            "max_tokens": (max_chars / 4) as i64,
        });

        let response = client
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| AssistError::Generation(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(AssistError::Generation(format!(
                "completions API error {}: {}",
                status, body_text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AssistError::Generation(e.to_string()))?;

        json.get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                AssistError::Generation("completions response missing message content".into())
            })
    }
}

pub fn create_backend(
    config: &GenerationConfig,
) -> Result<Box<dyn GenerationBackend>, AssistError> {
    match config.backend.as_str() {
        "template" => Ok(Box::new(TemplateBackend)),
        "local" => Ok(Box::new(OllamaBackend::new(config)?)),
        "remote" => Ok(Box::new(OpenAiBackend::new(config)?)),
        other => Err(AssistError::Config(format!(
            "Unknown generation backend: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IncidentRecord, RetrievedIncident};
    use std::collections::HashMap;

    fn context_with(hits: Vec<RetrievedIncident>) -> GenerationContext {
        GenerationContext {
            query_text: "disk full on node-3".to_string(),
            hits,
            signals: SignalState::Skipped,
            token_budget: 2048,
        }
    }

    fn hit(event_id: &str, text: &str, similarity: f32) -> RetrievedIncident {
        RetrievedIncident {
            record: IncidentRecord {
                event_id: event_id.to_string(),
                raw_text: text.to_string(),
                metadata: HashMap::from([(
                    "resolution".to_string(),
                    "expanded the volume".to_string(),
                )]),
                created_at: 0,
                embedding: Vec::new(),
            },
            similarity,
        }
    }

    fn generator(backend: Box<dyn GenerationBackend>) -> ResponseGenerator {
        ResponseGenerator::new(backend, Duration::from_secs(5), 2000)
    }

    #[tokio::test]
    async fn test_provenance_is_subset_of_context() {
        let ctx = context_with(vec![
            hit("evt-1", "disk full on node-3", 0.92),
            hit("evt-2", "disk pressure on node-9", 0.71),
        ]);
        let rec = generator(Box::new(TemplateBackend))
            .generate(&ctx)
            .await
            .unwrap();
        assert_eq!(rec.provenance, vec!["evt-1", "evt-2"]);
        assert_eq!(rec.confidence, Some(0.92));
    }

    #[tokio::test]
    async fn test_template_cites_resolution() {
        let ctx = context_with(vec![hit("evt-1", "disk full on node-3", 0.92)]);
        let rec = generator(Box::new(TemplateBackend))
            .generate(&ctx)
            .await
            .unwrap();
        assert!(rec.text.contains("expanded the volume"));
        assert!(rec.text.contains("evt-1"));
    }

    #[tokio::test]
    async fn test_empty_context_still_answers() {
        let ctx = context_with(vec![]);
        let rec = generator(Box::new(TemplateBackend))
            .generate(&ctx)
            .await
            .unwrap();
        assert!(rec.provenance.is_empty());
        assert!(rec.confidence.is_none());
        assert!(rec.text.contains("novel"));
    }

    struct SlowBackend;

    #[async_trait]
    impl GenerationBackend for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }
        async fn complete(
            &self,
            _context: &GenerationContext,
            _prompt: &str,
            _max_chars: usize,
        ) -> Result<String, AssistError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn test_timeout_is_generation_error() {
        let generator =
            ResponseGenerator::new(Box::new(SlowBackend), Duration::from_millis(20), 2000);
        let err = generator.generate(&context_with(vec![])).await.unwrap_err();
        assert_eq!(err.category(), "generation");
        assert!(err.to_string().contains("timed out"));
    }

    struct EmptyBackend;

    #[async_trait]
    impl GenerationBackend for EmptyBackend {
        fn name(&self) -> &str {
            "empty"
        }
        async fn complete(
            &self,
            _context: &GenerationContext,
            _prompt: &str,
            _max_chars: usize,
        ) -> Result<String, AssistError> {
            Ok("   ".to_string())
        }
    }

    #[tokio::test]
    async fn test_empty_completion_is_generation_error() {
        let err = generator(Box::new(EmptyBackend))
            .generate(&context_with(vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "generation");
    }

    struct VerboseBackend;

    #[async_trait]
    impl GenerationBackend for VerboseBackend {
        fn name(&self) -> &str {
            "verbose"
        }
        async fn complete(
            &self,
            _context: &GenerationContext,
            _prompt: &str,
            _max_chars: usize,
        ) -> Result<String, AssistError> {
            Ok("z".repeat(10_000))
        }
    }

    #[tokio::test]
    async fn test_output_length_enforced() {
        let generator =
            ResponseGenerator::new(Box::new(VerboseBackend), Duration::from_secs(5), 100);
        let rec = generator.generate(&context_with(vec![])).await.unwrap();
        assert_eq!(rec.text.chars().count(), 100);
    }

    #[test]
    fn test_prompt_includes_degraded_notice() {
        let mut ctx = context_with(vec![hit("evt-1", "disk full on node-3", 0.9)]);
        ctx.signals = SignalState::Degraded("cluster API unreachable".to_string());
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("unavailable"));
        assert!(prompt.contains("evt-1"));
    }

    #[test]
    fn test_dedup_key_order_independent() {
        let a = dedup_key(&["evt-1".into(), "evt-2".into()], "q");
        let b = dedup_key(&["evt-2".into(), "evt-1".into()], "q");
        assert_eq!(a, b);
    }
}
