//! Anomaly scoring over raw events.
//!
//! The predictive model is consumed as an opaque scoring function behind
//! [`AnomalyScorer`]: feature extraction is the caller's concern, and the
//! core never retries a failed score.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::ScorerConfig;
use crate::error::AssistError;
use crate::models::RawEvent;

/// Produces a risk score in `[0, 1]` for a raw event.
#[async_trait]
pub trait AnomalyScorer: Send + Sync {
    fn name(&self) -> &str;
    /// Fails with a scoring error on malformed input; never retries.
    async fn score(&self, event: &RawEvent) -> Result<f32, AssistError>;
}

// ============ Heuristic Scorer ============

/// In-process keyword scorer used when no model endpoint is configured.
///
/// Weights security- and saturation-flavored terms in the payload and
/// clamps to `[0, 1]`. Crude, but deterministic and dependency-free.
pub struct HeuristicScorer;

const RISK_TERMS: &[(&str, f32)] = &[
    ("denied", 0.25),
    ("unauthorized", 0.35),
    ("brute force", 0.45),
    ("port scan", 0.4),
    ("exfiltration", 0.6),
    ("malware", 0.6),
    ("critical", 0.3),
    ("failed login", 0.3),
    ("disk full", 0.3),
    ("oom", 0.3),
    ("crashloop", 0.3),
    ("timeout", 0.15),
    ("error", 0.1),
];

#[async_trait]
impl AnomalyScorer for HeuristicScorer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn score(&self, event: &RawEvent) -> Result<f32, AssistError> {
        if event.payload.trim().is_empty() {
            return Err(AssistError::Scoring("event payload is empty".to_string()));
        }

        let text = event.payload.to_lowercase();
        let mut risk = 0.0f32;
        for (term, weight) in RISK_TERMS {
            if text.contains(term) {
                risk += weight;
            }
        }
        Ok(risk.clamp(0.0, 1.0))
    }
}

// ============ Remote Scorer ============

/// Scorer backed by an HTTP model endpoint.
///
/// Sends the raw event as JSON and expects `{"risk": <float>}` back.
/// Out-of-range model output is treated as malformed, not clamped
/// silently.
pub struct RemoteScorer {
    url: String,
    timeout_secs: u64,
}

impl RemoteScorer {
    pub fn new(config: &ScorerConfig) -> Result<Self, AssistError> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| AssistError::Config("scorer.url required for remote backend".into()))?;
        Ok(Self {
            url,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl AnomalyScorer for RemoteScorer {
    fn name(&self) -> &str {
        "remote"
    }

    async fn score(&self, event: &RawEvent) -> Result<f32, AssistError> {
        if event.payload.trim().is_empty() {
            return Err(AssistError::Scoring("event payload is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| AssistError::Scoring(e.to_string()))?;

        let response = client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| AssistError::Scoring(format!("model endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AssistError::Scoring(format!(
                "model endpoint error {}: {}",
                status, body
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AssistError::Scoring(e.to_string()))?;

        let risk = json
            .get("risk")
            .and_then(|r| r.as_f64())
            .ok_or_else(|| AssistError::Scoring("response missing 'risk' field".into()))?
            as f32;

        if !(0.0..=1.0).contains(&risk) {
            return Err(AssistError::Scoring(format!(
                "model returned risk {} outside [0, 1]",
                risk
            )));
        }
        Ok(risk)
    }
}

pub fn create_scorer(config: &ScorerConfig) -> Result<Box<dyn AnomalyScorer>, AssistError> {
    match config.backend.as_str() {
        "heuristic" => Ok(Box::new(HeuristicScorer)),
        "remote" => Ok(Box::new(RemoteScorer::new(config)?)),
        other => Err(AssistError::Config(format!(
            "Unknown scorer backend: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(payload: &str) -> RawEvent {
        RawEvent {
            source: "ids".to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now(),
            event_id: None,
        }
    }

    #[tokio::test]
    async fn test_heuristic_score_in_unit_interval() {
        let scorer = HeuristicScorer;
        let risk = scorer
            .score(&event(
                "critical: brute force, unauthorized access, malware, exfiltration detected",
            ))
            .await
            .unwrap();
        assert!((0.0..=1.0).contains(&risk));
        assert_eq!(risk, 1.0);
    }

    #[tokio::test]
    async fn test_heuristic_benign_scores_low() {
        let scorer = HeuristicScorer;
        let risk = scorer
            .score(&event("routine certificate rotation completed"))
            .await
            .unwrap();
        assert_eq!(risk, 0.0);
    }

    #[tokio::test]
    async fn test_heuristic_ranks_risky_above_benign() {
        let scorer = HeuristicScorer;
        let risky = scorer
            .score(&event("port scan followed by failed login burst"))
            .await
            .unwrap();
        let benign = scorer.score(&event("deploy finished")).await.unwrap();
        assert!(risky > benign);
    }

    #[tokio::test]
    async fn test_empty_payload_is_scoring_error() {
        let scorer = HeuristicScorer;
        let err = scorer.score(&event("  ")).await.unwrap_err();
        assert_eq!(err.category(), "scoring");
    }
}
