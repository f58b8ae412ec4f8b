//! Core data types that flow through the triage pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Raw event as handed over by the ingestion layer.
///
/// The structure is owned by that layer; the core only needs a stable way
/// to derive an `event_id` and the text used for embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub source: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    /// Caller-assigned id. When absent, a content-derived id is used.
    #[serde(default)]
    pub event_id: Option<String>,
}

impl RawEvent {
    /// Resolve the globally unique event id: the caller-assigned one if
    /// present, otherwise `evt-` plus a digest over source, timestamp,
    /// and payload so that re-submissions of the same event collide.
    pub fn resolve_event_id(&self) -> String {
        if let Some(id) = &self.event_id {
            return id.clone();
        }
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update(self.timestamp.timestamp().to_le_bytes());
        hasher.update(self.payload.as_bytes());
        let digest = hasher.finalize();
        format!("evt-{}", hex::encode(&digest[..8]))
    }

    /// Text used for embedding and storage.
    pub fn text(&self) -> &str {
        &self.payload
    }
}

/// Free-text operator input plus sender/channel references.
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorMessage {
    pub text: String,
    pub sender: String,
    pub channel: String,
}

/// An incident persisted in the store. Exactly one record exists per
/// `event_id`; the id is immutable once assigned.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentRecord {
    pub event_id: String,
    pub raw_text: String,
    /// Source, severity, resolution notes, and similar annotations.
    pub metadata: HashMap<String, String>,
    /// Epoch seconds.
    pub created_at: i64,
    /// Embedding under the store's current model. Omitted from JSON output.
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// Transient retrieval request. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub text: String,
    /// Only records created at or after this epoch second.
    pub since: Option<i64>,
    pub severity: Option<String>,
}

impl Query {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// One retrieval hit: an incident plus its similarity to the query.
#[derive(Debug, Clone)]
pub struct RetrievedIncident {
    pub record: IncidentRecord,
    pub similarity: f32,
}

/// Ordered retrieval output: at most `k` hits, similarity non-increasing,
/// ties broken by more-recent `created_at` first.
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievedIncident>,
}

impl RetrievalResult {
    pub fn top_similarity(&self) -> Option<f32> {
        self.hits.first().map(|h| h.similarity)
    }

    pub fn event_ids(&self) -> Vec<String> {
        self.hits
            .iter()
            .map(|h| h.record.event_id.clone())
            .collect()
    }
}

/// Outcome of the live cluster-state lookup. Consumers must handle the
/// degraded branch explicitly; there is no null in this pipeline.
#[derive(Debug, Clone)]
pub enum SignalState {
    /// Signals were fetched for the referenced resource.
    Present(HashMap<String, String>),
    /// The adapter failed; the pipeline continued without live signals.
    Degraded(String),
    /// The query referenced no live resource, so no lookup was attempted.
    Skipped,
}

impl SignalState {
    pub fn is_present(&self) -> bool {
        matches!(self, SignalState::Present(_))
    }
}

/// Ephemeral aggregate handed to the response generator. Built per request
/// and discarded after one generation call; never cached, since both
/// retrieval and cluster state can change between calls.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    pub query_text: String,
    /// Hits that survived budget trimming, still in rank order.
    pub hits: Vec<RetrievedIncident>,
    pub signals: SignalState,
    pub token_budget: usize,
}

/// Generated remediation guidance plus the evidence it was grounded on.
#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
    pub text: String,
    /// The event ids of incidents that were present in the final prompt.
    pub provenance: Vec<String>,
    /// Derived from the top retrieval similarity, when any evidence exists.
    pub confidence: Option<f32>,
    /// Stable key the dispatcher uses for cooldown deduplication.
    pub dedup_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(source: &str, payload: &str, ts: i64) -> RawEvent {
        RawEvent {
            source: source.to_string(),
            payload: payload.to_string(),
            timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
            event_id: None,
        }
    }

    #[test]
    fn test_derived_event_id_is_stable() {
        let a = event("ids", "port scan from 10.0.0.9", 1700000000);
        let b = event("ids", "port scan from 10.0.0.9", 1700000000);
        assert_eq!(a.resolve_event_id(), b.resolve_event_id());
        assert!(a.resolve_event_id().starts_with("evt-"));
    }

    #[test]
    fn test_derived_event_id_varies_with_content() {
        let a = event("ids", "port scan from 10.0.0.9", 1700000000);
        let b = event("ids", "port scan from 10.0.0.10", 1700000000);
        assert_ne!(a.resolve_event_id(), b.resolve_event_id());
    }

    #[test]
    fn test_explicit_event_id_wins() {
        let mut e = event("ids", "disk full on node-3", 1700000000);
        e.event_id = Some("evt-1".to_string());
        assert_eq!(e.resolve_event_id(), "evt-1");
    }
}
