//! In-memory vector index derived from the incident store.
//!
//! The index holds one entry per `event_id` and answers k-nearest-neighbor
//! queries under the metric fixed at construction time. It is a derived
//! structure: the store is the source of truth, and the index can always
//! be rebuilt by replaying store records through the encoder.

use crate::embedding::{cosine_similarity, inner_product};
use crate::error::AssistError;

/// Similarity metric, fixed when the index is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cosine,
    InnerProduct,
}

impl Metric {
    pub fn parse(s: &str) -> Result<Self, AssistError> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "inner_product" => Ok(Metric::InnerProduct),
            other => Err(AssistError::Config(format!(
                "Unknown similarity metric: {}",
                other
            ))),
        }
    }

    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Cosine => cosine_similarity(a, b),
            Metric::InnerProduct => inner_product(a, b),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    event_id: String,
    vector: Vec<f32>,
    created_at: i64,
}

/// A scored index hit, resolved to full records by the store.
#[derive(Debug, Clone)]
pub struct IndexHit {
    pub event_id: String,
    pub score: f32,
    pub created_at: i64,
}

pub struct VectorIndex {
    metric: Metric,
    entries: Vec<Entry>,
}

impl VectorIndex {
    pub fn new(metric: Metric) -> Self {
        Self {
            metric,
            entries: Vec::new(),
        }
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an entry. A duplicate `event_id` is ignored; idempotent
    /// ingestion is decided by the store before the index is touched.
    pub fn insert(&mut self, event_id: String, vector: Vec<f32>, created_at: i64) {
        if self.entries.iter().any(|e| e.event_id == event_id) {
            return;
        }
        self.entries.push(Entry {
            event_id,
            vector,
            created_at,
        });
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&mut self, event_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.event_id != event_id);
        self.entries.len() != before
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.entries.iter().any(|e| e.event_id == event_id)
    }

    /// Return up to `k` nearest entries by the fixed metric.
    ///
    /// Scores are non-increasing; equal scores are ordered by more-recent
    /// `created_at` first, then by `event_id` for a fully deterministic
    /// order. Fewer than `k` entries is not an error; zero entries is.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<IndexHit>, AssistError> {
        if self.entries.is_empty() {
            return Err(AssistError::IndexEmpty);
        }

        let mut hits: Vec<IndexHit> = self
            .entries
            .iter()
            .map(|e| IndexHit {
                event_id: e.event_id.clone(),
                score: self.metric.score(query, &e.vector),
                created_at: e.created_at,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then(a.event_id.cmp(&b.event_id))
        });

        hits.truncate(k);
        Ok(hits)
    }
}
