//! Context assembly: turn a query into a bounded generation context.
//!
//! The assembler embeds the query, retrieves the top-k similar incidents,
//! optionally cross-references live cluster signals, and trims everything
//! to the configured token budget. Cluster failure degrades the context;
//! embedding or retrieval failure fails the assembly.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cluster::ClusterStateAdapter;
use crate::embedding::EmbeddingEncoder;
use crate::error::AssistError;
use crate::models::{GenerationContext, Query, RetrievedIncident, SignalState};
use crate::store::IncidentStore;

/// Rough token estimate: four characters per token. Good enough for a
/// budget that is itself approximate.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count() / 4 + 1
}

pub struct ContextAssembler {
    encoder: Arc<dyn EmbeddingEncoder>,
    store: Arc<IncidentStore>,
    cluster: Arc<dyn ClusterStateAdapter>,
    k: usize,
    min_similarity: f32,
    token_budget: usize,
}

impl ContextAssembler {
    pub fn new(
        encoder: Arc<dyn EmbeddingEncoder>,
        store: Arc<IncidentStore>,
        cluster: Arc<dyn ClusterStateAdapter>,
        k: usize,
        min_similarity: f32,
        token_budget: usize,
    ) -> Self {
        Self {
            encoder,
            store,
            cluster,
            k,
            min_similarity,
            token_budget,
        }
    }

    /// Build a generation context for a query, optionally cross-referencing
    /// a live resource.
    ///
    /// Fails with an assembly error only when embedding or retrieval
    /// itself fails; a cluster-adapter failure is logged and the context
    /// is tagged degraded instead.
    pub async fn assemble(
        &self,
        query: &Query,
        resource: Option<&str>,
    ) -> Result<GenerationContext, AssistError> {
        let embedding = self
            .encoder
            .encode(&query.text)
            .await
            .map_err(|e| AssistError::Assembly(format!("query embedding failed: {}", e)))?;

        let mut retrieval = self
            .store
            .query(&embedding, self.k, Some(query))
            .await
            .map_err(|e| AssistError::Assembly(format!("retrieval failed: {}", e)))?;

        // Low-relevance evidence is worse than none: it steers the
        // generator toward unrelated incidents.
        retrieval
            .hits
            .retain(|h| h.similarity >= self.min_similarity);

        let signals = match resource {
            None => SignalState::Skipped,
            Some(r) => match self.cluster.get_signals(r).await {
                Ok(map) => SignalState::Present(map),
                Err(e) => {
                    warn!(resource = r, error = %e, "cluster signals unavailable, degrading");
                    SignalState::Degraded(e.to_string())
                }
            },
        };

        let overhead = approx_tokens(&query.text) + signals_cost(&signals);
        let hits = trim_to_budget(retrieval.hits, self.token_budget, overhead);
        debug!(hits = hits.len(), budget = self.token_budget, "context assembled");

        Ok(GenerationContext {
            query_text: query.text.clone(),
            hits,
            signals,
            token_budget: self.token_budget,
        })
    }
}

fn signals_cost(signals: &SignalState) -> usize {
    match signals {
        SignalState::Present(map) => map
            .iter()
            .map(|(k, v)| approx_tokens(k) + approx_tokens(v))
            .sum(),
        SignalState::Degraded(reason) => approx_tokens(reason),
        SignalState::Skipped => 0,
    }
}

/// Fit retrieved incidents into the remaining budget.
///
/// Incidents are admitted in rank order while they fit whole; the first
/// one that does not fit is dropped along with everything ranked below
/// it. Only when the top-ranked incident alone exceeds the budget is its
/// text shortened — partial truncation is never spread across items.
pub fn trim_to_budget(
    hits: Vec<RetrievedIncident>,
    token_budget: usize,
    overhead: usize,
) -> Vec<RetrievedIncident> {
    let mut remaining = token_budget.saturating_sub(overhead);
    let mut kept = Vec::new();

    for (rank, mut hit) in hits.into_iter().enumerate() {
        let cost = approx_tokens(&hit.record.raw_text);
        if cost <= remaining {
            remaining -= cost;
            kept.push(hit);
            continue;
        }
        if rank == 0 && remaining > 0 {
            // Highest-ranked evidence is worth keeping even shortened.
            let max_chars = remaining * 4;
            hit.record.raw_text = hit
                .record
                .raw_text
                .chars()
                .take(max_chars)
                .collect();
            kept.push(hit);
        }
        break;
    }

    kept
}
