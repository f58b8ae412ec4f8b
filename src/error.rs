//! Error taxonomy for the triage pipeline.
//!
//! Collaborator unavailability ([`AssistError::Unavailable`]) is recovered
//! locally by the context assembler; everything else propagates to the
//! caller. The core never retries — retry policy belongs to callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssistError {
    /// Bad input to the embedding encoder, or the encoder backend failed.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Retrieval was attempted against an index with zero entries.
    #[error("vector index is empty")]
    IndexEmpty,

    /// The referenced incident does not exist.
    #[error("no incident with event_id '{0}'")]
    NotFound(String),

    /// The anomaly scorer rejected the event or its backend failed.
    #[error("scoring failed: {0}")]
    Scoring(String),

    /// Embedding or retrieval failed while building a generation context.
    #[error("context assembly failed: {0}")]
    Assembly(String),

    /// The generation backend failed, returned nothing, or timed out.
    #[error("generation failed: {0}")]
    Generation(String),

    /// An external collaborator (cluster adapter, chat transport) is
    /// unreachable.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl AssistError {
    /// Stable machine-readable category, used in HTTP error bodies and in
    /// user-facing failure notices.
    pub fn category(&self) -> &'static str {
        match self {
            AssistError::Encoding(_) => "encoding",
            AssistError::IndexEmpty => "index_empty",
            AssistError::NotFound(_) => "not_found",
            AssistError::Scoring(_) => "scoring",
            AssistError::Assembly(_) => "assembly",
            AssistError::Generation(_) => "generation",
            AssistError::Unavailable(_) => "unavailable",
            AssistError::Config(_) => "config",
            AssistError::Store(_) => "store",
        }
    }
}

pub type Result<T, E = AssistError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_are_stable() {
        assert_eq!(AssistError::IndexEmpty.category(), "index_empty");
        assert_eq!(
            AssistError::NotFound("evt-1".into()).category(),
            "not_found"
        );
        assert_eq!(
            AssistError::Generation("timed out".into()).category(),
            "generation"
        );
    }
}
