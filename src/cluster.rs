//! Cluster state adapter — the orchestration platform seen through a
//! narrow contract.
//!
//! The core treats this strictly as an external collaborator: one call,
//! one timeout, and failures surface as `Unavailable`. Retry and backoff
//! belong inside adapter implementations, never in the core, which must
//! instead tolerate the failure and degrade (see the context assembler).

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::ClusterConfig;
use crate::error::AssistError;

#[async_trait]
pub trait ClusterStateAdapter: Send + Sync {
    /// Fetch current signals (metrics, resource status) for a resource.
    async fn get_signals(
        &self,
        resource: &str,
    ) -> Result<HashMap<String, String>, AssistError>;
}

/// Adapter for an HTTP status API
/// (`GET {base}/api/v1/resources/{resource}/status`, flat JSON object).
pub struct HttpClusterAdapter {
    base_url: String,
    timeout_secs: u64,
}

impl HttpClusterAdapter {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout_secs: config.timeout_secs,
        }
    }
}

#[async_trait]
impl ClusterStateAdapter for HttpClusterAdapter {
    async fn get_signals(
        &self,
        resource: &str,
    ) -> Result<HashMap<String, String>, AssistError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| AssistError::Unavailable(e.to_string()))?;

        let url = format!("{}/api/v1/resources/{}/status", self.base_url, resource);
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| AssistError::Unavailable(format!("cluster API unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssistError::Unavailable(format!(
                "cluster API returned {} for {}",
                status, resource
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AssistError::Unavailable(e.to_string()))?;

        let map = json
            .as_object()
            .ok_or_else(|| AssistError::Unavailable("cluster API returned non-object".into()))?
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect();

        Ok(map)
    }
}

/// Adapter used when no `[cluster]` section is configured: every lookup
/// reports the collaborator as unavailable, which the assembler degrades
/// past.
pub struct NullClusterAdapter;

#[async_trait]
impl ClusterStateAdapter for NullClusterAdapter {
    async fn get_signals(
        &self,
        _resource: &str,
    ) -> Result<HashMap<String, String>, AssistError> {
        Err(AssistError::Unavailable(
            "cluster adapter not configured".to_string(),
        ))
    }
}

pub fn create_adapter(config: Option<&ClusterConfig>) -> Box<dyn ClusterStateAdapter> {
    match config {
        Some(cfg) => Box::new(HttpClusterAdapter::new(cfg)),
        None => Box::new(NullClusterAdapter),
    }
}
