//! The assistant: process-wide state plus the two entry flows.
//!
//! [`Assistant`] bundles the encoder, store, scorer, intent parser,
//! assembler, generator, and notifier into one explicitly constructed
//! object handed to request handlers. Raw events flow through
//! [`Assistant::handle_event`]; operator messages through
//! [`Assistant::handle_message`]. Each request is processed independently;
//! the store/index pair is the only shared mutable state.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::cluster::{create_adapter, ClusterStateAdapter};
use crate::config::Config;
use crate::context::ContextAssembler;
use crate::db;
use crate::embedding::{create_encoder, EmbeddingEncoder};
use crate::error::AssistError;
use crate::generate::ResponseGenerator;
use crate::index::Metric;
use crate::intent::{Intent, IntentParser};
use crate::migrate;
use crate::models::{OperatorMessage, Query, RawEvent, Recommendation, RetrievalResult};
use crate::notify::{Delivery, Notifier};
use crate::scorer::{create_scorer, AnomalyScorer};
use crate::store::{ConsistencyReport, IncidentStore};

/// What happened to one inbound raw event.
#[derive(Debug, Serialize)]
pub struct EventReport {
    pub event_id: String,
    pub risk: f32,
    /// Whether the auto-ingest policy wrote the event to the store.
    pub ingested: bool,
    pub recommendation: Recommendation,
    pub delivered: bool,
}

/// Reply to one operator message.
#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub intent: &'static str,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub low_confidence: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub incidents: i64,
    pub indexed: usize,
    pub embedding_model: String,
    pub metric: String,
    pub generation_backend: String,
    pub consistent: bool,
    pub consistency: ConsistencyReport,
}

pub struct Assistant {
    config: Config,
    encoder: Arc<dyn EmbeddingEncoder>,
    store: Arc<IncidentStore>,
    scorer: Box<dyn AnomalyScorer>,
    intent: IntentParser,
    cluster: Arc<dyn ClusterStateAdapter>,
    assembler: ContextAssembler,
    generator: ResponseGenerator,
    notifier: Notifier,
}

impl Assistant {
    /// Construct the full pipeline from configuration: connect the store,
    /// verify store/index consistency, and wire every backend. Called once
    /// at startup; the result is shared across request handlers.
    pub async fn initialize(config: Config) -> anyhow::Result<(Self, ConsistencyReport)> {
        let pool = db::connect(&config.db.path).await?;
        migrate::run_migrations(&pool).await?;

        let metric = Metric::parse(&config.index.metric)?;
        let (store, report) = IncidentStore::open(pool, metric).await?;
        let store = Arc::new(store);

        let encoder: Arc<dyn EmbeddingEncoder> =
            Arc::from(create_encoder(&config.embedding)?);
        let cluster: Arc<dyn ClusterStateAdapter> =
            Arc::from(create_adapter(config.cluster.as_ref()));
        let scorer = create_scorer(&config.scorer)?;
        let generator = ResponseGenerator::from_config(&config.generation)?;
        let notifier = Notifier::from_config(&config.notify);
        let intent = IntentParser::new(config.intent.confidence_threshold);

        let assembler = ContextAssembler::new(
            encoder.clone(),
            store.clone(),
            cluster.clone(),
            config.retrieval.k,
            config.retrieval.min_similarity,
            config.context.token_budget,
        );

        Ok((
            Self {
                config,
                encoder,
                store,
                scorer,
                intent,
                cluster,
                assembler,
                generator,
                notifier,
            },
            report,
        ))
    }

    pub fn store(&self) -> &IncidentStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Write an incident into the store, deriving its id and embedding.
    /// Returns `(event_id, newly_created)`.
    pub async fn ingest(
        &self,
        event: &RawEvent,
        extra_metadata: &HashMap<String, String>,
    ) -> Result<(String, bool), AssistError> {
        let event_id = event.resolve_event_id();
        let embedding = self.encoder.encode(event.text()).await?;

        let mut metadata = extra_metadata.clone();
        metadata.insert("source".to_string(), event.source.clone());
        metadata.insert("timestamp".to_string(), event.timestamp.to_rfc3339());

        let created = self
            .store
            .upsert(
                &event_id,
                &embedding,
                event.text(),
                &metadata,
                event.timestamp.timestamp(),
                self.encoder.model_name(),
            )
            .await?;
        Ok((event_id, created))
    }

    /// Full event flow: score, optionally auto-ingest, correlate against
    /// history, generate a recommendation, and deliver it.
    ///
    /// Ingestion is all-or-nothing per event id and happens before
    /// generation, so a generation failure never loses the event. The
    /// dedup key handed to the dispatcher is derived from the event id,
    /// which makes re-deliveries of the same event suppressible.
    pub async fn handle_event(&self, event: &RawEvent) -> Result<EventReport, AssistError> {
        let event_id = event.resolve_event_id();
        let risk = self.scorer.score(event).await?;
        info!(event_id = %event_id, risk = risk, source = %event.source, "event scored");

        let ingested = match self.config.policy.auto_ingest_risk_threshold {
            Some(threshold) if risk >= threshold => {
                let metadata = HashMap::from([("risk".to_string(), format!("{:.2}", risk))]);
                self.ingest(event, &metadata).await?.1
            }
            _ => false,
        };

        let query = Query::from_text(event.text());
        let resource = crate::intent::extract_entities(event.text())
            .get("resource")
            .cloned();
        let context = self.assembler.assemble(&query, resource.as_deref()).await?;

        let mut recommendation = self.generator.generate(&context).await?;
        recommendation.dedup_key = format!("rec-{}", event_id);

        let delivery = self.notifier.notify_recommendation(&recommendation).await?;

        Ok(EventReport {
            event_id,
            risk,
            ingested,
            recommendation,
            delivered: delivery == Delivery::Sent,
        })
    }

    /// Full chat flow: parse intent, branch, answer.
    ///
    /// Unknown intent gets a help reply, never an error. Generation and
    /// retrieval failures propagate; the caller turns them into an
    /// explicit "could not generate" signal with the error category.
    pub async fn handle_message(
        &self,
        message: &OperatorMessage,
    ) -> Result<ChatReply, AssistError> {
        let parsed = self.intent.parse(&message.text);
        info!(
            intent = parsed.intent.as_str(),
            confidence = parsed.confidence,
            sender = %message.sender,
            "message parsed"
        );
        let resource = parsed.entities.get("resource").cloned();

        match parsed.intent {
            Intent::Remediation => {
                let query = Query {
                    text: message.text.clone(),
                    since: None,
                    severity: parsed.entities.get("severity").cloned(),
                };
                let context = self.assembler.assemble(&query, resource.as_deref()).await?;
                let recommendation = self.generator.generate(&context).await?;
                Ok(ChatReply {
                    intent: parsed.intent.as_str(),
                    text: crate::notify::format_recommendation(&recommendation),
                    provenance: recommendation.provenance,
                    confidence: recommendation.confidence,
                    low_confidence: parsed.low_confidence,
                })
            }
            Intent::IncidentLookup => {
                let result = self.search(&message.text, parsed.entities.get("severity").cloned()).await?;
                Ok(ChatReply {
                    intent: parsed.intent.as_str(),
                    text: format_lookup(&result),
                    provenance: result.event_ids(),
                    confidence: result.top_similarity(),
                    low_confidence: parsed.low_confidence,
                })
            }
            Intent::ClusterStatus => {
                // Status is answered straight from the adapter: no
                // retrieval, so it works before any incident is ingested.
                let text = match resource.as_deref() {
                    None => "Name a resource (for example node-3) and I will look up its status."
                        .to_string(),
                    Some(r) => match self.cluster.get_signals(r).await {
                        Ok(map) => {
                            let mut keys: Vec<&String> = map.keys().collect();
                            keys.sort();
                            let lines: Vec<String> =
                                keys.iter().map(|k| format!("{}: {}", k, map[*k])).collect();
                            format!("Current signals for {}:\n{}", r, lines.join("\n"))
                        }
                        Err(e) => format!(
                            "Could not reach the cluster for live signals ({}).",
                            e
                        ),
                    },
                };
                Ok(ChatReply {
                    intent: parsed.intent.as_str(),
                    text,
                    provenance: Vec::new(),
                    confidence: None,
                    low_confidence: parsed.low_confidence,
                })
            }
            Intent::Unknown => Ok(ChatReply {
                intent: parsed.intent.as_str(),
                text: "I can recommend remediations (\"how do I fix ...\"), look up similar \
                       past incidents (\"show me incidents like ...\"), or report live \
                       status (\"what is the status of node-3\")."
                    .to_string(),
                provenance: Vec::new(),
                confidence: None,
                low_confidence: parsed.low_confidence,
            }),
        }
    }

    /// Plain similarity search, used by the lookup intent and the CLI.
    pub async fn search(
        &self,
        text: &str,
        severity: Option<String>,
    ) -> Result<RetrievalResult, AssistError> {
        let embedding = self.encoder.encode(text).await?;
        let query = Query {
            text: text.to_string(),
            since: None,
            severity,
        };
        self.store
            .query(&embedding, self.config.retrieval.k, Some(&query))
            .await
    }

    pub async fn remove(&self, event_id: &str) -> Result<(), AssistError> {
        self.store.remove(event_id).await
    }

    pub async fn log_resolution(&self, event_id: &str, note: &str) -> Result<(), AssistError> {
        self.store.log_resolution(event_id, note).await
    }

    /// Replay every stored incident through the current encoder.
    pub async fn rebuild(&self) -> Result<usize, AssistError> {
        self.store.rebuild(self.encoder.as_ref()).await
    }

    pub async fn status(&self) -> Result<StatusReport, AssistError> {
        let consistency = self.store.check_consistency().await?;
        Ok(StatusReport {
            incidents: self.store.count().await?,
            indexed: self.store.index_len().await,
            embedding_model: self.encoder.model_name().to_string(),
            metric: self.config.index.metric.clone(),
            generation_backend: self.config.generation.backend.clone(),
            consistent: consistency.is_consistent(),
            consistency,
        })
    }

    /// Post an explicit failure notice to the chat channel. Used by the
    /// serving layer when a flow fails after the operator already asked.
    pub async fn notify_failure(&self, stage: &str, error: &AssistError) {
        let detail = format!("{} ({})", error, error.category());
        if let Err(e) = self.notifier.notify_failure(stage, &detail).await {
            tracing::warn!(error = %e, "failure notice could not be delivered");
        }
    }
}

fn format_lookup(result: &RetrievalResult) -> String {
    if result.hits.is_empty() {
        return "No similar past incidents found.".to_string();
    }
    let mut out = format!("{} similar past incident(s):\n", result.hits.len());
    for hit in &result.hits {
        out.push_str(&format!(
            "- [{}] (similarity {:.2}) {}\n",
            hit.record.event_id, hit.similarity, hit.record.raw_text
        ));
        if let Some(resolution) = hit.record.metadata.get("resolution") {
            out.push_str(&format!("  resolution: {}\n", resolution));
        }
    }
    out
}

/// Build a raw event from CLI arguments, stamping the current time when
/// none was given.
pub fn event_from_parts(
    source: &str,
    payload: &str,
    event_id: Option<String>,
) -> RawEvent {
    RawEvent {
        source: source.to_string(),
        payload: payload.to_string(),
        timestamp: Utc::now(),
        event_id,
    }
}
