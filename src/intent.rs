//! Intent parsing for free-text operator input.
//!
//! Classifies a message into a closed intent set via keyword heuristics
//! and extracts entities (resource references, event ids, severities).
//! Unknown or low-confidence input maps to [`Intent::Unknown`] rather
//! than an error, so downstream logic always has a defined branch.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Closed intent set, versioned with the heuristics below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// "How do I fix X" — wants a remediation recommendation.
    Remediation,
    /// "What happened with X before" — wants similar past incidents.
    IncidentLookup,
    /// "Is node-3 healthy" — wants live cluster state.
    ClusterStatus,
    /// Sentinel for unmatched or low-confidence input.
    Unknown,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Remediation => "remediation",
            Intent::IncidentLookup => "incident_lookup",
            Intent::ClusterStatus => "cluster_status",
            Intent::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedIntent {
    pub intent: Intent,
    pub entities: HashMap<String, String>,
    pub confidence: f32,
    /// Set when the best score fell below the configured threshold.
    /// Entities are still returned.
    pub low_confidence: bool,
}

pub struct IntentParser {
    confidence_threshold: f32,
}

impl IntentParser {
    pub fn new(confidence_threshold: f32) -> Self {
        Self {
            confidence_threshold,
        }
    }

    pub fn parse(&self, text: &str) -> ParsedIntent {
        let q = text.to_lowercase();

        let mut remediation = 0.0f32;
        let mut lookup = 0.0f32;
        let mut status = 0.0f32;

        if starts_with_any(&q, &["how do i ", "how to ", "how can i ", "how should "]) {
            remediation += 0.6;
        }
        if contains_any(&q, &["fix", "remediate", "resolve", "mitigate", "recover"]) {
            remediation += 0.5;
        }
        if contains_any(&q, &["recommend", "what should", "suggest", "next step"]) {
            remediation += 0.4;
        }
        if contains_any(&q, &["alert", "incident", "error", "fail", "full", "down", "breach"]) {
            remediation += 0.2;
        }

        if starts_with_any(&q, &["what happened", "when did ", "show me "]) {
            lookup += 0.6;
        }
        if contains_any(&q, &["similar", "past incident", "previous", "history", "before", "last time", "seen this"]) {
            lookup += 0.5;
        }
        if event_id_re().is_match(&q) {
            lookup += 0.4;
        }

        if contains_any(&q, &["status", "healthy", "health", "state of", "is up", "running", "utilization", "load on"]) {
            status += 0.6;
        }
        if resource_re().is_match(&q) {
            status += 0.2;
        }

        let (intent, confidence) = [
            (Intent::Remediation, remediation),
            (Intent::IncidentLookup, lookup),
            (Intent::ClusterStatus, status),
        ]
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or((Intent::Unknown, 0.0));

        let confidence = confidence.min(1.0);
        let low_confidence = confidence < self.confidence_threshold;

        ParsedIntent {
            intent: if confidence == 0.0 {
                Intent::Unknown
            } else if low_confidence {
                Intent::Unknown
            } else {
                intent
            },
            entities: extract_entities(text),
            confidence,
            low_confidence,
        }
    }
}

fn starts_with_any(text: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| text.starts_with(p))
}

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

fn resource_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:node|pod|host|vm|svc|service|gw|ingress)-[a-z0-9][a-z0-9-]*\b").unwrap()
    })
}

fn event_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bevt-[a-z0-9][a-z0-9-]*\b").unwrap())
}

fn severity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(critical|high|medium|low)\b").unwrap())
}

/// Pull structured entities out of free text. Keys: `resource`,
/// `event_id`, `severity`.
pub fn extract_entities(text: &str) -> HashMap<String, String> {
    let lower = text.to_lowercase();
    let mut entities = HashMap::new();

    if let Some(m) = resource_re().find(&lower) {
        entities.insert("resource".to_string(), m.as_str().to_string());
    }
    if let Some(m) = event_id_re().find(&lower) {
        entities.insert("event_id".to_string(), m.as_str().to_string());
    }
    if let Some(m) = severity_re().find(&lower) {
        entities.insert("severity".to_string(), m.as_str().to_string());
    }

    entities
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> IntentParser {
        IntentParser::new(0.5)
    }

    #[test]
    fn test_remediation_intent() {
        let parsed = parser().parse("How do I fix the disk full alert on node-3?");
        assert_eq!(parsed.intent, Intent::Remediation);
        assert!(!parsed.low_confidence);
        assert_eq!(
            parsed.entities.get("resource").map(String::as_str),
            Some("node-3")
        );
    }

    #[test]
    fn test_incident_lookup_intent() {
        let parsed = parser().parse("Show me similar past incidents for evt-1a2b");
        assert_eq!(parsed.intent, Intent::IncidentLookup);
        assert_eq!(
            parsed.entities.get("event_id").map(String::as_str),
            Some("evt-1a2b")
        );
    }

    #[test]
    fn test_cluster_status_intent() {
        let parsed = parser().parse("what is the status of pod-ingest-7?");
        assert_eq!(parsed.intent, Intent::ClusterStatus);
        assert_eq!(
            parsed.entities.get("resource").map(String::as_str),
            Some("pod-ingest-7")
        );
    }

    #[test]
    fn test_unknown_is_sentinel_not_error() {
        let parsed = parser().parse("good morning everyone");
        assert_eq!(parsed.intent, Intent::Unknown);
        assert!(parsed.low_confidence);
    }

    #[test]
    fn test_low_confidence_still_returns_entities() {
        // "node-3" alone scores below the threshold, but entities survive.
        let parsed = IntentParser::new(0.9).parse("node-3 storage");
        assert_eq!(parsed.intent, Intent::Unknown);
        assert!(parsed.low_confidence);
        assert_eq!(
            parsed.entities.get("resource").map(String::as_str),
            Some("node-3")
        );
    }

    #[test]
    fn test_severity_entity() {
        let parsed = parser().parse("how do we resolve the critical paging storm");
        assert_eq!(
            parsed.entities.get("severity").map(String::as_str),
            Some("critical")
        );
    }

    #[test]
    fn test_threshold_zero_never_low_confidence() {
        let parsed = IntentParser::new(0.0).parse("how do i fix this error");
        assert!(!parsed.low_confidence);
        assert_eq!(parsed.intent, Intent::Remediation);
    }
}
