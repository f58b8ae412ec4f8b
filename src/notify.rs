//! Outbound chat delivery and inbound callback verification.
//!
//! Delivery is at-least-once: a failed post is reported, never silently
//! dropped, and the caller decides whether to retry. Identical
//! recommendations (same dedup key) within the cooldown window are
//! suppressed before any network call happens.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::NotifyConfig;
use crate::error::AssistError;
use crate::models::Recommendation;

type HmacSha256 = Hmac<Sha256>;

/// Where a formatted message actually goes.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn deliver(&self, channel: &str, text: &str) -> Result<(), AssistError>;
}

/// Posts `{"channel": ..., "text": ...}` to a chat webhook.
pub struct WebhookDispatcher {
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookDispatcher {
    async fn deliver(&self, channel: &str, text: &str) -> Result<(), AssistError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AssistError::Unavailable(e.to_string()))?;

        let body = serde_json::json!({ "channel": channel, "text": text });
        let response = client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AssistError::Unavailable(format!("webhook unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AssistError::Unavailable(format!(
                "webhook returned {}",
                status
            )));
        }
        Ok(())
    }
}

/// Dispatcher used when no webhook is configured: deliveries land in the
/// log instead of a chat channel.
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn deliver(&self, channel: &str, text: &str) -> Result<(), AssistError> {
        info!(channel = channel, "notification: {}", text);
        Ok(())
    }
}

/// Outcome of a notification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Same dedup key seen within the cooldown window.
    Suppressed,
}

pub struct Notifier {
    dispatcher: Box<dyn NotificationDispatcher>,
    channel: String,
    cooldown: Duration,
    recent: Mutex<HashMap<String, Instant>>,
}

impl Notifier {
    pub fn new(dispatcher: Box<dyn NotificationDispatcher>, channel: String, cooldown: Duration) -> Self {
        Self {
            dispatcher,
            channel,
            cooldown,
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        let dispatcher: Box<dyn NotificationDispatcher> = match &config.webhook_url {
            Some(url) => Box::new(WebhookDispatcher::new(url.clone())),
            None => Box::new(LogDispatcher),
        };
        Self::new(
            dispatcher,
            config.channel.clone(),
            Duration::from_secs(config.cooldown_secs),
        )
    }

    /// Deliver a recommendation, unless its dedup key fired within the
    /// cooldown window. A delivery failure does not consume the cooldown,
    /// so the next attempt goes out.
    pub async fn notify_recommendation(
        &self,
        recommendation: &Recommendation,
    ) -> Result<Delivery, AssistError> {
        if self.in_cooldown(&recommendation.dedup_key) {
            info!(
                dedup_key = %recommendation.dedup_key,
                "suppressing duplicate recommendation"
            );
            return Ok(Delivery::Suppressed);
        }

        let text = format_recommendation(recommendation);
        self.dispatcher.deliver(&self.channel, &text).await?;
        self.mark_sent(&recommendation.dedup_key);
        Ok(Delivery::Sent)
    }

    /// Post an explicit failure notice. Used when a pipeline stage fails
    /// and the operator would otherwise see nothing at all.
    pub async fn notify_failure(&self, stage: &str, detail: &str) -> Result<(), AssistError> {
        let text = format!(
            ":warning: triage pipeline could not complete ({}): {}",
            stage, detail
        );
        self.dispatcher.deliver(&self.channel, &text).await
    }

    fn in_cooldown(&self, dedup_key: &str) -> bool {
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        match recent.get(dedup_key) {
            Some(sent_at) => sent_at.elapsed() < self.cooldown,
            None => false,
        }
    }

    fn mark_sent(&self, dedup_key: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        let cooldown = self.cooldown;
        recent.retain(|_, sent_at| sent_at.elapsed() < cooldown);
        recent.insert(dedup_key.to_string(), Instant::now());
    }
}

/// Render a recommendation for chat: guidance first, then the evidence
/// trail so operators can audit it.
pub fn format_recommendation(recommendation: &Recommendation) -> String {
    let mut out = recommendation.text.clone();
    if !recommendation.provenance.is_empty() {
        out.push_str(&format!(
            "\nbased on: {}",
            recommendation.provenance.join(", ")
        ));
    }
    if let Some(confidence) = recommendation.confidence {
        out.push_str(&format!("\nconfidence: {:.2}", confidence));
    }
    out
}

/// Verify an inbound chat callback signature.
///
/// The signed base string is `v0:{timestamp}:{body}`; the expected
/// signature is `v0=` plus the hex HMAC-SHA256 under the shared secret.
/// Comparison is constant-time. Requests older than five minutes are
/// rejected to limit replay.
pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    body: &str,
    signature: &str,
    now_epoch: i64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now_epoch - ts).abs() > 300 {
        return false;
    }

    let Some(hex_sig) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("v0:{}:{}", timestamp, body).as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Produce the signature a sender would attach, for tests and tooling.
pub fn sign(secret: &str, timestamp: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(format!("v0:{}:{}", timestamp, body).as_bytes());
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingDispatcher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NotificationDispatcher for CountingDispatcher {
        async fn deliver(&self, _channel: &str, _text: &str) -> Result<(), AssistError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingDispatcher;

    #[async_trait]
    impl NotificationDispatcher for FailingDispatcher {
        async fn deliver(&self, _channel: &str, _text: &str) -> Result<(), AssistError> {
            Err(AssistError::Unavailable("webhook down".to_string()))
        }
    }

    fn recommendation(dedup_key: &str) -> Recommendation {
        Recommendation {
            text: "Expand the volume on node-3.".to_string(),
            provenance: vec!["evt-1".to_string(), "evt-2".to_string()],
            confidence: Some(0.91),
            dedup_key: dedup_key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_within_cooldown_suppressed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(
            Box::new(CountingDispatcher {
                calls: calls.clone(),
            }),
            "#ops".to_string(),
            Duration::from_secs(300),
        );

        let rec = recommendation("rec-abc");
        assert_eq!(
            notifier.notify_recommendation(&rec).await.unwrap(),
            Delivery::Sent
        );
        assert_eq!(
            notifier.notify_recommendation(&rec).await.unwrap(),
            Delivery::Suppressed
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_both_delivered() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(
            Box::new(CountingDispatcher {
                calls: calls.clone(),
            }),
            "#ops".to_string(),
            Duration::from_secs(300),
        );

        notifier
            .notify_recommendation(&recommendation("rec-a"))
            .await
            .unwrap();
        notifier
            .notify_recommendation(&recommendation("rec-b"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_consume_cooldown() {
        let notifier = Notifier::new(
            Box::new(FailingDispatcher),
            "#ops".to_string(),
            Duration::from_secs(300),
        );
        let rec = recommendation("rec-abc");
        assert!(notifier.notify_recommendation(&rec).await.is_err());
        // Still not in cooldown: the next attempt reaches the dispatcher.
        assert!(notifier.notify_recommendation(&rec).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_cooldown_allows_resend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let notifier = Notifier::new(
            Box::new(CountingDispatcher {
                calls: calls.clone(),
            }),
            "#ops".to_string(),
            Duration::from_millis(10),
        );
        let rec = recommendation("rec-abc");
        notifier.notify_recommendation(&rec).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            notifier.notify_recommendation(&rec).await.unwrap(),
            Delivery::Sent
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_format_includes_provenance_and_confidence() {
        let text = format_recommendation(&recommendation("rec-abc"));
        assert!(text.contains("evt-1, evt-2"));
        assert!(text.contains("confidence: 0.91"));
    }

    #[test]
    fn test_signature_round_trip() {
        let body = r##"{"text":"how do i fix node-3","sender":"ana","channel":"#ops"}"##;
        let sig = sign("s3cret", "1700000000", body);
        assert!(verify_signature("s3cret", "1700000000", body, &sig, 1700000060));
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let sig = sign("s3cret", "1700000000", "body");
        assert!(!verify_signature("other", "1700000000", "body", &sig, 1700000060));
    }

    #[test]
    fn test_signature_rejects_tampered_body() {
        let sig = sign("s3cret", "1700000000", "body");
        assert!(!verify_signature("s3cret", "1700000000", "tampered", &sig, 1700000060));
    }

    #[test]
    fn test_signature_rejects_stale_timestamp() {
        let sig = sign("s3cret", "1700000000", "body");
        assert!(!verify_signature("s3cret", "1700000000", "body", &sig, 1700009999));
    }

    #[test]
    fn test_signature_rejects_malformed_header() {
        assert!(!verify_signature("s3cret", "1700000000", "body", "zz=nope", 1700000060));
        assert!(!verify_signature("s3cret", "not-a-ts", "body", "v0=00", 1700000060));
    }
}
