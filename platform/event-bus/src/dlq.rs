//! Dead Letter Queue (DLQ) handling
//!
//! Envelopes that break an invariant are never retried. They are logged at
//! error level and republished, with the reason, to `dlq.<topic>` so they can
//! be inspected and replayed by hand.

use crate::{EventBus, PublishAck};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of every quarantine subject
pub const DLQ_PREFIX: &str = "dlq";

/// Quarantine subject for a topic: `erp-events` → `dlq.erp-events`
pub fn dlq_topic(topic: &str) -> String {
    format!("{}.{}", DLQ_PREFIX, topic)
}

/// What is stored on the quarantine subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub topic: String,
    pub key: String,
    pub reason: String,
    /// Original payload, as text when it is valid UTF-8
    pub payload: String,
    pub quarantined_at: DateTime<Utc>,
}

/// Move a rejected message to its quarantine subject
///
/// Returns the broker ack of the quarantine publish, or `None` when even the
/// quarantine publish failed. On `None` the caller still owns the message and
/// must not drop or acknowledge it.
///
/// # Arguments
/// * `bus` - Bus the rejected message came from (or was headed to)
/// * `topic` - Original topic
/// * `key` - Original partition key (empty when unknown)
/// * `payload` - Raw bytes of the rejected message
/// * `reason` - Why it was rejected
pub async fn quarantine(
    bus: &dyn EventBus,
    topic: &str,
    key: &str,
    payload: &[u8],
    reason: &str,
) -> Option<PublishAck> {
    let record = QuarantineRecord {
        topic: topic.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
        payload: String::from_utf8_lossy(payload).into_owned(),
        quarantined_at: Utc::now(),
    };

    let bytes = match serde_json::to_vec(&record) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(
                topic = %topic,
                key = %key,
                reason = %reason,
                error = %e,
                "Failed to encode quarantine record"
            );
            return None;
        }
    };

    let subject = dlq_topic(topic);
    match bus.publish(&subject, key, bytes).await {
        Ok(ack) => {
            tracing::error!(
                topic = %topic,
                key = %key,
                reason = %reason,
                dlq_subject = %subject,
                "Message quarantined"
            );
            Some(ack)
        }
        Err(e) => {
            tracing::error!(
                topic = %topic,
                key = %key,
                reason = %reason,
                dlq_subject = %subject,
                error = %e,
                "Failed to publish to DLQ"
            );
            None
        }
    }
}
