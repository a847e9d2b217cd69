//! In-memory implementation of the EventBus trait for testing and development

use crate::{AckHandle, BusError, BusMessage, BusResult, EventBus, PublishAck};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// EventBus implementation backed by per-topic append-only logs
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need fast, isolated message buses
///
/// Each topic keeps every published message in publish order, so per-key
/// ordering holds trivially. Each durable name keeps a committed position;
/// resubscribing under the same name redelivers every message that was not
/// acknowledged. Topics are matched exactly (no wildcards).
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
///
/// bus.publish("erp-events", "PROD-001", b"hello".to_vec()).await?;
///
/// // Durable subscriptions start from the beginning of the log
/// let mut stream = bus.subscribe("erp-events", "prediction-service").await?;
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.key.as_deref(), Some("PROD-001"));
/// msg.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, TopicLog>>,
}

struct TopicLog {
    messages: Vec<StoredMessage>,
    // Carries the latest sequence; subscribers wait on it for new messages.
    notify: watch::Sender<u64>,
    cursors: HashMap<String, Cursor>,
}

#[derive(Clone)]
struct StoredMessage {
    key: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Cursor {
    /// Every sequence up to and including this one is acknowledged
    committed: u64,
    /// Acknowledged sequences above `committed`
    acked: BTreeSet<u64>,
}

impl Cursor {
    fn is_acked(&self, sequence: u64) -> bool {
        sequence <= self.committed || self.acked.contains(&sequence)
    }

    fn ack(&mut self, sequence: u64) {
        if sequence <= self.committed {
            return;
        }
        self.acked.insert(sequence);
        while self.acked.remove(&(self.committed + 1)) {
            self.committed += 1;
        }
    }
}

impl TopicLog {
    fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            messages: Vec::new(),
            notify,
            cursors: HashMap::new(),
        }
    }
}

impl InMemoryBus {
    /// Create a new in-memory event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published to `topic`, in publish order
    pub async fn published(&self, topic: &str) -> Vec<BusMessage> {
        let topics = self.inner.topics.lock().await;
        topics
            .get(topic)
            .map(|log| {
                log.messages
                    .iter()
                    .enumerate()
                    .map(|(idx, stored)| to_bus_message(topic, idx as u64 + 1, stored))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Committed position of a durable subscription (0 when unknown)
    pub async fn committed(&self, topic: &str, durable_name: &str) -> u64 {
        let topics = self.inner.topics.lock().await;
        topics
            .get(topic)
            .and_then(|log| log.cursors.get(durable_name))
            .map(|cursor| cursor.committed)
            .unwrap_or(0)
    }

    /// Collect the undelivered tail of the log for a durable name.
    ///
    /// Returns the messages and the position to read from next time.
    async fn read_from(
        inner: &Arc<Inner>,
        topic: &str,
        durable_name: &str,
        from: u64,
    ) -> (Vec<BusMessage>, u64) {
        let topics = inner.topics.lock().await;
        let Some(log) = topics.get(topic) else {
            return (Vec::new(), from);
        };
        let cursor = log.cursors.get(durable_name);

        let batch = log
            .messages
            .iter()
            .enumerate()
            .map(|(idx, stored)| (idx as u64 + 1, stored))
            .filter(|(sequence, _)| *sequence >= from)
            .filter(|(sequence, _)| !cursor.is_some_and(|c| c.is_acked(*sequence)))
            .map(|(sequence, stored)| {
                let handle = InMemoryAck {
                    inner: Arc::clone(inner),
                    topic: topic.to_string(),
                    durable_name: durable_name.to_string(),
                    sequence,
                };
                to_bus_message(topic, sequence, stored).with_ack_handle(Arc::new(handle))
            })
            .collect();

        (batch, log.messages.len() as u64 + 1)
    }
}

fn to_bus_message(topic: &str, sequence: u64, stored: &StoredMessage) -> BusMessage {
    BusMessage::new(topic.to_string(), stored.payload.clone())
        .with_key(stored.key.clone())
        .with_sequence(sequence)
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, key: &str, payload: Vec<u8>) -> BusResult<PublishAck> {
        if subject.is_empty() {
            return Err(BusError::InvalidSubject("topic cannot be empty".to_string()));
        }

        let mut topics = self.inner.topics.lock().await;
        let log = topics
            .entry(subject.to_string())
            .or_insert_with(TopicLog::new);

        log.messages.push(StoredMessage {
            key: key.to_string(),
            payload,
        });
        let sequence = log.messages.len() as u64;
        log.notify.send_replace(sequence);

        Ok(PublishAck {
            subject: subject.to_string(),
            sequence,
            duplicate: false,
        })
    }

    async fn subscribe(
        &self,
        subject: &str,
        durable_name: &str,
    ) -> BusResult<BoxStream<'static, BusMessage>> {
        if subject.is_empty() {
            return Err(BusError::InvalidSubject("topic cannot be empty".to_string()));
        }
        if durable_name.is_empty() {
            return Err(BusError::SubscribeError(
                "durable name cannot be empty".to_string(),
            ));
        }

        let (mut changes, start) = {
            let mut topics = self.inner.topics.lock().await;
            let log = topics
                .entry(subject.to_string())
                .or_insert_with(TopicLog::new);
            let cursor = log.cursors.entry(durable_name.to_string()).or_default();
            (log.notify.subscribe(), cursor.committed + 1)
        };

        let inner = Arc::clone(&self.inner);
        let topic = subject.to_string();
        let durable_name = durable_name.to_string();

        let stream = async_stream::stream! {
            let mut next = start;
            loop {
                // Mark the current version as seen before reading the log so a
                // publish racing with the read still wakes us below.
                changes.borrow_and_update();
                let (batch, following) = Self::read_from(&inner, &topic, &durable_name, next).await;
                next = following;

                if batch.is_empty() {
                    if changes.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                for msg in batch {
                    yield msg;
                }
            }
        };

        Ok(stream.boxed())
    }
}

#[derive(Clone)]
struct InMemoryAck {
    inner: Arc<Inner>,
    topic: String,
    durable_name: String,
    sequence: u64,
}

impl std::fmt::Debug for InMemoryAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryAck")
            .field("topic", &self.topic)
            .field("durable_name", &self.durable_name)
            .field("sequence", &self.sequence)
            .finish()
    }
}

#[async_trait]
impl AckHandle for InMemoryAck {
    async fn ack(&self) -> BusResult<()> {
        let mut topics = self.inner.topics.lock().await;
        let cursor = topics
            .get_mut(&self.topic)
            .and_then(|log| log.cursors.get_mut(&self.durable_name))
            .ok_or_else(|| {
                BusError::AckError(format!(
                    "unknown subscription {} on {}",
                    self.durable_name, self.topic
                ))
            })?;
        cursor.ack(self.sequence);
        Ok(())
    }
}
