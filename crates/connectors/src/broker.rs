//! An in-process, partitioned topic log standing in for the pub/sub transport.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, info};

use ht_core::{Offset, PartitionId, Provenance, RawMessage, Timestamp};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    #[error("topic {topic} has no partition {partition}")]
    UnknownPartition { topic: String, partition: PartitionId },
    #[error("topic {topic} already exists with {partitions} partitions")]
    TopicMismatch { topic: String, partitions: u32 },
    #[error("transport is unavailable")]
    Unavailable,
    #[error("delivery report was lost")]
    DeliveryLost,
}

/// A message on its way into a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub partition: Option<PartitionId>,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp: Option<Timestamp>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: value.into(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Where a message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: PartitionId,
    pub offset: Offset,
    pub timestamp: Timestamp,
}

/// Read side of a transport, as the job sees it.
pub trait MessageSource: Send + Sync + 'static {
    fn partitions(&self, topic: &str) -> Result<u32, TransportError>;

    /// Up to `max` messages of one partition starting at `offset`.
    fn fetch(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
        max: usize,
    ) -> Result<Vec<RawMessage>, TransportError>;
}

#[derive(Default)]
struct Topic {
    partitions: Vec<Vec<RawMessage>>,
    next_partition: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `name` with `partitions` partitions; a no-op if it already exists with that count.
    pub fn create_topic(&self, name: &str, partitions: u32) -> Result<(), TransportError> {
        let partitions = partitions.max(1);
        let mut topics = self.lock()?;
        if let Some(existing) = topics.get(name) {
            let count = existing.partitions.len() as u32;
            if count != partitions {
                return Err(TransportError::TopicMismatch {
                    topic: name.to_string(),
                    partitions: count,
                });
            }
            return Ok(());
        }
        info!(topic = name, partitions, "creating topic");
        topics.insert(
            name.to_string(),
            Topic {
                partitions: vec![Vec::new(); partitions as usize],
                next_partition: 0,
            },
        );
        Ok(())
    }

    /// Messages currently stored in `topic`, over all partitions.
    pub fn len(&self, topic: &str) -> Result<usize, TransportError> {
        let topics = self.lock()?;
        let stored = topics
            .get(topic)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))?;
        Ok(stored.partitions.iter().map(Vec::len).sum())
    }

    /// Append one message. The partition is the requested one, else the key hash, else
    /// round robin.
    pub fn append(&self, message: OutboundMessage) -> Result<Delivery, TransportError> {
        let mut topics = self.lock()?;
        let topic = topics
            .get_mut(&message.topic)
            .ok_or_else(|| TransportError::UnknownTopic(message.topic.clone()))?;
        let count = topic.partitions.len();

        let partition = match (message.partition, message.key.as_deref()) {
            (Some(partition), _) if (partition as usize) < count => partition as usize,
            (Some(partition), _) => {
                return Err(TransportError::UnknownPartition {
                    topic: message.topic,
                    partition,
                })
            }
            (None, Some(key)) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
            (None, None) => {
                let next = topic.next_partition % count;
                topic.next_partition = next + 1;
                next
            }
        };

        let log = &mut topic.partitions[partition];
        let offset = log.len() as Offset;
        let timestamp = message
            .timestamp
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let partition = partition as PartitionId;
        log.push(RawMessage {
            key: message.key,
            value: message.value,
            timestamp,
            provenance: Some(Provenance {
                topic: message.topic.clone(),
                partition,
                offset,
            }),
        });
        debug!(topic = %message.topic, partition, offset, "appended message");

        Ok(Delivery {
            topic: message.topic,
            partition,
            offset,
            timestamp,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Topic>>, TransportError> {
        self.topics.lock().map_err(|_| TransportError::Unavailable)
    }
}

impl MessageSource for InMemoryBroker {
    fn partitions(&self, topic: &str) -> Result<u32, TransportError> {
        let topics = self.lock()?;
        topics
            .get(topic)
            .map(|stored| stored.partitions.len() as u32)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))
    }

    fn fetch(
        &self,
        topic: &str,
        partition: PartitionId,
        offset: Offset,
        max: usize,
    ) -> Result<Vec<RawMessage>, TransportError> {
        let topics = self.lock()?;
        let stored = topics
            .get(topic)
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))?;
        let log = stored
            .partitions
            .get(partition as usize)
            .ok_or_else(|| TransportError::UnknownPartition {
                topic: topic.to_string(),
                partition,
            })?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(log.len());
        let end = start.saturating_add(max).min(log.len());
        Ok(log[start..end].to_vec())
    }
}
