//! A thin producer over any [`Publisher`], logging every step.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info};

use ht_core::{PartitionId, Timestamp};

use crate::broker::{Delivery, InMemoryBroker, OutboundMessage, TransportError};

const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ProducerError {
    #[error("producer is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("no delivery report within {0:?}")]
    DeliveryTimeout(Duration),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Delivery report that may still be in flight.
#[derive(Debug)]
pub struct PendingDelivery {
    receiver: Receiver<Result<Delivery, TransportError>>,
}

impl PendingDelivery {
    pub fn channel() -> (Sender<Result<Delivery, TransportError>>, Self) {
        let (sender, receiver) = bounded(1);
        (sender, Self { receiver })
    }

    pub fn ready(result: Result<Delivery, TransportError>) -> Self {
        let (sender, pending) = Self::channel();
        // Capacity one and nobody else holds the sender, so this cannot block or fail.
        let _ = sender.send(result);
        pending
    }

    pub fn wait(self, timeout: Duration) -> Result<Delivery, ProducerError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Ok(result?),
            Err(RecvTimeoutError::Timeout) => Err(ProducerError::DeliveryTimeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::DeliveryLost.into()),
        }
    }

    pub fn try_get(&self) -> Option<Result<Delivery, TransportError>> {
        self.receiver.try_recv().ok()
    }
}

/// Write side of a transport.
pub trait Publisher: Send {
    fn publish(&mut self, message: OutboundMessage) -> Result<PendingDelivery, TransportError>;
    fn flush(&mut self) -> Result<(), TransportError>;
    fn close(&mut self) -> Result<(), TransportError>;
}

/// Publishes into an [`InMemoryBroker`]; deliveries complete immediately.
pub struct BrokerPublisher {
    broker: InMemoryBroker,
    closed: bool,
}

impl BrokerPublisher {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            closed: false,
        }
    }
}

impl Publisher for BrokerPublisher {
    fn publish(&mut self, message: OutboundMessage) -> Result<PendingDelivery, TransportError> {
        if self.closed {
            return Err(TransportError::Unavailable);
        }
        Ok(PendingDelivery::ready(self.broker.append(message)))
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendMode {
    /// Wait for every delivery report.
    #[default]
    Sync,
    /// Hand the pending report back to the caller.
    Async,
}

#[derive(Debug)]
pub enum Sent {
    Delivered(Delivery),
    Pending(PendingDelivery),
}

pub struct SimpleProducer<P: Publisher> {
    publisher: P,
    mode: SendMode,
    delivery_timeout: Duration,
    closed: bool,
}

impl<P: Publisher> SimpleProducer<P> {
    pub fn new(publisher: P) -> Self {
        Self::with_mode(publisher, SendMode::Sync)
    }

    pub fn with_mode(publisher: P, mode: SendMode) -> Self {
        info!(?mode, "started producer");
        Self {
            publisher,
            mode,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            closed: false,
        }
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn send(&mut self, topic: &str, value: impl Into<Vec<u8>>) -> Result<Sent, ProducerError> {
        self.send_message(OutboundMessage::new(topic, value))
    }

    pub fn send_keyed(
        &mut self,
        topic: &str,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Sent, ProducerError> {
        self.send_message(OutboundMessage::new(topic, value).with_key(key))
    }

    pub fn send_to(
        &mut self,
        topic: &str,
        partition: PartitionId,
        key: Option<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<Sent, ProducerError> {
        let mut message = OutboundMessage::new(topic, value).with_partition(partition);
        message.key = key;
        self.send_message(message)
    }

    /// Serialize `value` as JSON and send it.
    pub fn send_json<T: Serialize>(
        &mut self,
        topic: &str,
        key: Option<&str>,
        value: &T,
        timestamp: Option<Timestamp>,
    ) -> Result<Sent, ProducerError> {
        let mut message = OutboundMessage::new(topic, serde_json::to_vec(value)?);
        message.key = key.map(|key| key.as_bytes().to_vec());
        message.timestamp = timestamp;
        self.send_message(message)
    }

    pub fn send_message(&mut self, message: OutboundMessage) -> Result<Sent, ProducerError> {
        if self.closed {
            return Err(ProducerError::Closed);
        }
        let topic = message.topic.clone();
        debug!(%topic, "sending message");

        let pending = self.publisher.publish(message).map_err(|error| {
            error!(%error, %topic, "error while producing message");
            ProducerError::from(error)
        })?;

        match self.mode {
            SendMode::Async => Ok(Sent::Pending(pending)),
            SendMode::Sync => match pending.wait(self.delivery_timeout) {
                Ok(delivery) => {
                    debug!(
                        topic = %delivery.topic,
                        partition = delivery.partition,
                        offset = delivery.offset,
                        "sent message"
                    );
                    Ok(Sent::Delivered(delivery))
                }
                Err(error) => {
                    error!(%error, %topic, "error while producing message");
                    Err(error)
                }
            },
        }
    }

    pub fn flush(&mut self) -> Result<(), ProducerError> {
        info!("flushing producer");
        self.publisher.flush().map_err(|error| {
            error!(%error, "failed to flush producer");
            error.into()
        })
    }

    pub fn close(&mut self) -> Result<(), ProducerError> {
        if self.closed {
            return Ok(());
        }
        info!("closing producer");
        self.closed = true;
        self.publisher.close().map_err(|error| {
            error!(%error, "failed to close producer");
            error.into()
        })
    }
}

impl<P: Publisher> Drop for SimpleProducer<P> {
    fn drop(&mut self) {
        // Errors are already logged by close.
        let _ = self.close();
    }
}
