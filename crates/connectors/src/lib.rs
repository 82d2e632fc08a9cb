//! Collaborators around the aggregation: the transport (an in-memory broker and a
//! producer over it) and the column-family sink the window winners are written to.

pub mod broker;
pub mod producer;
pub mod row;
pub mod sink;

pub use broker::{Delivery, InMemoryBroker, MessageSource, OutboundMessage, TransportError};
pub use producer::{
    BrokerPublisher, PendingDelivery, ProducerError, Publisher, SendMode, Sent, SimpleProducer,
};
pub use row::Row;
pub use sink::{
    JsonLinesSink, MemoryTable, MemoryTableSink, RetryPolicy, RetryingSink, SharedSink, Sink,
    SinkError, TableSpec,
};
