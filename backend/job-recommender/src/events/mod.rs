//! Inbound job and profile events

pub mod consumer;
pub mod kafka;
pub mod schema;
pub mod transport;

pub use consumer::{ConsumerOptions, ConsumerState, ConsumerStats, EventConsumer, EventHandler};
pub use kafka::KafkaTransport;
pub use schema::{IndexEvent, JobChanged, ProfileUpdated};
pub use transport::{Delivery, DeliveryTag, EventTransport, InMemoryTransport, TopicBinding};
