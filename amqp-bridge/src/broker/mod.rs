//! The broker capability the connector is built on.
//!
//! The connector never talks AMQP frames directly, it uses a `Broker` which owns one connection
//! and one channel in confirm mode. [`amqp::AmqpBroker`] is the implementation over a real AMQP
//! 0.9.1 connection, tests use an in-memory one.

pub mod amqp;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// A message delivered by the broker to one of our consumers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Delivery {
    /// Tag for acking or nacking this delivery on the channel.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Option<String>,
    /// The queue where the publisher waits for a reply.
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub body: Bytes,
}

/// Properties of a message being published.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
}

/// Stream of the deliveries of one consumer. It ends when the consumer is cancelled.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A started consumer.
pub struct Consumer {
    pub consumer_tag: String,
    pub deliveries: DeliveryStream,
}

/// Callback for errors which don't belong to any pending call, like the broker closing the
/// connection.
pub type ErrorCallback = std::sync::Arc<dyn Fn(anyhow::Error) + Send + Sync>;

/// Operations of a broker connection with a single channel in confirm mode.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Limit the number of unacknowledged deliveries on the channel.
    async fn prefetch(&self, count: u16) -> Result<()>;

    /// Declare an exclusive queue with a server generated name and return the name.
    async fn assert_exclusive_queue(&self) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Start consuming a queue. With `no_ack` the broker forgets the messages once they are sent
    /// out.
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<Consumer>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Send a message out. Use [`Broker::wait_for_confirms`] to know that the broker received it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: PublishProperties,
    ) -> Result<()>;

    /// Wait until the broker confirmed every message published so far.
    async fn wait_for_confirms(&self) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Negatively acknowledge a delivery, the broker puts it back to the queue.
    async fn nack(&self, delivery_tag: u64) -> Result<()>;

    /// Fail if the queue doesn't exist anymore.
    async fn check_queue(&self, queue: &str) -> Result<()>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}
