//! Contract between the correlation protocol and the underlying message broker
//!
//! The protocol only requires a handful of primitives from a broker: durable named
//! exchanges and queues, bindings by routing key, publishing with a small set of message
//! properties, and at-least-once delivery with manual acknowledgement. Every operation
//! is expected to be idempotent by name, so that multiple processes may declare the same
//! resources concurrently.

use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

/// AMQP delivery mode marking a message as persistent
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Describes an exchange with direct routing and its parameters
///
/// Direct exchanges route a message to all queues bound with a routing key equal to
/// the one of the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDescriptor {
    name: String,
    durable: bool,
}

impl ExchangeDescriptor {
    /// Creates a durable exchange with direct routing
    pub fn direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }

    /// Name by which the exchange is identified
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the exchange survives a broker restart
    pub fn durable(&self) -> bool {
        self.durable
    }
}

/// Describes a queue and its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    name: String,
    durable: bool,
    auto_delete: bool,
    expires: Option<Duration>,
    message_ttl: Option<Duration>,
}

impl QueueDescriptor {
    /// Creates a durable queue which is never deleted automatically
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
            expires: None,
            message_ttl: None,
        }
    }

    /// Lets the broker delete the queue after it has been unused for the given duration
    pub fn with_expiry(mut self, expires: Duration) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Lets the broker drop messages which spent more than the given duration in the queue
    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Name by which the queue is identified
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue survives a broker restart
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether the queue is deleted once the last consumer unsubscribes
    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    /// Duration without consumers after which the queue is deleted
    pub fn expires(&self) -> Option<Duration> {
        self.expires
    }

    /// Duration after which messages are considered stale and dropped
    pub fn message_ttl(&self) -> Option<Duration> {
        self.message_ttl
    }
}

/// Message which is about to be published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Serialized payload
    pub body: Vec<u8>,
    /// MIME type of the body
    pub content_type: String,
    /// Character encoding of the body
    pub content_encoding: String,
    /// AMQP delivery mode, see [`DELIVERY_MODE_PERSISTENT`]
    pub delivery_mode: u8,
    /// Identifier which relates the message to a request
    pub correlation_id: Option<String>,
}

/// Message received from a queue which has to be settled by either acknowledging or rejecting it
#[async_trait]
pub trait RawDelivery {
    /// Body of the message
    fn payload(&self) -> &[u8];

    /// Correlation identifier from the message properties, if any
    fn correlation_id(&self) -> Option<&str>;

    /// Whether the message has been delivered before and was handed back to the broker
    fn redelivered(&self) -> bool;

    /// Marks the message as processed and removes it from the queue
    async fn acknowledge(&mut self) -> EmptyResult;

    /// Hands the message back to the broker, which either requeues or drops it
    ///
    /// A requeued message is put back at the head of its queue and may be delivered to the
    /// same consumer again right away.
    async fn reject(&mut self, requeue: bool) -> EmptyResult;
}

/// Result of waiting for the next delivery of a [`Subscription`]
#[derive(Debug)]
pub enum Polled<D> {
    /// A message arrived in time
    Delivered(D),
    /// The deadline passed without a message arriving
    Elapsed,
    /// The broker closed the consumer
    Closed,
}

/// Active consumer on a queue
pub struct Subscription<D> {
    consumer_tag: String,
    deliveries: BoxStream<'static, Result<D, BoxedError>>,
}

impl<D> Subscription<D> {
    /// Creates a new instance from raw parts
    pub fn new(
        consumer_tag: impl Into<String>,
        deliveries: BoxStream<'static, Result<D, BoxedError>>,
    ) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            deliveries,
        }
    }

    /// Identifier of the consumer, used to cancel it
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Waits for the next delivery until the deadline passes
    pub async fn poll_until(&mut self, deadline: Instant) -> Result<Polled<D>, BoxedError> {
        match timeout_at(deadline, self.deliveries.next()).await {
            Err(_) => Ok(Polled::Elapsed),
            Ok(None) => Ok(Polled::Closed),
            Ok(Some(Ok(delivery))) => Ok(Polled::Delivered(delivery)),
            Ok(Some(Err(e))) => Err(e),
        }
    }
}

/// Connection to a message broker from which channels can be opened
#[async_trait]
pub trait Broker: Send + Sync {
    /// [`BrokerChannel`] implementation type
    type Channel: BrokerChannel + Send + Sync + 'static;

    /// Opens a new channel on the connection
    async fn open_channel(&self) -> Result<Self::Channel, BoxedError>;

    /// Closes the connection
    async fn close(&self) -> EmptyResult;
}

/// Lightweight session on a broker connection through which all operations are performed
#[async_trait]
pub trait BrokerChannel {
    /// [`RawDelivery`] implementation type
    type Delivery: RawDelivery + Send + 'static;

    /// Creates the exchange if it does not exist
    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> EmptyResult;

    /// Creates the queue if it does not exist and returns its name
    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<String, BoxedError>;

    /// Routes messages published to `exchange` with the given `routing_key` into `queue`
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> EmptyResult;

    /// Limits the number of unacknowledged messages delivered to each consumer of this channel
    ///
    /// Applies to consumers registered afterwards. Without a limit the broker pushes every
    /// message of a queue to its consumers, where it stays until settled or the channel closes.
    async fn set_prefetch(&self, count: u16) -> EmptyResult;

    /// Publishes a message and waits until the broker confirmed its reception
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> EmptyResult;

    /// Registers a consumer on the queue
    async fn consume(&self, queue: &str) -> Result<Subscription<Self::Delivery>, BoxedError>;

    /// Stops delivering messages to the consumer with the given tag
    ///
    /// Messages already delivered stay unacknowledged. The subscription still yields those
    /// which have not been polled yet and ends afterwards.
    async fn cancel(&self, consumer_tag: &str) -> EmptyResult;

    /// Closes the channel
    async fn close(&self) -> EmptyResult;
}
