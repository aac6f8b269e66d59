//! In-memory broker for tests
//!
//! Mimics the parts of an AMQP broker the correlation protocol relies on: direct routing,
//! the default exchange, durable declarations which fail on mismatching parameters, consumers
//! with prefetch limits and manual acknowledgement.
//!
//! Messages are pushed to consumers as soon as they have capacity, round-robin in the order
//! the consumers registered. A pushed message is unacknowledged until it is settled or its
//! channel closes. Neither dropping a delivery nor cancelling its consumer settles it. A
//! message rejected with requeue goes back to the head of its queue, is flagged as redelivered
//! and may be pushed to the rejecting consumer again. Message expiry is recorded but not
//! enforced.

mod channel;
mod delivery;

pub use channel::MockChannel;
pub use delivery::MockDelivery;

use crate::communication::broker::{Broker, ExchangeDescriptor, OutgoingMessage, QueueDescriptor};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

/// Message residing in a queue or delivered to a consumer
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub message: OutgoingMessage,
    pub redelivered: bool,
}

#[derive(Debug)]
pub(crate) struct MockQueue {
    pub descriptor: QueueDescriptor,
    pub messages: VecDeque<StoredMessage>,
    pub declarations: usize,
    /// Tags of active consumers in registration order
    pub consumers: Vec<String>,
    /// Index into `consumers` at which the next round-robin dispatch starts
    pub cursor: usize,
}

#[derive(Debug)]
pub(crate) struct MockConsumer {
    pub queue: String,
    pub channel: usize,
    pub prefetch: u16,
    pub buffer: VecDeque<(u64, StoredMessage)>,
    pub unacknowledged: usize,
    pub cancelled: bool,
    pub notify: Arc<Notify>,
}

impl MockConsumer {
    fn has_capacity(&self) -> bool {
        !self.cancelled && (self.prefetch == 0 || self.unacknowledged < self.prefetch as usize)
    }
}

#[derive(Debug)]
pub(crate) struct Unacknowledged {
    pub queue: String,
    pub consumer: String,
    pub channel: usize,
    pub message: StoredMessage,
}

#[derive(Debug)]
pub(crate) struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// How a delivery is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Acknowledge,
    Requeue,
    Drop,
}

#[derive(Debug, Default)]
pub(crate) struct BrokerState {
    pub exchanges: HashMap<String, ExchangeDescriptor>,
    pub queues: HashMap<String, MockQueue>,
    pub bindings: Vec<Binding>,
    pub consumers: HashMap<String, MockConsumer>,
    pub unacknowledged: HashMap<u64, Unacknowledged>,
    /// Prefetch limit of every open channel
    pub channels: HashMap<usize, u16>,
    pub acknowledged: Vec<OutgoingMessage>,
    pub dropped: Vec<OutgoingMessage>,
    pub prefetch: Vec<u16>,
    pub next_channel: usize,
    pub next_consumer: usize,
    pub next_delivery_tag: u64,
    pub fail_publishing: bool,
    pub fail_consuming: bool,
    pub closed: bool,
}

impl BrokerState {
    /// Routes a message into all matching queues
    pub fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> EmptyResult {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            if !self.exchanges.contains_key(exchange) {
                return Err(format!("NOT_FOUND - no exchange '{}'", exchange).into());
            }

            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.messages.push_back(StoredMessage {
                    message: message.clone(),
                    redelivered: false,
                });
                self.dispatch(&target);
            }
        }

        Ok(())
    }

    /// Pushes ready messages of a queue to its consumers until either runs out
    pub fn dispatch(&mut self, queue_name: &str) {
        let Self {
            queues,
            consumers,
            unacknowledged,
            next_delivery_tag,
            ..
        } = self;

        let queue = match queues.get_mut(queue_name) {
            Some(queue) => queue,
            None => return,
        };

        while !queue.messages.is_empty() {
            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|index| {
                    consumers
                        .get(&queue.consumers[*index])
                        .map_or(false, MockConsumer::has_capacity)
                });

            let index = match chosen {
                Some(index) => index,
                None => return,
            };

            let tag = queue.consumers[index].clone();
            let consumer = match consumers.get_mut(&tag) {
                Some(consumer) => consumer,
                None => return,
            };
            let message = match queue.messages.pop_front() {
                Some(message) => message,
                None => return,
            };

            *next_delivery_tag += 1;
            queue.cursor = (index + 1) % count;
            consumer.unacknowledged += 1;
            consumer.buffer.push_back((*next_delivery_tag, message.clone()));
            consumer.notify.notify_one();

            unacknowledged.insert(
                *next_delivery_tag,
                Unacknowledged {
                    queue: queue_name.to_owned(),
                    consumer: tag,
                    channel: consumer.channel,
                    message,
                },
            );
        }
    }

    /// Settles a delivered message
    pub fn settle(&mut self, delivery_tag: u64, settlement: Settlement) -> EmptyResult {
        let entry = self.unacknowledged.remove(&delivery_tag).ok_or_else(|| {
            format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag)
        })?;

        if let Some(consumer) = self.consumers.get_mut(&entry.consumer) {
            consumer.unacknowledged = consumer.unacknowledged.saturating_sub(1);
        }

        match settlement {
            Settlement::Acknowledge => self.acknowledged.push(entry.message.message),
            Settlement::Drop => self.dropped.push(entry.message.message),
            Settlement::Requeue => self.requeue(&entry.queue, vec![entry.message]),
        }

        self.dispatch(&entry.queue);
        Ok(())
    }

    /// Puts messages back at the head of a queue, keeping their order
    fn requeue(&mut self, queue: &str, messages: Vec<StoredMessage>) {
        if let Some(queue) = self.queues.get_mut(queue) {
            for mut message in messages.into_iter().rev() {
                message.redelivered = true;
                queue.messages.push_front(message);
            }
        }
    }

    /// Stops pushing messages to a consumer and lets its subscription end
    pub fn cancel_consumer(&mut self, tag: &str) {
        if let Some(consumer) = self.consumers.get_mut(tag) {
            consumer.cancelled = true;
            consumer.notify.notify_one();

            if let Some(queue) = self.queues.get_mut(&consumer.queue) {
                queue.consumers.retain(|t| t != tag);
                queue.cursor = 0;
            }
        }
    }

    /// Removes a channel with all its consumers and requeues everything it has not settled
    pub fn close_channel(&mut self, channel: usize) {
        if self.channels.remove(&channel).is_none() {
            return;
        }

        let tags: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == channel)
            .map(|(tag, _)| tag.clone())
            .collect();

        for tag in &tags {
            self.cancel_consumer(tag);
            if let Some(consumer) = self.consumers.remove(tag) {
                consumer.notify.notify_one();
            }
        }

        let mut delivery_tags: Vec<u64> = self
            .unacknowledged
            .iter()
            .filter(|(_, entry)| entry.channel == channel)
            .map(|(tag, _)| *tag)
            .collect();
        delivery_tags.sort_unstable();

        let mut requeued: HashMap<String, Vec<StoredMessage>> = HashMap::new();
        for delivery_tag in delivery_tags {
            if let Some(entry) = self.unacknowledged.remove(&delivery_tag) {
                requeued.entry(entry.queue).or_default().push(entry.message);
            }
        }

        for (queue, messages) in requeued {
            self.requeue(&queue, messages);
            self.dispatch(&queue);
        }
    }

    fn unacknowledged_in(&self, queue: &str) -> Vec<(u64, &StoredMessage)> {
        let mut entries: Vec<(u64, &StoredMessage)> = self
            .unacknowledged
            .iter()
            .filter(|(_, entry)| entry.queue == queue)
            .map(|(tag, entry)| (*tag, &entry.message))
            .collect();
        entries.sort_unstable_by_key(|(tag, _)| *tag);
        entries
    }
}

/// Broker which keeps all state in memory, cloning it yields a handle to the same broker
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub(crate) fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Makes every subsequent publish fail (or succeed again)
    pub fn fail_publishing(&self, fail: bool) {
        self.lock().fail_publishing = fail;
    }

    /// Makes every subsequent consumer registration fail (or succeed again)
    pub fn fail_consuming(&self, fail: bool) {
        self.lock().fail_consuming = fail;
    }

    /// Puts a raw body into a queue, bypassing all exchanges
    pub fn inject(&self, queue: &str, body: &[u8], correlation_id: Option<&str>) {
        let message = OutgoingMessage {
            body: body.to_vec(),
            content_type: "application/json".into(),
            content_encoding: "utf-8".into(),
            delivery_mode: 2,
            correlation_id: correlation_id.map(ToOwned::to_owned),
        };

        // The default exchange never fails
        let _ = self.lock().route("", queue, message);
    }

    /// Declares a queue as another process would, bypassing all channels
    pub fn declare(&self, queue: QueueDescriptor) {
        let mut state = self.lock();
        let name = queue.name().to_owned();

        state.queues.entry(name).or_insert_with(|| MockQueue {
            descriptor: queue,
            messages: VecDeque::new(),
            declarations: 1,
            consumers: Vec::new(),
            cursor: 0,
        });
    }

    /// Whether an exchange with the given name has been declared
    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Number of messages held by a queue, whether ready or delivered but unacknowledged
    pub fn queue_len(&self, name: &str) -> usize {
        self.ready(name) + self.unacknowledged(name)
    }

    /// Messages held by a queue, unacknowledged ones first in delivery order, then ready ones
    pub fn queued(&self, name: &str) -> Vec<OutgoingMessage> {
        let state = self.lock();
        let mut messages: Vec<OutgoingMessage> = state
            .unacknowledged_in(name)
            .into_iter()
            .map(|(_, stored)| stored.message.clone())
            .collect();

        if let Some(queue) = state.queues.get(name) {
            messages.extend(queue.messages.iter().map(|m| m.message.clone()));
        }

        messages
    }

    /// Number of messages waiting in a queue which have not been delivered to any consumer
    pub fn ready(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    /// Number of messages of a queue which have been delivered but not yet settled
    pub fn unacknowledged(&self, name: &str) -> usize {
        self.lock().unacknowledged_in(name).len()
    }

    /// How often a queue has been declared
    pub fn queue_declarations(&self, name: &str) -> usize {
        self.lock()
            .queues
            .get(name)
            .map(|q| q.declarations)
            .unwrap_or_default()
    }

    /// Parameters a queue has been declared with
    pub fn queue_descriptor(&self, name: &str) -> Option<QueueDescriptor> {
        self.lock().queues.get(name).map(|q| q.descriptor.clone())
    }

    /// Exchange and routing key pairs bound to a queue
    pub fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.routing_key.clone()))
            .collect()
    }

    /// Messages which have been acknowledged by a consumer, in order
    pub fn acknowledged(&self) -> Vec<OutgoingMessage> {
        self.lock().acknowledged.clone()
    }

    /// Messages which have been rejected without requeue, in order
    pub fn dropped(&self) -> Vec<OutgoingMessage> {
        self.lock().dropped.clone()
    }

    /// Prefetch limits set on any channel, in order
    pub fn prefetch(&self) -> Vec<u16> {
        self.lock().prefetch.clone()
    }

    /// Number of active consumers on a queue
    pub fn consumers(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Number of channels which have been opened and not yet closed
    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Channel = MockChannel;

    async fn open_channel(&self) -> Result<Self::Channel, BoxedError> {
        let mut state = self.lock();

        if state.closed {
            return Err("connection is closed".into());
        }

        state.next_channel += 1;
        let id = state.next_channel;
        state.channels.insert(id, 0);

        Ok(MockChannel::new(self.state.clone(), id))
    }

    async fn close(&self) -> EmptyResult {
        let mut state = self.lock();
        let channels: Vec<usize> = state.channels.keys().copied().collect();

        for channel in channels {
            state.close_channel(channel);
        }

        state.closed = true;
        Ok(())
    }
}

pub(crate) fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod does {
    use super::*;
    use crate::communication::broker::{BrokerChannel, Polled, RawDelivery, Subscription};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::Instant;

    fn message(body: &str) -> OutgoingMessage {
        OutgoingMessage {
            body: body.as_bytes().to_vec(),
            content_type: "application/json".into(),
            content_encoding: "utf-8".into(),
            delivery_mode: 2,
            correlation_id: None,
        }
    }

    async fn setup() -> (MockBroker, MockChannel) {
        let broker = MockBroker::default();
        let channel = broker.open_channel().await.unwrap();

        channel
            .declare_exchange(&ExchangeDescriptor::direct("exchange"))
            .await
            .unwrap();
        for queue in ["a", "b"] {
            channel
                .declare_queue(&QueueDescriptor::durable(queue))
                .await
                .unwrap();
            channel.bind_queue(queue, "exchange", queue).await.unwrap();
        }

        (broker, channel)
    }

    #[tokio::test]
    async fn route_by_key() {
        let (broker, channel) = setup().await;

        channel.publish("exchange", "a", message("1")).await.unwrap();
        channel.publish("exchange", "unbound", message("2")).await.unwrap();

        assert_eq!(broker.queue_len("a"), 1);
        assert_eq!(broker.queue_len("b"), 0);
    }

    #[tokio::test]
    async fn refuse_unknown_exchanges() {
        let (_, channel) = setup().await;
        assert!(channel.publish("nope", "a", message("1")).await.is_err());
    }

    #[tokio::test]
    async fn refuse_conflicting_declarations() {
        let (_, channel) = setup().await;

        let conflicting = QueueDescriptor::durable("a").with_expiry(Duration::from_secs(1));
        assert!(channel.declare_queue(&conflicting).await.is_err());
        assert!(channel
            .declare_queue(&QueueDescriptor::durable("a"))
            .await
            .is_ok());
    }

    async fn next(subscription: &mut Subscription<MockDelivery>) -> MockDelivery {
        let deadline = Instant::now() + Duration::from_secs(1);
        match subscription.poll_until(deadline).await.unwrap() {
            Polled::Delivered(delivery) => delivery,
            _ => panic!("message has not been delivered"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn redeliver_rejected_messages_to_the_rejecting_consumer() {
        let (broker, channel) = setup().await;
        channel.publish("exchange", "a", message("1")).await.unwrap();

        let mut subscription = channel.consume("a").await.unwrap();
        let mut delivery = next(&mut subscription).await;
        assert!(!delivery.redelivered());
        delivery.reject(true).await.unwrap();

        let mut delivery = next(&mut subscription).await;
        assert!(delivery.redelivered());
        delivery.acknowledge().await.unwrap();

        assert_eq!(broker.queue_len("a"), 0);
        assert_eq!(broker.acknowledged(), vec![message("1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn push_only_up_to_the_prefetch_limit() {
        let (broker, channel) = setup().await;
        channel.set_prefetch(1).await.unwrap();
        for body in ["1", "2", "3"] {
            channel.publish("exchange", "a", message(body)).await.unwrap();
        }

        let mut subscription = channel.consume("a").await.unwrap();
        assert_eq!(broker.unacknowledged("a"), 1);
        assert_eq!(broker.ready("a"), 2);

        next(&mut subscription).await.acknowledge().await.unwrap();
        assert_eq!(broker.unacknowledged("a"), 1);
        assert_eq!(broker.ready("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn push_eagerly_without_prefetch_limit() {
        let (broker, channel) = setup().await;
        for body in ["1", "2", "3"] {
            channel.publish("exchange", "a", message(body)).await.unwrap();
        }

        let _subscription = channel.consume("a").await.unwrap();

        assert_eq!(broker.unacknowledged("a"), 3);
        assert_eq!(broker.ready("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn alternate_between_consumers() {
        let (_broker, channel) = setup().await;
        channel.set_prefetch(1).await.unwrap();
        let mut first = channel.consume("a").await.unwrap();
        let mut second = channel.consume("a").await.unwrap();

        channel.publish("exchange", "a", message("1")).await.unwrap();
        channel.publish("exchange", "a", message("2")).await.unwrap();

        assert_eq!(next(&mut first).await.payload(), b"1");
        assert_eq!(next(&mut second).await.payload(), b"2");
    }

    #[tokio::test(start_paused = true)]
    async fn keep_dropped_deliveries_unacknowledged() {
        let (broker, channel) = setup().await;
        channel.publish("exchange", "a", message("1")).await.unwrap();

        let mut subscription = channel.consume("a").await.unwrap();
        drop(next(&mut subscription).await);
        channel.cancel(subscription.consumer_tag()).await.unwrap();

        assert_eq!(broker.unacknowledged("a"), 1);
        assert_eq!(broker.ready("a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hand_out_buffered_messages_after_cancel() {
        let (broker, channel) = setup().await;
        channel.publish("exchange", "a", message("1")).await.unwrap();

        let mut subscription = channel.consume("a").await.unwrap();
        channel.cancel(subscription.consumer_tag()).await.unwrap();

        next(&mut subscription).await.reject(true).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            subscription.poll_until(deadline).await.unwrap(),
            Polled::Closed
        ));
        assert_eq!(broker.ready("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requeue_unacknowledged_messages_on_close() {
        let (broker, channel) = setup().await;
        channel.publish("exchange", "a", message("1")).await.unwrap();
        channel.publish("exchange", "a", message("2")).await.unwrap();

        let consuming = broker.open_channel().await.unwrap();
        let mut subscription = consuming.consume("a").await.unwrap();
        drop(next(&mut subscription).await);
        consuming.close().await.unwrap();

        assert_eq!(broker.ready("a"), 2);
        assert_eq!(broker.queued("a"), vec![message("1"), message("2")]);

        let mut subscription = channel.consume("a").await.unwrap();
        assert!(next(&mut subscription).await.redelivered());
    }

    #[tokio::test(start_paused = true)]
    async fn refuse_settling_twice() {
        let (_broker, channel) = setup().await;
        channel.publish("exchange", "a", message("1")).await.unwrap();

        let mut subscription = channel.consume("a").await.unwrap();
        let mut delivery = next(&mut subscription).await;

        delivery.acknowledge().await.unwrap();
        assert!(delivery.reject(true).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn wake_waiting_consumers() {
        let (broker, channel) = setup().await;
        let mut subscription = channel.consume("b").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            publisher.inject("b", b"late", None);
        });

        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            subscription.poll_until(deadline).await.unwrap(),
            Polled::Delivered(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn end_cancelled_subscriptions() {
        let (broker, channel) = setup().await;
        let mut subscription = channel.consume("a").await.unwrap();
        assert_eq!(broker.consumers("a"), 1);

        channel.cancel(subscription.consumer_tag()).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            subscription.poll_until(deadline).await.unwrap(),
            Polled::Closed
        ));
        assert_eq!(broker.consumers("a"), 0);
    }
}
