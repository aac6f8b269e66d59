use super::{lock, Binding, BrokerState, MockConsumer, MockDelivery, MockQueue};
use crate::communication::broker::{
    BrokerChannel, ExchangeDescriptor, OutgoingMessage, QueueDescriptor, Subscription,
};
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Channel on a [`MockBroker`](super::MockBroker)
#[derive(Debug)]
pub struct MockChannel {
    state: Arc<Mutex<BrokerState>>,
    id: usize,
}

impl MockChannel {
    pub(super) fn new(state: Arc<Mutex<BrokerState>>, id: usize) -> Self {
        Self { state, id }
    }

    fn ensure_open(&self) -> EmptyResult {
        let state = lock(&self.state);

        if state.closed || !state.channels.contains_key(&self.id) {
            Err("channel is closed".into())
        } else {
            Ok(())
        }
    }
}

struct ConsumerContext {
    state: Arc<Mutex<BrokerState>>,
    tag: String,
}

enum Next {
    Delivery(MockDelivery),
    Wait(Arc<Notify>),
    End,
}

impl ConsumerContext {
    /// Takes the next message pushed to this consumer
    ///
    /// A cancelled consumer hands out what it still buffers before ending. A consumer
    /// whose channel closed ends right away as its buffer has been requeued.
    fn next(&self) -> Next {
        let mut state = lock(&self.state);

        let consumer = match state.consumers.get_mut(&self.tag) {
            Some(consumer) => consumer,
            None => return Next::End,
        };

        if let Some((delivery_tag, stored)) = consumer.buffer.pop_front() {
            return Next::Delivery(MockDelivery::new(self.state.clone(), delivery_tag, stored));
        }

        if consumer.cancelled {
            state.consumers.remove(&self.tag);
            return Next::End;
        }

        Next::Wait(consumer.notify.clone())
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    type Delivery = MockDelivery;

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> EmptyResult {
        self.ensure_open()?;
        let mut state = lock(&self.state);

        match state.exchanges.get(exchange.name()) {
            Some(existing) if existing != exchange => Err(format!(
                "PRECONDITION_FAILED - inequivalent arguments for exchange '{}'",
                exchange.name()
            )
            .into()),
            Some(_) => Ok(()),
            None => {
                state
                    .exchanges
                    .insert(exchange.name().to_owned(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<String, BoxedError> {
        self.ensure_open()?;
        let mut state = lock(&self.state);

        match state.queues.get_mut(queue.name()) {
            Some(existing) if &existing.descriptor != queue => {
                return Err(format!(
                    "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                    queue.name()
                )
                .into())
            }
            Some(existing) => existing.declarations += 1,
            None => {
                state.queues.insert(
                    queue.name().to_owned(),
                    MockQueue {
                        descriptor: queue.clone(),
                        messages: VecDeque::new(),
                        declarations: 1,
                        consumers: Vec::new(),
                        cursor: 0,
                    },
                );
            }
        }

        Ok(queue.name().to_owned())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> EmptyResult {
        self.ensure_open()?;
        let mut state = lock(&self.state);

        if !state.queues.contains_key(queue) {
            return Err(format!("NOT_FOUND - no queue '{}'", queue).into());
        }

        if !state.exchanges.contains_key(exchange) {
            return Err(format!("NOT_FOUND - no exchange '{}'", exchange).into());
        }

        let exists = state.bindings.iter().any(|b| {
            b.queue == queue && b.exchange == exchange && b.routing_key == routing_key
        });

        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_owned(),
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            });
        }

        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> EmptyResult {
        self.ensure_open()?;
        let mut state = lock(&self.state);

        state.prefetch.push(count);
        state.channels.insert(self.id, count);

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> EmptyResult {
        self.ensure_open()?;
        let mut state = lock(&self.state);

        if state.fail_publishing {
            return Err("publish has been nacked".into());
        }

        state.route(exchange, routing_key, message)
    }

    async fn consume(&self, queue: &str) -> Result<Subscription<Self::Delivery>, BoxedError> {
        self.ensure_open()?;

        let tag = {
            let mut state = lock(&self.state);

            if state.fail_consuming {
                return Err("ACCESS_REFUSED - consuming has been disabled".into());
            }

            if !state.queues.contains_key(queue) {
                return Err(format!("NOT_FOUND - no queue '{}'", queue).into());
            }

            state.next_consumer += 1;
            let tag = format!("mock-consumer-{}", state.next_consumer);
            let prefetch = state.channels.get(&self.id).copied().unwrap_or_default();

            state.consumers.insert(
                tag.clone(),
                MockConsumer {
                    queue: queue.to_owned(),
                    channel: self.id,
                    prefetch,
                    buffer: VecDeque::new(),
                    unacknowledged: 0,
                    cancelled: false,
                    notify: Arc::new(Notify::new()),
                },
            );

            if let Some(queue) = state.queues.get_mut(queue) {
                queue.consumers.push(tag.clone());
            }

            state.dispatch(queue);
            tag
        };

        let context = ConsumerContext {
            state: self.state.clone(),
            tag: tag.clone(),
        };

        let deliveries = stream::unfold(context, |context| async move {
            loop {
                match context.next() {
                    Next::Delivery(delivery) => {
                        return Some((Ok::<_, BoxedError>(delivery), context))
                    }
                    Next::Wait(notify) => notify.notified().await,
                    Next::End => return None,
                }
            }
        });

        Ok(Subscription::new(tag, deliveries.boxed()))
    }

    async fn cancel(&self, consumer_tag: &str) -> EmptyResult {
        self.ensure_open()?;
        lock(&self.state).cancel_consumer(consumer_tag);
        Ok(())
    }

    async fn close(&self) -> EmptyResult {
        lock(&self.state).close_channel(self.id);
        Ok(())
    }
}
