use super::{AmqpDelivery, AmqpError};
use crate::communication::broker::{
    BrokerChannel, ExchangeDescriptor, OutgoingMessage, QueueDescriptor, Subscription,
};
use crate::helpers::duration_as_millis_u32;
use crate::{BoxedError, EmptyResult};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use lapin::options::{
    BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};
use tracing::trace;
use uuid::Uuid;

const CONSUMER_TAG_PREFIX: &str = "syrpc";

/// Channel on an [`AmqpBroker`](super::AmqpBroker)
pub struct AmqpChannel {
    channel: Channel,
}

impl AmqpChannel {
    pub(super) fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    type Delivery = AmqpDelivery;

    async fn declare_exchange(&self, exchange: &ExchangeDescriptor) -> EmptyResult {
        let options = ExchangeDeclareOptions {
            durable: exchange.durable(),
            ..Default::default()
        };

        self.channel
            .exchange_declare(
                exchange.name(),
                lapin::ExchangeKind::Direct,
                options,
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn declare_queue(&self, queue: &QueueDescriptor) -> Result<String, BoxedError> {
        let options = QueueDeclareOptions {
            durable: queue.is_durable(),
            auto_delete: queue.auto_delete(),
            ..Default::default()
        };

        let declared = self
            .channel
            .queue_declare(queue.name(), options, queue_arguments(queue))
            .await?;

        Ok(declared.name().as_str().to_owned())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> EmptyResult {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> EmptyResult {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> EmptyResult {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties(&message),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(AmqpError::Nacked {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
            }
            .into());
        }

        trace!(exchange, routing_key, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription<Self::Delivery>, BoxedError> {
        let tag = format!("{}-{}", CONSUMER_TAG_PREFIX, Uuid::new_v4());

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deliveries = consumer
            .map_ok(AmqpDelivery::new)
            .map_err(|e| Box::new(e) as BoxedError)
            .boxed();

        Ok(Subscription::new(tag, deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> EmptyResult {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;

        Ok(())
    }

    async fn close(&self) -> EmptyResult {
        if self.channel.status().connected() {
            self.channel.close(200, "Bye").await?;
        }

        Ok(())
    }
}

/// Optional queue arguments understood by RabbitMQ
fn queue_arguments(queue: &QueueDescriptor) -> FieldTable {
    let mut arguments = FieldTable::default();

    if let Some(expires) = queue.expires() {
        arguments.insert(
            "x-expires".into(),
            AMQPValue::LongUInt(duration_as_millis_u32(expires)),
        );
    }

    if let Some(ttl) = queue.message_ttl() {
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongUInt(duration_as_millis_u32(ttl)),
        );
    }

    arguments
}

fn properties(message: &OutgoingMessage) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(message.content_type.clone().into())
        .with_content_encoding(message.content_encoding.clone().into())
        .with_delivery_mode(message.delivery_mode);

    match &message.correlation_id {
        Some(id) => properties.with_correlation_id(id.clone().into()),
        None => properties,
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use lapin::types::ShortString;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn convert_expiry_to_milliseconds() {
        let queue = QueueDescriptor::durable("results")
            .with_expiry(Duration::from_secs(10_800))
            .with_message_ttl(Duration::from_secs(10));

        let arguments = queue_arguments(&queue);
        let inner = arguments.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-expires")),
            Some(&AMQPValue::LongUInt(10_800_000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-message-ttl")),
            Some(&AMQPValue::LongUInt(10_000))
        );
    }

    #[test]
    fn omit_unset_arguments() {
        assert!(queue_arguments(&QueueDescriptor::durable("requests"))
            .inner()
            .is_empty());
    }

    #[test]
    fn carry_message_properties() {
        let message = OutgoingMessage {
            body: b"{}".to_vec(),
            content_type: "application/json".into(),
            content_encoding: "utf-8".into(),
            delivery_mode: 2,
            correlation_id: Some("b5e2a8a4-4c7c-4e0b-a3b4-2f4a2f1d9c11".into()),
        };

        let properties = properties(&message);

        assert_eq!(
            properties.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
        assert_eq!(
            properties.content_encoding().as_ref().map(|s| s.as_str()),
            Some("utf-8")
        );
        assert_eq!(*properties.delivery_mode(), Some(2));
        assert_eq!(
            properties.correlation_id().as_ref().map(|s| s.as_str()),
            Some("b5e2a8a4-4c7c-4e0b-a3b4-2f4a2f1d9c11")
        );
    }
}
