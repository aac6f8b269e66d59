use crate::communication::broker::RawDelivery;
use crate::EmptyResult;
use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};

/// Message delivered by an [`AmqpBroker`](super::AmqpBroker)
pub struct AmqpDelivery {
    delivery: Delivery,
}

impl AmqpDelivery {
    pub(super) fn new(delivery: Delivery) -> Self {
        Self { delivery }
    }
}

#[async_trait]
impl RawDelivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.delivery.data
    }

    fn correlation_id(&self) -> Option<&str> {
        self.delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str())
    }

    fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    async fn acknowledge(&mut self) -> EmptyResult {
        self.delivery
            .acker
            .ack(BasicAckOptions::default())
            .await?;

        Ok(())
    }

    async fn reject(&mut self, requeue: bool) -> EmptyResult {
        self.delivery
            .acker
            .reject(BasicRejectOptions { requeue })
            .await?;

        Ok(())
    }
}
