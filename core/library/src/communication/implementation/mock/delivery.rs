use super::{lock, BrokerState, Settlement, StoredMessage};
use crate::communication::broker::RawDelivery;
use crate::EmptyResult;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// Message delivered by a [`MockBroker`](super::MockBroker)
///
/// Dropping an unsettled delivery leaves it unacknowledged until its channel closes.
pub struct MockDelivery {
    state: Arc<Mutex<BrokerState>>,
    delivery_tag: u64,
    payload: Vec<u8>,
    correlation_id: Option<String>,
    redelivered: bool,
    settled: bool,
}

impl MockDelivery {
    pub(super) fn new(
        state: Arc<Mutex<BrokerState>>,
        delivery_tag: u64,
        stored: StoredMessage,
    ) -> Self {
        Self {
            state,
            delivery_tag,
            payload: stored.message.body,
            correlation_id: stored.message.correlation_id,
            redelivered: stored.redelivered,
            settled: false,
        }
    }

    fn settle(&mut self, settlement: Settlement) -> EmptyResult {
        if self.settled {
            return Err("delivery has already been settled".into());
        }

        self.settled = true;
        lock(&self.state).settle(self.delivery_tag, settlement)
    }
}

#[async_trait]
impl RawDelivery for MockDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn acknowledge(&mut self) -> EmptyResult {
        self.settle(Settlement::Acknowledge)
    }

    async fn reject(&mut self, requeue: bool) -> EmptyResult {
        if requeue {
            self.settle(Settlement::Requeue)
        } else {
            self.settle(Settlement::Drop)
        }
    }
}
