use super::envelope::{self, ResultEnvelope};
use super::settings::{AckMode, Settings};
use super::topology::Topology;
use crate::communication::broker::{Broker, BrokerChannel, Polled, RawDelivery, Subscription};
use crate::communication::implementation::amqp::AmqpBroker;
use crate::communication::RpcError;
use crate::helpers::deadline_after;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Delivery type of the channels opened by a broker
pub type DeliveryOf<B> = <<B as Broker>::Channel as BrokerChannel>::Delivery;

/// Request received by a [`Server`]
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    kind: String,
    correlation_id: Uuid,
    data: Value,
    redelivered: bool,
}

impl IncomingRequest {
    /// Creates a new instance from raw parts
    pub fn new(kind: impl Into<String>, correlation_id: Uuid, data: Value) -> Self {
        Self {
            kind: kind.into(),
            correlation_id,
            data,
            redelivered: false,
        }
    }

    /// Marks the request as having been delivered before
    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Kind of request as chosen by the client
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Identifier under which the client awaits the result
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Untyped payload
    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Whether the broker has delivered this request before, to this or another server
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Converts the payload into a concrete type
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        T::deserialize(&self.data).map_err(RpcError::Serialization)
    }

    /// Consumes the request, returning the untyped payload
    pub fn into_data(self) -> Value {
        self.data
    }
}

/// Responding side of the protocol
///
/// Consumes requests one at a time from the request queue shared by all servers of an
/// application and publishes results onto the result queue the requesting client listens on.
pub struct Server<B: Broker = AmqpBroker> {
    topology: Topology<B>,
    subscription: Subscription<DeliveryOf<B>>,
    encoding: String,
    timeout: Duration,
    ack_mode: AckMode,
    pending: HashMap<Uuid, DeliveryOf<B>>,
}

impl Server<AmqpBroker> {
    /// Connects to the AMQP broker described by the settings and starts consuming requests
    pub async fn connect(settings: &Settings) -> Result<Self, RpcError> {
        let topology = Topology::connect(settings).await?;
        Self::from_topology(topology, settings).await
    }
}

impl<B: Broker> Server<B> {
    /// Creates a server on an existing broker connection and starts consuming requests
    pub async fn with_broker(broker: B, settings: &Settings) -> Result<Self, RpcError> {
        let topology = Topology::with_broker(broker, settings).await?;
        Self::from_topology(topology, settings).await
    }

    async fn from_topology(topology: Topology<B>, settings: &Settings) -> Result<Self, RpcError> {
        let subscription = topology
            .request_channel()
            .consume(&topology.names().request_queue)
            .await;

        let subscription = match subscription {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(error) = topology.close().await {
                    warn!(%error, "Failed to close topology after consumer setup failed");
                }
                return Err(RpcError::Consume(e));
            }
        };

        Ok(Self {
            topology,
            subscription,
            encoding: settings.msg_encoding.clone(),
            timeout: settings.timeout,
            ack_mode: settings.ack_mode,
            pending: HashMap::new(),
        })
    }

    /// Waits for the next request
    ///
    /// Returns `None` if no request arrived within the given timeout, or the configured default
    /// if `None` is passed. Requests without a body or with a malformed envelope are reported
    /// as [`RpcError::EmptyRequest`] or [`RpcError::MalformedEnvelope`] after being settled,
    /// so the next call continues with the following request.
    #[instrument(skip(self))]
    pub async fn get_request(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<IncomingRequest>, RpcError> {
        let deadline = deadline_after(timeout.unwrap_or(self.timeout));

        let polled = self
            .subscription
            .poll_until(deadline)
            .await
            .map_err(RpcError::Consume)?;

        let mut delivery = match polled {
            Polled::Delivered(delivery) => delivery,
            Polled::Elapsed => return Ok(None),
            Polled::Closed => return Err(RpcError::ConsumerClosed),
        };

        let decoded = envelope::decode_request(delivery.payload());
        let redelivered = delivery.redelivered();

        match (self.ack_mode, &decoded) {
            (AckMode::OnReceipt, _) => {
                delivery.acknowledge().await.map_err(RpcError::Consume)?;
            }
            (AckMode::OnCompletion, Err(error)) => {
                warn!(%error, "Dropping undecodable request");
                delivery.reject(false).await.map_err(RpcError::Consume)?;
            }
            (AckMode::OnCompletion, Ok(_)) => {}
        }

        let request = decoded?;
        debug!(id = %request.result_id, kind = %request.kind, redelivered, "Received request");

        if self.ack_mode == AckMode::OnCompletion {
            if let Some(mut previous) = self.pending.insert(request.result_id, delivery) {
                warn!(id = %request.result_id, "Received duplicate request, settling previous delivery");
                previous.acknowledge().await.map_err(RpcError::Consume)?;
            }
        }

        Ok(Some(
            IncomingRequest::new(request.kind, request.result_id, request.data)
                .with_redelivered(redelivered),
        ))
    }

    /// Publishes the result for a request
    ///
    /// With [`AckMode::OnCompletion`] the request is acknowledged once the result has been
    /// published. If publishing fails, the request stays pending and may be abandoned.
    #[instrument(skip(self, data))]
    pub async fn put_result<T: Serialize + ?Sized + Sync>(
        &mut self,
        id: Uuid,
        data: &T,
    ) -> Result<(), RpcError> {
        let shard = self.topology.shard_of(&id);
        self.topology.result_queue(shard).await?;

        let envelope = ResultEnvelope {
            result_id: id,
            data: serde_json::to_value(data).map_err(RpcError::Serialization)?,
        };
        let message = envelope::encode(&envelope, id, &self.encoding)?;

        self.topology
            .result_channel()
            .publish(
                &self.topology.names().result_exchange,
                &shard.to_string(),
                message,
            )
            .await
            .map_err(RpcError::Publish)?;

        debug!(shard, "Published result");

        if let Some(mut delivery) = self.pending.remove(&id) {
            delivery.acknowledge().await.map_err(RpcError::Consume)?;
        }

        Ok(())
    }

    /// Hands a pending request back to the broker for redelivery
    ///
    /// Only requests received with [`AckMode::OnCompletion`] are pending.
    pub async fn abandon(&mut self, id: Uuid) -> Result<(), RpcError> {
        let mut delivery = self
            .pending
            .remove(&id)
            .ok_or(RpcError::UnknownRequest(id))?;

        debug!(%id, "Abandoning request");
        delivery.reject(true).await.map_err(RpcError::Consume)
    }

    /// Drops a pending request for good, the broker will not deliver it again
    pub async fn reject(&mut self, id: Uuid) -> Result<(), RpcError> {
        let mut delivery = self
            .pending
            .remove(&id)
            .ok_or(RpcError::UnknownRequest(id))?;

        debug!(%id, "Rejecting request");
        delivery.reject(false).await.map_err(RpcError::Consume)
    }

    /// Settles a pending request without publishing a result
    pub async fn discard(&mut self, id: Uuid) -> Result<(), RpcError> {
        let mut delivery = self
            .pending
            .remove(&id)
            .ok_or(RpcError::UnknownRequest(id))?;

        debug!(%id, "Discarding request");
        delivery.acknowledge().await.map_err(RpcError::Consume)
    }

    /// Number of received requests that have neither been answered nor abandoned
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Acknowledgement mode in effect
    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Stops consuming, returns pending requests to the broker and closes the connection
    pub async fn close(mut self) -> Result<(), RpcError> {
        let channel = self.topology.request_channel();

        if let Err(error) = channel.cancel(self.subscription.consumer_tag()).await {
            warn!(%error, "Failed to cancel request consumer");
        }

        for (id, mut delivery) in self.pending.drain() {
            if let Err(error) = delivery.reject(true).await {
                warn!(%id, %error, "Failed to return pending request");
            }
        }

        self.topology.close().await
    }
}
