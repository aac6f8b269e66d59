use super::constants::{RESULT_DRAIN_TIMEOUT, RESULT_RELEASE_INTERVAL};
use super::envelope::{self, RequestEnvelope};
use super::identifier;
use super::settings::Settings;
use super::topology::Topology;
use crate::communication::broker::{Broker, BrokerChannel, Polled, RawDelivery, Subscription};
use crate::communication::implementation::amqp::AmqpBroker;
use crate::communication::RpcError;
use crate::helpers::deadline_after;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Requesting side of the protocol
///
/// Publishes requests and waits for their results. Waiting borrows the client mutably,
/// thus a single instance only ever waits for one result at a time. Use multiple
/// instances for concurrent calls.
pub struct Client<B: Broker = AmqpBroker> {
    topology: Topology<B>,
    encoding: String,
    timeout: Duration,
}

impl Client<AmqpBroker> {
    /// Connects to the AMQP broker described by the settings
    pub async fn connect(settings: &Settings) -> Result<Self, RpcError> {
        let topology = Topology::connect(settings).await?;
        Ok(Self::from_topology(topology, settings))
    }
}

impl<B: Broker> Client<B> {
    /// Creates a client on an existing broker connection
    pub async fn with_broker(broker: B, settings: &Settings) -> Result<Self, RpcError> {
        let topology = Topology::with_broker(broker, settings).await?;
        Ok(Self::from_topology(topology, settings))
    }

    fn from_topology(topology: Topology<B>, settings: &Settings) -> Self {
        Self {
            topology,
            encoding: settings.msg_encoding.clone(),
            timeout: settings.timeout,
        }
    }

    /// Publishes a request and returns the correlation identifier under which its result will arrive
    #[instrument(skip(self, data))]
    pub async fn put_request<T: Serialize + ?Sized + Sync>(
        &self,
        kind: &str,
        data: &T,
    ) -> Result<Uuid, RpcError> {
        let id = identifier::generate();
        let envelope = RequestEnvelope {
            result_id: id,
            kind: kind.trim().to_owned(),
            data: serde_json::to_value(data).map_err(RpcError::Serialization)?,
        };

        let message = envelope::encode(&envelope, id, &self.encoding)?;
        let names = self.topology.names();

        self.topology
            .request_channel()
            .publish(&names.request_exchange, &names.request_routing_key, message)
            .await
            .map_err(RpcError::Publish)?;

        debug!(%id, "Published request");
        Ok(id)
    }

    /// Waits for the result of a previously published request
    ///
    /// Results for other requests which arrive on the same result queue in the meantime
    /// are held briefly and then returned to the broker. Fails with [`RpcError::Timeout`] if
    /// no matching result arrives within the given timeout, or the configured default if
    /// `None` is passed.
    ///
    /// The consumer is cancelled before returning and every result it still holds or
    /// buffers is handed back, so other clients sharing the queue receive them.
    #[instrument(skip(self))]
    pub async fn get_result<R: DeserializeOwned>(
        &mut self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<R, RpcError> {
        let timeout = timeout.unwrap_or(self.timeout);
        let deadline = deadline_after(timeout);

        let shard = self.topology.shard_of(&id);
        let queue = self.topology.result_queue(shard).await?;
        let channel = self.topology.result_channel();

        let mut subscription = channel.consume(&queue).await.map_err(RpcError::Consume)?;
        debug!(shard, %queue, "Waiting for result");

        let mut held = Vec::new();
        let outcome = await_result(&mut subscription, &mut held, id, deadline, timeout).await;

        if !matches!(outcome, Err(RpcError::ConsumerClosed)) {
            if let Err(error) = channel.cancel(subscription.consumer_tag()).await {
                warn!(%error, "Failed to cancel result consumer");
            }
        }

        release(&mut held).await;
        drain(&mut subscription).await;

        serde_json::from_value(outcome?).map_err(RpcError::Serialization)
    }

    /// Publishes a request and waits for its result
    pub async fn call<T, R>(
        &mut self,
        kind: &str,
        data: &T,
        timeout: Option<Duration>,
    ) -> Result<R, RpcError>
    where
        T: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let id = self.put_request(kind, data).await?;
        self.get_result(id, timeout).await
    }

    /// Timeout used when none is passed explicitly
    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Closes the connection to the broker
    pub async fn close(self) -> Result<(), RpcError> {
        self.topology.close().await
    }
}

async fn await_result<D: RawDelivery>(
    subscription: &mut Subscription<D>,
    held: &mut Vec<D>,
    id: Uuid,
    deadline: Instant,
    timeout: Duration,
) -> Result<Value, RpcError> {
    let expected = id.to_string();
    let mut release_at: Option<Instant> = None;

    loop {
        let wake = release_at.map_or(deadline, |at| at.min(deadline));
        let polled = subscription
            .poll_until(wake)
            .await
            .map_err(RpcError::Consume)?;

        let mut delivery = match polled {
            Polled::Delivered(delivery) => delivery,
            Polled::Elapsed if Instant::now() >= deadline => {
                return Err(RpcError::Timeout(timeout))
            }
            Polled::Elapsed => {
                release(held).await;
                release_at = None;
                continue;
            }
            Polled::Closed => return Err(RpcError::ConsumerClosed),
        };

        let addressed_elsewhere = matches!(
            delivery.correlation_id(),
            Some(correlation_id) if correlation_id != expected
        );

        if addressed_elsewhere {
            debug!(other = ?delivery.correlation_id(), "Holding result addressed to another request");
        } else {
            match envelope::decode_result(delivery.payload()) {
                Ok(result) if result.result_id == id => {
                    delivery.acknowledge().await.map_err(RpcError::Consume)?;
                    debug!("Received result");
                    return Ok(result.data);
                }
                Ok(result) => {
                    debug!(other = %result.result_id, "Holding result addressed to another request");
                }
                Err(error) => warn!(%error, "Holding undecodable result"),
            }
        }

        held.push(delivery);
        release_at.get_or_insert_with(|| deadline_after(RESULT_RELEASE_INTERVAL));
    }
}

/// Hands held deliveries back to the broker, last first so requeueing keeps their order
async fn release<D: RawDelivery>(held: &mut Vec<D>) {
    if !held.is_empty() {
        debug!(count = held.len(), "Returning results addressed to other requests");
    }

    while let Some(mut delivery) = held.pop() {
        if let Err(error) = delivery.reject(true).await {
            warn!(%error, "Failed to return result");
        }
    }
}

/// Returns everything a cancelled consumer still buffers until its subscription ends
async fn drain<D: RawDelivery>(subscription: &mut Subscription<D>) {
    let deadline = deadline_after(RESULT_DRAIN_TIMEOUT);

    loop {
        match subscription.poll_until(deadline).await {
            Ok(Polled::Delivered(mut delivery)) => {
                if let Err(error) = delivery.reject(true).await {
                    warn!(%error, "Failed to return buffered result");
                }
            }
            Ok(Polled::Closed) => return,
            Ok(Polled::Elapsed) => {
                warn!("Result consumer did not end after being cancelled");
                return;
            }
            Err(error) => {
                warn!(%error, "Failed to drain result consumer");
                return;
            }
        }
    }
}
