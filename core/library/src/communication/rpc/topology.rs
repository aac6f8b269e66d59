use super::constants::RESULT_PREFETCH;
use super::settings::{Settings, TopologyNames};
use super::shard::ShardSelector;
use crate::communication::broker::{Broker, BrokerChannel, ExchangeDescriptor, QueueDescriptor};
use crate::communication::implementation::amqp::AmqpBroker;
use crate::communication::RpcError;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Owner of the broker connection and the exchanges and queues used by an application
///
/// Holds two channels, one for requests and one for results. Result queues are declared
/// lazily on first use and remembered afterwards.
pub struct Topology<B: Broker> {
    broker: B,
    request_channel: B::Channel,
    result_channel: B::Channel,
    names: TopologyNames,
    selector: ShardSelector,
    queue_ttl: Duration,
    message_ttl: Duration,
    result_queues: Vec<Option<String>>,
    request_topology_declared: bool,
    result_topology_declared: bool,
}

impl Topology<AmqpBroker> {
    /// Connects to the AMQP broker described by the settings and declares the topology
    pub async fn connect(settings: &Settings) -> Result<Self, RpcError> {
        settings.validate()?;

        let broker = AmqpBroker::connect(settings)
            .await
            .map_err(RpcError::Connection)?;

        Self::with_broker(broker, settings).await
    }
}

impl<B: Broker> Topology<B> {
    /// Opens the channels on an existing broker connection and declares the request
    /// and result topology. The broker is closed again if any of this fails.
    pub async fn with_broker(broker: B, settings: &Settings) -> Result<Self, RpcError> {
        settings.validate()?;
        let selector = settings.shard_selector()?;

        let channels = match open_channels(&broker).await {
            Ok(channels) => channels,
            Err(e) => {
                if let Err(close_error) = broker.close().await {
                    warn!(?close_error, "Failed to close broker after channel setup failed");
                }
                return Err(e);
            }
        };

        let mut topology = Self {
            broker,
            request_channel: channels.0,
            result_channel: channels.1,
            names: settings.names(),
            result_queues: vec![None; selector.count()],
            selector,
            queue_ttl: settings.amq_ttl,
            message_ttl: settings.amq_msg_ttl,
            request_topology_declared: false,
            result_topology_declared: false,
        };

        let declaration = async {
            topology.ensure_request_topology().await?;
            topology.ensure_result_topology().await
        }
        .await;

        match declaration {
            Ok(()) => Ok(topology),
            Err(e) => {
                if let Err(close_error) = topology.close().await {
                    warn!(?close_error, "Failed to close topology after declaration failed");
                }
                Err(e)
            }
        }
    }

    /// Declares the request exchange and queue and binds them to each other
    #[instrument(skip(self), fields(exchange = %self.names.request_exchange))]
    pub async fn ensure_request_topology(&mut self) -> Result<(), RpcError> {
        if self.request_topology_declared {
            return Ok(());
        }

        let names = &self.names;
        let channel = &self.request_channel;

        channel
            .declare_exchange(&ExchangeDescriptor::direct(&names.request_exchange))
            .await
            .map_err(RpcError::Topology)?;

        let queue = channel
            .declare_queue(&QueueDescriptor::durable(&names.request_queue))
            .await
            .map_err(RpcError::Topology)?;

        channel
            .bind_queue(&queue, &names.request_exchange, &names.request_routing_key)
            .await
            .map_err(RpcError::Topology)?;

        channel.set_prefetch(1).await.map_err(RpcError::Topology)?;

        debug!("Declared request topology");
        self.request_topology_declared = true;
        Ok(())
    }

    /// Declares the exchange results are published to and limits how many results
    /// a consumer receives before acknowledging
    #[instrument(skip(self), fields(exchange = %self.names.result_exchange))]
    pub async fn ensure_result_topology(&mut self) -> Result<(), RpcError> {
        if self.result_topology_declared {
            return Ok(());
        }

        self.result_channel
            .declare_exchange(&ExchangeDescriptor::direct(&self.names.result_exchange))
            .await
            .map_err(RpcError::Topology)?;

        self.result_channel
            .set_prefetch(RESULT_PREFETCH)
            .await
            .map_err(RpcError::Topology)?;

        debug!("Declared result topology");
        self.result_topology_declared = true;
        Ok(())
    }

    /// Name of the result queue for a shard, declaring and binding it on first access
    pub async fn result_queue(&mut self, shard: usize) -> Result<String, RpcError> {
        let count = self.result_queues.len();
        let slot = self
            .result_queues
            .get_mut(shard)
            .ok_or(RpcError::InvalidShard { shard, count })?;

        if let Some(name) = slot {
            return Ok(name.clone());
        }

        let descriptor = QueueDescriptor::durable(self.names.result_queue(shard))
            .with_expiry(self.queue_ttl)
            .with_message_ttl(self.message_ttl);

        let name = self
            .result_channel
            .declare_queue(&descriptor)
            .await
            .map_err(RpcError::Topology)?;

        self.result_channel
            .bind_queue(&name, &self.names.result_exchange, &shard.to_string())
            .await
            .map_err(RpcError::Topology)?;

        debug!(shard, queue = %name, "Declared result queue");
        *slot = Some(name.clone());

        Ok(name)
    }

    /// Shard the result for the given correlation identifier is routed to
    pub fn shard_of(&self, id: &Uuid) -> usize {
        self.selector.shard(&id.to_string())
    }

    /// Number of result queues
    pub fn shard_count(&self) -> usize {
        self.selector.count()
    }

    /// Names of the exchanges and queues in use
    pub fn names(&self) -> &TopologyNames {
        &self.names
    }

    /// Channel on which requests are published and consumed
    pub fn request_channel(&self) -> &B::Channel {
        &self.request_channel
    }

    /// Channel on which results are published and consumed
    pub fn result_channel(&self) -> &B::Channel {
        &self.result_channel
    }

    /// Closes both channels and the connection
    ///
    /// Every step is attempted even if a previous one failed. The first error is returned.
    #[instrument(skip(self))]
    pub async fn close(self) -> Result<(), RpcError> {
        let results = [
            self.result_channel.close().await,
            self.request_channel.close().await,
            self.broker.close().await,
        ];

        let mut first_error = None;
        for error in results.into_iter().filter_map(Result::err) {
            warn!(%error, "Failed to close broker resource");
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(e) => Err(RpcError::Connection(e)),
            None => Ok(()),
        }
    }
}

async fn open_channels<B: Broker>(broker: &B) -> Result<(B::Channel, B::Channel), RpcError> {
    let request = broker.open_channel().await.map_err(RpcError::Connection)?;
    let result = broker.open_channel().await.map_err(RpcError::Connection)?;
    Ok((request, result))
}
