use super::rpc::SettingsError;
use crate::BoxedError;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Error that may occur while exchanging requests and results
#[derive(Error, Debug)]
pub enum RpcError {
    /// Provided settings are unusable
    #[error("invalid settings")]
    Settings(#[from] SettingsError),
    /// Broker could not be reached or rejected the credentials
    #[error("unable to connect to the message broker")]
    Connection(#[source] BoxedError),
    /// Declaring or binding an exchange or queue failed
    #[error("unable to set up the broker topology")]
    Topology(#[source] BoxedError),
    /// Publishing of a request or result failed
    #[error("publishing of message failed")]
    Publish(#[source] BoxedError),
    /// Registering, cancelling or settling a consumer failed
    #[error("consuming from queue failed")]
    Consume(#[source] BoxedError),
    /// Broker closed the consumer while waiting
    #[error("consumer has been closed by the broker")]
    ConsumerClosed,
    /// No matching message arrived before the deadline
    #[error("no matching message arrived within {0:?}")]
    Timeout(Duration),
    /// Delivered request had no body after stripping the encoding prefix
    #[error("received an empty request")]
    EmptyRequest,
    /// Delivered message is not a valid envelope
    #[error("received a malformed envelope")]
    MalformedEnvelope(#[source] serde_json::Error),
    /// Payload could not be converted from or into JSON
    #[error("unable to (de)serialize payload")]
    Serialization(#[source] serde_json::Error),
    /// No request with the given identifier is held by the server
    #[error("no pending request with identifier {0}")]
    UnknownRequest(Uuid),
    /// Shard index is outside of the configured number of shards
    #[error("shard {shard} is out of range for {count} result queues")]
    InvalidShard {
        /// Requested shard index
        shard: usize,
        /// Configured number of shards
        count: usize,
    },
}

impl RpcError {
    /// Whether the error signals that nothing arrived in time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether the error is caused by a single bad message or an expired deadline
    /// and the caller may just try again with the same instance
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::EmptyRequest | Self::MalformedEnvelope(_)
        )
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn distinguish_timeouts() {
        let timeout = RpcError::Timeout(Duration::from_secs(2));
        let connection = RpcError::Connection("refused".into());

        assert!(timeout.is_timeout());
        assert!(timeout.is_recoverable());
        assert!(!connection.is_timeout());
        assert!(!connection.is_recoverable());
    }

    #[test]
    fn treat_bad_messages_as_recoverable() {
        let malformed = serde_json::from_str::<serde_json::Value>("{").unwrap_err();

        assert!(RpcError::EmptyRequest.is_recoverable());
        assert!(RpcError::MalformedEnvelope(malformed).is_recoverable());
        assert!(!RpcError::EmptyRequest.is_timeout());
        assert!(!RpcError::Publish("nope".into()).is_recoverable());
    }
}
