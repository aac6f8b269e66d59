use super::server::{IncomingRequest, Server};
use super::settings::AckMode;
use crate::communication::broker::Broker;
use crate::communication::implementation::amqp::AmqpBroker;
use crate::communication::RpcError;
use crate::BoxedError;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Business logic which turns requests into results
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Processes a request. Returning `None` settles the request without sending a result.
    async fn process(&self, request: &IncomingRequest) -> Result<Option<Value>, BoxedError>;
}

/// What happened during one call to [`Responder::serve_one`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// No request arrived in time
    Idle,
    /// A result has been published for the request with the given identifier
    Answered(Uuid),
    /// The processor chose not to answer the request with the given identifier
    Ignored(Uuid),
}

/// Error that may occur while serving a request
#[derive(Error, Debug)]
pub enum ResponderError {
    /// Waiting for or decoding of a request failed
    #[error("unable to fetch request")]
    Fetching(#[source] RpcError),
    /// Processor returned an error. The request has been abandoned, or dropped if it failed before.
    #[error("processing of request {id} failed")]
    ProcessingFailed {
        /// Correlation identifier of the request
        id: Uuid,
        /// Error returned by the processor
        #[source]
        source: BoxedError,
    },
    /// Result could not be published, the request has been abandoned
    #[error("unable to deliver result for request {id}")]
    ResponseUndeliverable {
        /// Correlation identifier of the request
        id: Uuid,
        /// Underlying error
        #[source]
        source: RpcError,
    },
}

impl ResponderError {
    /// Whether the responder may continue serving requests after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetching(e) => e.is_recoverable(),
            Self::ProcessingFailed { .. } => true,
            Self::ResponseUndeliverable { .. } => false,
        }
    }
}

/// Couples a [`Server`] with a [`RequestProcessor`]
pub struct Responder<P, B: Broker = AmqpBroker> {
    server: Server<B>,
    processor: P,
}

impl<P: RequestProcessor, B: Broker> Responder<P, B> {
    /// Creates a new instance from raw parts
    pub fn new(server: Server<B>, processor: P) -> Self {
        Self { server, processor }
    }

    /// Waits for one request, processes it and publishes the result
    #[instrument(skip(self))]
    pub async fn serve_one(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<ServeOutcome, ResponderError> {
        let request = match self.server.get_request(timeout).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(ServeOutcome::Idle),
            Err(e) => return Err(ResponderError::Fetching(e)),
        };

        let id = request.correlation_id();

        match self.processor.process(&request).await {
            Ok(Some(result)) => {
                if let Err(source) = self.server.put_result(id, &result).await {
                    self.abandon(id).await;
                    return Err(ResponderError::ResponseUndeliverable { id, source });
                }

                Ok(ServeOutcome::Answered(id))
            }
            Ok(None) => {
                debug!(%id, kind = request.kind(), "Request left unanswered");

                if self.server.ack_mode() == AckMode::OnCompletion {
                    if let Err(source) = self.server.discard(id).await {
                        return Err(ResponderError::ResponseUndeliverable { id, source });
                    }
                }

                Ok(ServeOutcome::Ignored(id))
            }
            Err(source) if request.is_redelivered() => {
                self.drop_request(id).await;
                Err(ResponderError::ProcessingFailed { id, source })
            }
            Err(source) => {
                self.abandon(id).await;
                Err(ResponderError::ProcessingFailed { id, source })
            }
        }
    }

    async fn abandon(&mut self, id: Uuid) {
        if self.server.ack_mode() != AckMode::OnCompletion {
            return;
        }

        if let Err(error) = self.server.abandon(id).await {
            warn!(%id, %error, "Failed to abandon request");
        }
    }

    /// Drops a request which failed on redelivery so it does not circulate forever
    async fn drop_request(&mut self, id: Uuid) {
        if self.server.ack_mode() != AckMode::OnCompletion {
            return;
        }

        warn!(%id, "Dropping request which failed repeatedly");

        if let Err(error) = self.server.reject(id).await {
            warn!(%id, %error, "Failed to drop request");
        }
    }

    /// Underlying server
    pub fn server(&self) -> &Server<B> {
        &self.server
    }

    /// Stops serving and closes the connection
    pub async fn close(self) -> Result<(), RpcError> {
        self.server.close().await
    }
}
