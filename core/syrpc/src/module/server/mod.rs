//! Answers echo requests, either once or until the process is stopped

use async_trait::async_trait;
use harness::{Module, ModuleTerminationReason};
use library::communication::broker::Broker;
use library::communication::rpc::{
    RequestProcessor, Responder, ResponderError, ServeOutcome, Server,
};
use library::EmptyResult;
use thiserror::Error;
use tracing::{debug, error, info, warn};

mod echo;
mod options;

pub use echo::EchoProcessor;
pub use options::Options;

#[derive(Debug, Error)]
#[error("attempted to serve requests before connecting")]
struct NotConnected;

/// Serves requests until one has been handled or, in forever mode, until an
/// unrecoverable error occurs
///
/// Outside of forever mode, running into the timeout without receiving a request is not an error.
pub async fn serve<P: RequestProcessor, B: Broker>(
    responder: &mut Responder<P, B>,
    forever: bool,
) -> Result<(), ResponderError> {
    loop {
        match responder.serve_one(None).await {
            Ok(ServeOutcome::Answered(id)) => info!(%id, "Answered request"),
            Ok(ServeOutcome::Ignored(id)) => info!(%id, "Ignored request"),
            Ok(ServeOutcome::Idle) => debug!("No request received"),
            Err(error) if forever && error.is_recoverable() => {
                warn!(%error, "Failed to serve request");
            }
            Err(error) => return Err(error),
        }

        if !forever {
            return Ok(());
        }
    }
}

/// Module implementation
pub struct EchoServer {
    options: Options,
    responder: Option<Responder<EchoProcessor>>,
}

impl EchoServer {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            responder: None,
        }
    }
}

#[async_trait]
impl Module for EchoServer {
    async fn pre_startup(&mut self) -> EmptyResult {
        let settings = self.options.settings();
        let server = Server::connect(&settings).await?;

        info!(
            app = %settings.app_name,
            ack_mode = %settings.ack_mode,
            forever = self.options.forever,
            "Listening for requests"
        );

        self.responder = Some(Responder::new(server, EchoProcessor));
        Ok(())
    }

    async fn run(&mut self) -> EmptyResult {
        let responder = self.responder.as_mut().ok_or(NotConnected)?;
        serve(responder, self.options.forever).await?;
        Ok(())
    }

    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        if let Some(responder) = self.responder.take() {
            if let Err(error) = responder.close().await {
                warn!(%error, "Failed to close broker connection");
            }
        }

        if termination_reason.is_failure() {
            error!(reason = %termination_reason, "Server terminated with an error");
        }
    }
}
