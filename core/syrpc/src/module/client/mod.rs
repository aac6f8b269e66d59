//! Publishes a single request and waits for its result

use async_trait::async_trait;
use harness::{Module, ModuleTerminationReason};
use library::communication::broker::Broker;
use library::communication::rpc::Client;
use library::{BoxedError, EmptyResult};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

mod options;

pub use options::Options;

const ECHO: &str = "echo";

#[derive(Debug, Error)]
enum RequesterError {
    #[error("result of echo request differs from the data sent")]
    EchoMismatch { sent: Value, received: Value },
    #[error("attempted to send a request before connecting")]
    NotConnected,
}

/// Sends one request and compares the result of echo requests with the data sent
///
/// Returns the received result.
pub async fn request<B: Broker>(
    client: &mut Client<B>,
    kind: &str,
    data: &Value,
) -> Result<Value, BoxedError> {
    let id = client.put_request(kind, data).await?;
    info!(%id, kind, "Published request");

    let result: Value = client.get_result(id, None).await?;
    info!(%id, %result, "Received result");

    if kind.trim() == ECHO && &result != data {
        return Err(RequesterError::EchoMismatch {
            sent: data.clone(),
            received: result,
        }
        .into());
    }

    Ok(result)
}

/// Module implementation
pub struct Requester {
    options: Options,
    client: Option<Client>,
}

impl Requester {
    /// Creates a new instance from raw parts
    pub fn new(options: Options) -> Self {
        Self {
            options,
            client: None,
        }
    }
}

#[async_trait]
impl Module for Requester {
    async fn pre_startup(&mut self) -> EmptyResult {
        let settings = self.options.rpc.settings();
        self.client = Some(Client::connect(&settings).await?);
        Ok(())
    }

    async fn run(&mut self) -> EmptyResult {
        let client = self.client.as_mut().ok_or(RequesterError::NotConnected)?;

        if let Err(e) = request(client, &self.options.kind, &self.options.data).await {
            if let Some(RequesterError::EchoMismatch { sent, received }) =
                e.downcast_ref::<RequesterError>()
            {
                error!(%sent, %received, "Echo server returned unexpected result");
            }

            return Err(e);
        }

        Ok(())
    }

    async fn post_shutdown(&mut self, termination_reason: &ModuleTerminationReason) {
        if let Some(client) = self.client.take() {
            if let Err(error) = client.close().await {
                warn!(%error, "Failed to close broker connection");
            }
        }

        if termination_reason.is_failure() {
            error!(reason = %termination_reason, "Client terminated with an error");
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;
    use library::communication::implementation::mock::MockBroker;
    use library::communication::rpc::{Server, Settings};
    use library::communication::RpcError;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup() -> (MockBroker, Client<MockBroker>) {
        let broker = MockBroker::default();
        let settings = Settings::new("test", "localhost");
        let client = Client::with_broker(broker.clone(), &settings).await.unwrap();

        (broker, client)
    }

    /// Answers one request with the given data, or with the request data if none is given
    async fn spawn_server(broker: MockBroker, reply: Option<Value>) {
        let settings = Settings::new("test", "localhost");
        let mut server = Server::with_broker(broker, &settings).await.unwrap();

        tokio::spawn(async move {
            let request = server.get_request(None).await.unwrap().unwrap();
            let data = reply.unwrap_or_else(|| request.data().clone());
            server.put_result(request.correlation_id(), &data).await.unwrap();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn receive_echoed_data() {
        let (broker, mut client) = setup().await;
        spawn_server(broker, None).await;

        let result = request(&mut client, "echo", &json!({"foo": "bar", "baz": 9001}))
            .await
            .unwrap();

        assert_eq!(result, json!({"foo": "bar", "baz": 9001}));
    }

    #[tokio::test(start_paused = true)]
    async fn report_echo_mismatches() {
        let (broker, mut client) = setup().await;
        spawn_server(broker, Some(json!({"foo": "baz"}))).await;

        let error = request(&mut client, "echo", &json!({"foo": "bar"}))
            .await
            .unwrap_err();

        assert!(matches!(
            error.downcast_ref::<RequesterError>(),
            Some(RequesterError::EchoMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn accept_arbitrary_results_for_other_types() {
        let (broker, mut client) = setup().await;
        spawn_server(broker, Some(json!(3))).await;

        let result = request(&mut client, "sum", &json!([1, 2])).await.unwrap();

        assert_eq!(result, json!(3));
    }

    #[tokio::test(start_paused = true)]
    async fn time_out_without_server() {
        let (_broker, mut client) = setup().await;

        let error = request(&mut client, "echo", &json!({"foo": "bar"}))
            .await
            .unwrap_err();

        assert!(error.downcast_ref::<RpcError>().unwrap().is_timeout());
    }
}
