//! Correlation protocol realising request and response on top of a [`Broker`](super::broker::Broker)
//!
//! Requests are published to a single queue per application and carry a correlation
//! identifier. Results are routed into one of a fixed number of shard queues, picked by
//! hashing the correlation identifier with a key shared by all participants. A waiting
//! [`Client`] consumes its shard and returns every result that is not addressed to it back
//! to the broker.
//!
//! Acknowledgement of requests is controlled by the [`AckMode`]. By default a request is
//! acknowledged as soon as it has been received, so a crash while processing loses it.
//! [`AckMode::OnCompletion`] defers the acknowledgement until a result has been published.

pub mod constants;
pub mod envelope;
pub mod identifier;

mod client;
mod responder;
mod server;
mod settings;
mod shard;
mod topology;

pub use client::*;
pub use responder::*;
pub use server::*;
pub use settings::*;
pub use shard::*;
pub use topology::*;

#[cfg(test)]
mod does {
    use super::*;
    use crate::communication::implementation::mock::MockBroker;
    use crate::communication::RpcError;
    use crate::BoxedError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl RequestProcessor for Echo {
        async fn process(&self, request: &IncomingRequest) -> Result<Option<Value>, BoxedError> {
            Ok(Some(request.data().clone()))
        }
    }

    fn settings() -> Settings {
        Settings::new("scenario", "localhost")
    }

    async fn spawn_responder(broker: MockBroker, settings: &Settings, requests: usize) {
        let server = Server::with_broker(broker, settings).await.unwrap();
        let mut responder = Responder::new(server, Echo);

        tokio::spawn(async move {
            let mut answered = 0;
            while answered < requests {
                if let ServeOutcome::Answered(_) = responder.serve_one(None).await.unwrap() {
                    answered += 1;
                }
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn echo_requests() {
        let broker = MockBroker::default();
        spawn_responder(broker.clone(), &settings(), 1).await;
        let mut client = Client::with_broker(broker.clone(), &settings()).await.unwrap();

        let payload = json!({"foo": "bar", "baz": 9001});
        let result: Value = client
            .call("echo", &payload, Some(Duration::from_secs(2)))
            .await
            .unwrap();

        assert_eq!(result, payload);
    }

    #[tokio::test(start_paused = true)]
    async fn serve_clients_sharing_a_shard() {
        let broker = MockBroker::default();
        let mut settings = settings();
        settings.amq_num_queues = 1;
        spawn_responder(broker.clone(), &settings, 2).await;

        let mut first = Client::with_broker(broker.clone(), &settings).await.unwrap();
        let mut second = Client::with_broker(broker.clone(), &settings).await.unwrap();

        let first_id = first.put_request("echo", "first").await.unwrap();
        let second_id = second.put_request("echo", "second").await.unwrap();

        let (first_result, second_result) = tokio::join!(
            first.get_result::<String>(first_id, Some(Duration::from_secs(5))),
            second.get_result::<String>(second_id, Some(Duration::from_secs(5)))
        );

        assert_eq!(first_result.unwrap(), "first");
        assert_eq!(second_result.unwrap(), "second");
        assert_eq!(broker.queue_len("scenario_result_queue_0"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn time_out_without_server() {
        let broker = MockBroker::default();
        let mut client = Client::with_broker(broker, &settings()).await.unwrap();

        let start = tokio::time::Instant::now();
        let result = client
            .call::<_, Value>("echo", &json!({}), Some(Duration::from_secs(2)))
            .await;

        assert!(matches!(result, Err(RpcError::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
