use async_trait::async_trait;
use library::communication::rpc::{IncomingRequest, RequestProcessor};
use library::BoxedError;
use serde_json::Value;
use tracing::debug;

/// Answers `echo` requests with their data and leaves everything else unanswered
pub struct EchoProcessor;

#[async_trait]
impl RequestProcessor for EchoProcessor {
    async fn process(&self, request: &IncomingRequest) -> Result<Option<Value>, BoxedError> {
        if request.kind() == "echo" {
            Ok(Some(request.data().clone()))
        } else {
            debug!(kind = request.kind(), "Unsupported request type");
            Ok(None)
        }
    }
}
