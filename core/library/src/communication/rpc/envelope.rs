//! Wire format of requests and results
//!
//! Both envelopes are JSON objects. Requests look like
//! `{"result_id": "<uuid>", "type": "<string>", "data": <any>}` and results like
//! `{"result_id": "<uuid>", "data": <any>}`. Some producers prefix the body with the
//! name of its encoding followed by a NUL byte, which is stripped before parsing.

use super::constants::CONTENT_TYPE;
use crate::communication::broker::{OutgoingMessage, DELIVERY_MODE_PERSISTENT};
use crate::communication::RpcError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Request as it is sent over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Correlation identifier under which the result is expected
    pub result_id: Uuid,
    /// Kind of request, e.g. `echo`
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary request payload
    #[serde(default)]
    pub data: Value,
}

/// Result as it is sent over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Correlation identifier of the request this result answers
    pub result_id: Uuid,
    /// Arbitrary result payload
    #[serde(default)]
    pub data: Value,
}

/// Removes an optional `<encoding>\0` prefix and surrounding control characters from a body
pub fn strip_encoding_prefix(body: &[u8]) -> &[u8] {
    let body = match body.iter().position(|byte| *byte == 0) {
        Some(separator) => &body[separator + 1..],
        None => return body,
    };

    let start = body
        .iter()
        .position(|byte| !byte.is_ascii_control())
        .unwrap_or(body.len());
    let end = body
        .iter()
        .rposition(|byte| !byte.is_ascii_control())
        .map(|position| position + 1)
        .unwrap_or(start);

    &body[start..end]
}

/// Parses a request body
pub fn decode_request(body: &[u8]) -> Result<RequestEnvelope, RpcError> {
    let body = strip_encoding_prefix(body);

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(RpcError::EmptyRequest);
    }

    serde_json::from_slice(body).map_err(RpcError::MalformedEnvelope)
}

/// Parses a result body
pub fn decode_result(body: &[u8]) -> Result<ResultEnvelope, RpcError> {
    serde_json::from_slice(strip_encoding_prefix(body)).map_err(RpcError::MalformedEnvelope)
}

/// Serializes an envelope into a persistent JSON message tagged with the correlation identifier
pub fn encode<E: Serialize>(
    envelope: &E,
    correlation_id: Uuid,
    encoding: &str,
) -> Result<OutgoingMessage, RpcError> {
    let body = serde_json::to_vec(envelope).map_err(RpcError::Serialization)?;

    Ok(OutgoingMessage {
        body,
        content_type: CONTENT_TYPE.to_owned(),
        content_encoding: encoding.to_owned(),
        delivery_mode: DELIVERY_MODE_PERSISTENT,
        correlation_id: Some(correlation_id.to_string()),
    })
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn request() -> RequestEnvelope {
        RequestEnvelope {
            result_id: Uuid::new_v4(),
            kind: "echo".into(),
            data: json!({"foo": "bar", "baz": 9001, "nested": [1, null, {"deep": true}]}),
        }
    }

    #[test]
    fn roundtrip_requests() {
        let request = request();
        let message = encode(&request, request.result_id, "utf-8").unwrap();

        assert_eq!(decode_request(&message.body).unwrap(), request);
    }

    #[test]
    fn use_wire_field_names() {
        let request = request();
        let message = encode(&request, request.result_id, "utf-8").unwrap();
        let raw: Value = serde_json::from_slice(&message.body).unwrap();

        assert_eq!(raw["result_id"], json!(request.result_id.to_string()));
        assert_eq!(raw["type"], json!("echo"));
        assert_eq!(raw["data"]["baz"], json!(9001));
    }

    #[test]
    fn tag_messages() {
        let request = request();
        let message = encode(&request, request.result_id, "latin-1").unwrap();

        assert_eq!(message.content_type, "application/json");
        assert_eq!(message.content_encoding, "latin-1");
        assert_eq!(message.delivery_mode, 2);
        assert_eq!(
            message.correlation_id,
            Some(request.result_id.to_string())
        );
    }

    #[test]
    fn strip_encoding_prefixes() {
        assert_eq!(strip_encoding_prefix(b"{\"a\":1}"), b"{\"a\":1}");
        assert_eq!(strip_encoding_prefix(b"utf-8\0{\"a\":1}"), b"{\"a\":1}");
        assert_eq!(strip_encoding_prefix(b"utf-8\0\x01{\"a\":1}\x1f"), b"{\"a\":1}");
        assert_eq!(strip_encoding_prefix(b"utf-8\0"), b"");
        assert_eq!(strip_encoding_prefix(b"utf-8\0\x02\x03"), b"");
    }

    #[test]
    fn decode_prefixed_requests() {
        let request = request();
        let mut body = b"utf-8\0".to_vec();
        body.extend(serde_json::to_vec(&request).unwrap());

        assert_eq!(decode_request(&body).unwrap(), request);
    }

    #[test]
    fn reject_empty_requests() {
        assert!(matches!(decode_request(b"utf-8\0"), Err(RpcError::EmptyRequest)));
        assert!(matches!(decode_request(b""), Err(RpcError::EmptyRequest)));
    }

    #[test]
    fn reject_malformed_requests() {
        assert!(matches!(
            decode_request(b"{\"type\": \"echo\"}"),
            Err(RpcError::MalformedEnvelope(_))
        ));
        assert!(matches!(
            decode_request(b"not json"),
            Err(RpcError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn default_missing_data() {
        let id = Uuid::new_v4();
        let body = format!("{{\"result_id\": \"{}\", \"type\": \"ping\"}}", id);
        let request = decode_request(body.as_bytes()).unwrap();

        assert_eq!(request.kind, "ping");
        assert_eq!(request.data, Value::Null);
    }

    #[test]
    fn decode_results() {
        let result = ResultEnvelope {
            result_id: Uuid::new_v4(),
            data: json!(["a", 1]),
        };
        let message = encode(&result, result.result_id, "utf-8").unwrap();

        assert_eq!(decode_result(&message.body).unwrap(), result);
    }
}
