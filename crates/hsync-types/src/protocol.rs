//! The JSON wire protocol spoken with remote indexing servers: framed requests,
//! responses, and server-pushed notifications, one object per line.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message id, assigned by [`crate::network::NetworkConstants`]-external callers and
/// strictly monotonic process-wide (engine invariant 1).
pub type MessageId = u64;

/// An outgoing client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Monotonic request id, echoed back in the matching response.
    pub id: MessageId,
    /// RPC method name, e.g. `blockchain.headers.subscribe`.
    pub method: String,
    /// Positional parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

impl Request {
    /// Construct a new request.
    pub fn new(id: MessageId, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }
}

/// A server-reported RPC error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    /// Server-defined error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// A response to a previously-sent request, matched to it by [`MessageId`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this responds to.
    pub id: MessageId,
    /// Successful result payload, if no error occurred.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload, if the server rejected the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Whether the server reported an error for this request.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A server-pushed notification: no request id, a method name, and parameters.
///
/// Subscription notifications are canonicalized (distilled spec §4.D) into the same
/// shape as the subscribe response before being handed to router callbacks; this type
/// carries the *raw* wire shape, before canonicalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// RPC method name.
    pub method: String,
    /// Notification parameters.
    #[serde(default)]
    pub params: Vec<Value>,
}

/// A decoded inbound frame: either a matched response or a server-pushed notification.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A response to a request we sent.
    Response(Response),
    /// An unsolicited server push.
    Notification(Notification),
}

/// Parse one decoded JSON object into a [`Frame`].
///
/// A frame carrying an `id` field is a response; one without is a notification. This
/// mirrors the wire contract in distilled spec §6 rather than re-deriving it from
/// `serde(untagged)`, since `id` absence/presence - not shape - is the discriminant.
pub fn classify(value: Value) -> Result<Frame, serde_json::Error> {
    if value.get("id").is_some() {
        Ok(Frame::Response(serde_json::from_value(value)?))
    } else {
        Ok(Frame::Notification(serde_json::from_value(value)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_response_by_id_presence() {
        let v = json!({"id": 1, "result": 100});
        assert!(matches!(classify(v).unwrap(), Frame::Response(_)));
    }

    #[test]
    fn classifies_notification_without_id() {
        let v = json!({"method": "blockchain.headers.subscribe", "params": [{"height": 1}]});
        assert!(matches!(classify(v).unwrap(), Frame::Notification(_)));
    }

    #[test]
    fn response_with_error_reports_is_error() {
        let v = json!({"id": 1, "error": {"code": -1, "message": "nope"}});
        let Frame::Response(r) = classify(v).unwrap() else {
            panic!("expected response")
        };
        assert!(r.is_error());
    }
}
