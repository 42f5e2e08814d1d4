//! JSON-RPC 2.0 message types for the command and snap RPC channels.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Protocol version carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error.
pub const INTERNAL_ERROR: i64 = -32603;
/// A snap threw while handling a request; `data.cause` carries what it threw.
pub const WRAPPED_SNAP_ERROR: i64 = -31001;
/// A snap deliberately returned a snap error.
pub const SNAP_ERROR: i64 = -31002;

/// Thread-safe request ID generator.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Generates a unique request ID.
#[must_use]
pub fn next_request_id() -> i64 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

fn version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// A JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version, always "2.0".
    #[serde(default = "version")]
    pub jsonrpc: String,
    /// Request identifier; `null` when the caller did not assign one.
    #[serde(default)]
    pub id: Value,
    /// The method to invoke.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a new request with an auto-generated ID.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::with_id(next_request_id(), method, params)
    }

    /// Creates a new request with a specific ID.
    #[must_use]
    pub fn with_id(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: version(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Returns `true` when the caller assigned an ID.
    #[must_use]
    pub fn has_id(&self) -> bool {
        !self.id.is_null()
    }
}

/// A JSON-RPC 2.0 notification (no response expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Protocol version, always "2.0".
    #[serde(default = "version")]
    pub jsonrpc: String,
    /// The notification name.
    pub method: String,
    /// Optional parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: version(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version.
    #[serde(default = "version")]
    pub jsonrpc: String,
    /// Request identifier this response corresponds to.
    #[serde(default)]
    pub id: Value,
    /// The result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Builds a successful response.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Builds an error response.
    #[must_use]
    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: version(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Converts the response into the carried result or error.
    ///
    /// A response with neither field resolves to `null`.
    ///
    /// # Errors
    ///
    /// Returns the carried [`JsonRpcError`] when the response is a failure.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code: {code})")]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Creates an error without data.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    /// Creates an invalid-params error.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_PARAMS, message)
    }

    /// Creates a method-not-found error.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    /// Attaches data to the error.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Wraps whatever a snap threw so it can cross the sandbox boundary.
    #[must_use]
    pub fn wrap_snap_error(cause: Value) -> Self {
        Self::new(WRAPPED_SNAP_ERROR, "Wrapped Snap Error").with_data(json!({ "cause": cause }))
    }

    /// Returns the thrown value when this is a wrapped snap error.
    #[must_use]
    pub fn wrapped_cause(&self) -> Option<&Value> {
        if self.code != WRAPPED_SNAP_ERROR {
            return None;
        }
        self.data.as_ref()?.get("cause")
    }

    /// Interprets a JSON value as an error object, if it has the right shape.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let code = object.get("code")?.as_i64()?;
        let message = object.get("message")?.as_str()?;
        Some(Self {
            code,
            message: message.to_owned(),
            data: object.get("data").cloned(),
        })
    }
}

/// Parsed JSON-RPC message classified by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// A response to an earlier request.
    Response(JsonRpcResponse),
    /// A request from the peer.
    Request(JsonRpcRequest),
    /// A notification from the peer.
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Classifies a raw JSON value.
    ///
    /// # Errors
    ///
    /// Returns an error when the value is not a JSON-RPC object.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let Value::Object(object) = value else {
            return Err(serde::de::Error::custom("JSON-RPC message must be an object"));
        };
        let has_method = object.contains_key("method");
        let has_id = object.get("id").is_some_and(|id| !id.is_null());
        let value = Value::Object(object);

        match (has_method, has_id) {
            (true, true) => serde_json::from_value(value).map(Self::Request),
            (true, false) => serde_json::from_value(value).map(Self::Notification),
            (false, _) => serde_json::from_value(value).map(Self::Response),
        }
    }
}

/// Returns `params` as an object, treating a missing value as empty.
pub(crate) fn params_object(params: Option<&Value>) -> Option<Map<String, Value>> {
    match params {
        None | Some(Value::Null) => Some(Map::new()),
        Some(Value::Object(object)) => Some(object.clone()),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn serialises_request_without_params() {
        let request = JsonRpcRequest::with_id(42, "ping", None);
        let json = serde_json::to_string(&request).expect("serialization failed");

        assert!(json.contains(r#""jsonrpc":"2.0""#));
        assert!(json.contains(r#""id":42"#));
        assert!(json.contains(r#""method":"ping""#));
        assert!(!json.contains("params"));
    }

    #[rstest]
    fn request_ids_increase() {
        let first = next_request_id();
        let second = next_request_id();
        assert!(second > first);
    }

    #[rstest]
    fn deserialises_error_response_with_data() {
        let json = r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32602,"message":"Invalid params","data":{"details":"missing field"}}}"#;
        let response: JsonRpcResponse = serde_json::from_str(json).expect("parse failed");

        let error = response.into_result().expect_err("error expected");
        assert_eq!(error.code, INVALID_PARAMS);
        assert_eq!(error.to_string(), "Invalid params (code: -32602)");
    }

    #[rstest]
    fn empty_response_resolves_to_null() {
        let response: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7}"#).expect("parse failed");
        assert_eq!(response.into_result().expect("result"), Value::Null);
    }

    #[rstest]
    #[case(json!({"jsonrpc":"2.0","id":1,"method":"ping"}), "request")]
    #[case(json!({"jsonrpc":"2.0","method":"OutboundRequest"}), "notification")]
    #[case(json!({"jsonrpc":"2.0","id":null,"method":"OutboundResponse"}), "notification")]
    #[case(json!({"jsonrpc":"2.0","id":1,"result":"OK"}), "response")]
    fn classifies_messages(#[case] raw: Value, #[case] expected: &str) {
        let kind = match JsonRpcMessage::from_value(raw).expect("classify") {
            JsonRpcMessage::Request(_) => "request",
            JsonRpcMessage::Notification(_) => "notification",
            JsonRpcMessage::Response(_) => "response",
        };
        assert_eq!(kind, expected);
    }

    #[rstest]
    fn rejects_non_object_messages() {
        assert!(JsonRpcMessage::from_value(json!([1, 2, 3])).is_err());
    }

    #[rstest]
    fn wrapped_errors_expose_their_cause() {
        let error = JsonRpcError::wrap_snap_error(json!({"code": -32000, "message": "nope"}));
        let cause = error.wrapped_cause().expect("cause");
        let unwrapped = JsonRpcError::from_value(cause).expect("json-rpc cause");
        assert_eq!(unwrapped.code, -32000);
        assert!(JsonRpcError::internal("x").wrapped_cause().is_none());
    }

    #[rstest]
    fn from_value_requires_code_and_message() {
        assert!(JsonRpcError::from_value(&json!({"message": "thrown"})).is_none());
        assert!(JsonRpcError::from_value(&json!({"code": 1})).is_none());
    }
}
