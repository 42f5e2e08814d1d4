//! Command protocol spoken with a sandbox over the `command` substream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::ExecutionError;
use crate::jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, next_request_id, params_object,
};
use crate::mux::SubStream;
use crate::notification::NotificationListener;
use crate::types::{HandlerType, JobId, SnapId};

const COMMAND_TARGET: &str = "snaps_execution::command";

/// Parameters of `executeSnap`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteSnapParams {
    /// Snap being executed.
    pub snap_id: SnapId,
    /// Bundled source.
    pub source_code: String,
    /// Global APIs exposed to the snap.
    pub endowments: Vec<String>,
}

/// Parameters of `snapRpc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapRpcParams {
    /// Origin of the caller.
    pub origin: String,
    /// Handler to invoke.
    pub handler: HandlerType,
    /// Forwarded request.
    pub request: JsonRpcRequest,
    /// Snap that owns the handler.
    pub target: SnapId,
}

/// Requests the host may send to a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Liveness check.
    Ping,
    /// Graceful shutdown.
    Terminate,
    /// Evaluate a snap's source.
    ExecuteSnap(ExecuteSnapParams),
    /// Invoke an exported handler.
    SnapRpc(SnapRpcParams),
}

impl Command {
    /// Wire method name.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Terminate => "terminate",
            Self::ExecuteSnap(_) => "executeSnap",
            Self::SnapRpc(_) => "snapRpc",
        }
    }

    /// Encodes the command as a request with the given ID.
    ///
    /// # Errors
    ///
    /// Returns an error when the parameters cannot be serialised.
    pub fn into_request(self, id: i64) -> Result<JsonRpcRequest, serde_json::Error> {
        let method = self.method();
        let params = match self {
            Self::Ping | Self::Terminate => None,
            Self::ExecuteSnap(params) => Some(serde_json::to_value(params)?),
            Self::SnapRpc(params) => Some(serde_json::to_value(params)?),
        };
        Ok(JsonRpcRequest::with_id(id, method, params))
    }

    /// Decodes a request received by a sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`CommandDecodeError`] for unknown methods or bad parameters.
    pub fn from_request(request: &JsonRpcRequest) -> Result<Self, CommandDecodeError> {
        let invalid = |error: &dyn std::fmt::Display| CommandDecodeError::InvalidParams {
            method: request.method.clone(),
            message: error.to_string(),
        };
        let params = || request.params.clone().unwrap_or(Value::Null);

        match request.method.as_str() {
            "ping" | "terminate" => {
                let empty = params_object(request.params.as_ref()).is_some_and(|map| map.is_empty());
                if !empty {
                    return Err(invalid(&"expected no parameters"));
                }
                Ok(if request.method == "ping" {
                    Self::Ping
                } else {
                    Self::Terminate
                })
            }
            "executeSnap" => serde_json::from_value(params())
                .map(Self::ExecuteSnap)
                .map_err(|error| invalid(&error)),
            "snapRpc" => serde_json::from_value(params())
                .map(Self::SnapRpc)
                .map_err(|error| invalid(&error)),
            other => Err(CommandDecodeError::UnknownMethod {
                method: other.to_owned(),
            }),
        }
    }
}

/// A request could not be decoded into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandDecodeError {
    /// The method is not part of the command protocol.
    #[error("unknown command \"{method}\"")]
    UnknownMethod {
        /// The offending method.
        method: String,
    },
    /// The parameters do not match the command.
    #[error("invalid parameters for \"{method}\": {message}")]
    InvalidParams {
        /// The command.
        method: String,
        /// Decoder message.
        message: String,
    },
}

impl From<&CommandDecodeError> for JsonRpcError {
    fn from(error: &CommandDecodeError) -> Self {
        match error {
            CommandDecodeError::UnknownMethod { method } => Self::method_not_found(method),
            CommandDecodeError::InvalidParams { .. } => Self::invalid_params(error.to_string()),
        }
    }
}

type PendingMap = HashMap<i64, oneshot::Sender<JsonRpcResponse>>;

/// Request/response client over a job's command substream.
#[derive(Debug, Clone)]
pub(crate) struct CommandClient {
    stream: SubStream,
    pending: Arc<Mutex<PendingMap>>,
}

impl CommandClient {
    pub(crate) fn new(stream: SubStream) -> Self {
        Self {
            stream,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sends `command` and waits for its response.
    pub(crate) async fn request(&self, command: Command) -> Result<Value, ExecutionError> {
        let id = next_request_id();
        let method = command.method();
        let request = command.into_request(id)?;
        let (sender, receiver) = oneshot::channel();
        let _pending = PendingGuard::register(self, id, sender);

        debug!(target: COMMAND_TARGET, id, method, "sending command");
        self.stream.send(serde_json::to_value(&request)?)?;

        let response = receiver.await.map_err(|_| ExecutionError::Disconnected)?;
        response.into_result().map_err(ExecutionError::from)
    }

    /// Hands a response to the request waiting for it.
    pub(crate) fn resolve(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.as_i64() else {
            warn!(target: COMMAND_TARGET, id = %response.id, "dropping response with foreign ID");
            return;
        };
        let Some(sender) = self.lock().remove(&id) else {
            warn!(target: COMMAND_TARGET, id, "dropping response without pending command");
            return;
        };
        if sender.send(response).is_err() {
            trace!(target: COMMAND_TARGET, id, "command caller went away");
        }
    }

    /// Fails every pending command with [`ExecutionError::Disconnected`].
    pub(crate) fn disconnect(&self) {
        self.lock().clear();
    }
}

/// Removes a pending entry when the waiting request is dropped.
struct PendingGuard<'a> {
    client: &'a CommandClient,
    id: i64,
}

impl<'a> PendingGuard<'a> {
    fn register(
        client: &'a CommandClient,
        id: i64,
        sender: oneshot::Sender<JsonRpcResponse>,
    ) -> Self {
        client.lock().insert(id, sender);
        Self { client, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.client.lock().remove(&self.id);
    }
}

/// Reads the command substream: responses go to the client, notifications to
/// the listener. Pending commands fail once the substream closes.
pub(crate) fn spawn_command_pump(
    job_id: JobId,
    mut inbound: UnboundedReceiver<Value>,
    client: CommandClient,
    mut listener: NotificationListener,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            match JsonRpcMessage::from_value(message) {
                Ok(JsonRpcMessage::Response(response)) => client.resolve(response),
                Ok(JsonRpcMessage::Notification(notification)) => listener.handle(notification),
                Ok(JsonRpcMessage::Request(request)) => warn!(
                    target: COMMAND_TARGET,
                    %job_id,
                    method = %request.method,
                    "ignoring request sent by sandbox"
                ),
                Err(error) => warn!(
                    target: COMMAND_TARGET,
                    %job_id,
                    %error,
                    "dropping malformed command message"
                ),
            }
        }
        client.disconnect();
        debug!(target: COMMAND_TARGET, %job_id, "command stream closed");
    })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::mux::{COMMAND_STREAM, MuxFrame};

    fn execute_params() -> ExecuteSnapParams {
        ExecuteSnapParams {
            snap_id: SnapId::from("npm:example"),
            source_code: "module.exports = {}".to_owned(),
            endowments: vec!["console".to_owned()],
        }
    }

    #[rstest]
    fn execute_snap_uses_camel_case_params() {
        let request = Command::ExecuteSnap(execute_params())
            .into_request(3)
            .expect("encode");
        assert_eq!(request.method, "executeSnap");
        assert_eq!(
            request.params,
            Some(json!({
                "snapId": "npm:example",
                "sourceCode": "module.exports = {}",
                "endowments": ["console"],
            }))
        );
    }

    #[rstest]
    #[case(Command::Ping)]
    #[case(Command::Terminate)]
    #[case(Command::ExecuteSnap(execute_params()))]
    #[case(Command::SnapRpc(SnapRpcParams {
        origin: "https://dapp.example".to_owned(),
        handler: HandlerType::OnRpcRequest,
        request: JsonRpcRequest::with_id(1, "hello", None),
        target: SnapId::from("npm:example"),
    }))]
    fn decodes_what_it_encodes(#[case] command: Command) {
        let request = command.clone().into_request(1).expect("encode");
        assert_eq!(Command::from_request(&request), Ok(command));
    }

    #[rstest]
    fn rejects_unknown_methods() {
        let request = JsonRpcRequest::with_id(1, "eval", None);
        let error = Command::from_request(&request).expect_err("unknown");
        assert_eq!(JsonRpcError::from(&error).code, crate::jsonrpc::METHOD_NOT_FOUND);
    }

    #[rstest]
    fn rejects_parameters_on_ping() {
        let request = JsonRpcRequest::with_id(1, "ping", Some(json!({"x": 1})));
        assert!(matches!(
            Command::from_request(&request),
            Err(CommandDecodeError::InvalidParams { .. })
        ));
    }

    #[tokio::test]
    async fn request_resolves_with_matching_response() {
        let (raw_tx, mut raw_rx) = unbounded_channel();
        let client = CommandClient::new(SubStream::new(COMMAND_STREAM, raw_tx));

        let responder = client.clone();
        let answer = tokio::spawn(async move {
            let frame: MuxFrame =
                serde_json::from_value(raw_rx.recv().await.expect("frame")).expect("decode");
            let request: JsonRpcRequest = serde_json::from_value(frame.data).expect("request");
            responder.resolve(JsonRpcResponse::success(request.id, json!("OK")));
        });

        let result = client.request(Command::Ping).await.expect("ping");
        answer.await.expect("responder");
        assert_eq!(result, json!("OK"));
        assert!(client.lock().is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_pending_requests() {
        let (raw_tx, _raw_rx) = unbounded_channel();
        let client = CommandClient::new(SubStream::new(COMMAND_STREAM, raw_tx));

        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.request(Command::Terminate).await })
        };
        while client.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        client.disconnect();

        let result = waiter.await.expect("join");
        assert_eq!(result, Err(ExecutionError::Disconnected));
    }
}
