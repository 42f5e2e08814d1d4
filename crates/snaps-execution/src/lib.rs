//! Execution layer for snaps.
//!
//! A snap runs inside a sandbox reached through an [`ExecutionTransport`]:
//! an iframe, a worker, a child process, or anything else that can carry JSON
//! messages both ways. The [`ExecutionService`] turns that raw channel into a
//! *job*:
//!
//! - the stream is multiplexed into a `command` substream and a `jsonRpc`
//!   substream ([`mux`]);
//! - the command substream speaks a small JSON-RPC 2.0 protocol
//!   ([`Command`]) with `ping`, `terminate`, `executeSnap` and `snapRpc`;
//! - notifications pushed by the sandbox ([`JobNotification`]) are published
//!   as [`ExecutionEvent`]s keyed by snap;
//! - the `jsonRpc` substream is handed to a [`SnapProvider`].
//!
//! Every bounded step uses a [`Timer`], so start, ping, execution and
//! termination budgets are independent and pausable.

pub mod command;
pub mod error;
mod jobs;
pub mod jsonrpc;
pub mod mux;
pub mod notification;
pub mod service;
pub mod timer;
pub mod transport;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

#[cfg(test)]
mod tests;

pub use self::command::{Command, CommandDecodeError, ExecuteSnapParams, SnapRpcParams};
pub use self::error::ExecutionError;
pub use self::jsonrpc::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
pub use self::mux::{ProviderStream, SubStream};
pub use self::notification::{ExecutionEvent, JobNotification};
pub use self::service::{ExecutionEnvironment, ExecutionService};
pub use self::timer::{TimedOut, Timer, TimerError, TimerStatus, with_timeout, with_timer};
pub use self::transport::{
    ExecutionTransport, MessageStream, NoProvider, SnapProvider, WorkerConnection,
};
pub use self::types::{HandlerType, JobId, SnapExecutionData, SnapId, SnapRpcRequest};
