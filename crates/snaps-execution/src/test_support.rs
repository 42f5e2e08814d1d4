//! In-process sandbox speaking the command protocol, for tests.
//!
//! The simulated snap reacts to what it is asked:
//!
//! | Input | Behaviour |
//! |---|---|
//! | source containing `hang` | never answers `executeSnap` |
//! | source containing `throw` | fails `executeSnap` |
//! | request `echo` | returns the request params |
//! | request `slow` | waits `delay_ms`, then returns `"done"` |
//! | request `outbound` | brackets a `delay_ms` wait with outbound notifications, then returns `"done"` |
//! | request `hang` | never answers |
//! | request `crash` | pushes `UnhandledError` and never answers |
//! | request `error` | fails with a wrapped JSON-RPC error |
//! | request `throw` | fails with a wrapped non-JSON-RPC value |
//! | anything else | returns `null` |

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::{JoinHandle, JoinSet};

use crate::command::{Command, ExecuteSnapParams, SnapRpcParams};
use crate::error::ExecutionError;
use crate::jsonrpc::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::mux::{COMMAND_STREAM, MuxFrame, RPC_STREAM};
use crate::transport::{ExecutionTransport, MessageStream, WorkerConnection};
use crate::types::{HandlerType, JobId, SnapId};

/// Switches that make the simulated sandbox misbehave.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedBehaviour {
    /// `init_job` never completes.
    pub never_start: bool,
    /// `ping` is never answered.
    pub ignore_ping: bool,
    /// `terminate` is never answered.
    pub ignore_terminate: bool,
}

/// A snap the sandbox evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedSnap {
    /// Job that ran the snap.
    pub job_id: JobId,
    /// The snap.
    pub snap_id: SnapId,
    /// Source it was given.
    pub source_code: String,
    /// Endowments it was given.
    pub endowments: Vec<String>,
}

/// A handler invocation the sandbox received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Target snap.
    pub snap_id: SnapId,
    /// Caller origin.
    pub origin: String,
    /// Invoked handler.
    pub handler: HandlerType,
    /// Request method.
    pub method: String,
}

#[derive(Debug, Default)]
struct Journal {
    started: usize,
    executed: Vec<ExecutedSnap>,
    terminated: Vec<JobId>,
    calls: Vec<RecordedCall>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport producing in-process simulated sandboxes.
#[derive(Debug, Default)]
pub struct SimulatedTransport {
    behaviour: Mutex<SimulatedBehaviour>,
    journal: Arc<Mutex<Journal>>,
}

impl SimulatedTransport {
    /// Creates a well-behaved transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport with the given behaviour.
    #[must_use]
    pub fn with_behaviour(behaviour: SimulatedBehaviour) -> Self {
        let transport = Self::default();
        transport.set_behaviour(behaviour);
        transport
    }

    /// Changes the behaviour of sandboxes created from now on.
    pub fn set_behaviour(&self, behaviour: SimulatedBehaviour) {
        *lock(&self.behaviour) = behaviour;
    }

    /// Number of sandboxes created.
    #[must_use]
    pub fn started(&self) -> usize {
        lock(&self.journal).started
    }

    /// Snaps evaluated so far, oldest first.
    #[must_use]
    pub fn executed(&self) -> Vec<ExecutedSnap> {
        lock(&self.journal).executed.clone()
    }

    /// Jobs torn down so far.
    #[must_use]
    pub fn terminated(&self) -> Vec<JobId> {
        lock(&self.journal).terminated.clone()
    }

    /// Handler invocations received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.journal).calls.clone()
    }
}

/// Handle of a simulated sandbox task.
#[derive(Debug)]
pub struct SimulatedWorker {
    task: JoinHandle<()>,
}

#[async_trait]
impl ExecutionTransport for SimulatedTransport {
    type Worker = SimulatedWorker;

    async fn init_job(
        &self,
        job_id: JobId,
    ) -> Result<WorkerConnection<Self::Worker>, ExecutionError> {
        let behaviour = *lock(&self.behaviour);
        if behaviour.never_start {
            return std::future::pending().await;
        }

        lock(&self.journal).started += 1;
        let (host, sandbox) = MessageStream::pair();
        let task = tokio::spawn(run_sandbox(
            job_id,
            sandbox,
            behaviour,
            Arc::clone(&self.journal),
        ));
        Ok(WorkerConnection {
            worker: SimulatedWorker { task },
            stream: host,
        })
    }

    async fn terminate_job(&self, job_id: JobId, worker: Option<Self::Worker>) {
        lock(&self.journal).terminated.push(job_id);
        if let Some(worker) = worker {
            worker.task.abort();
        }
    }
}

fn send_frame(sink: &UnboundedSender<Value>, name: &str, data: Value) {
    // The host may already be gone; nothing to do then.
    if sink.send(json!({ "name": name, "data": data })).is_err() {
        tracing::trace!("simulated sandbox peer closed");
    }
}

fn send_message<T: serde::Serialize>(sink: &UnboundedSender<Value>, message: &T) {
    match serde_json::to_value(message) {
        Ok(data) => send_frame(sink, COMMAND_STREAM, data),
        Err(error) => tracing::warn!(%error, "simulated sandbox failed to encode message"),
    }
}

fn delay_of(request: &JsonRpcRequest) -> Duration {
    let millis = request
        .params
        .as_ref()
        .and_then(|params| params.get("delay_ms"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Duration::from_millis(millis)
}

struct Sandbox {
    job_id: JobId,
    sink: UnboundedSender<Value>,
    behaviour: SimulatedBehaviour,
    journal: Arc<Mutex<Journal>>,
    calls: JoinSet<()>,
}

async fn run_sandbox(
    job_id: JobId,
    stream: MessageStream,
    behaviour: SimulatedBehaviour,
    journal: Arc<Mutex<Journal>>,
) {
    let MessageStream {
        sender,
        mut receiver,
    } = stream;
    let mut sandbox = Sandbox {
        job_id,
        sink: sender,
        behaviour,
        journal,
        calls: JoinSet::new(),
    };

    while let Some(raw) = receiver.recv().await {
        let Ok(frame) = serde_json::from_value::<MuxFrame>(raw) else {
            continue;
        };
        if frame.name != COMMAND_STREAM {
            continue;
        }
        if let Ok(request) = serde_json::from_value::<JsonRpcRequest>(frame.data) {
            sandbox.handle(&request);
        }
    }
}

impl Sandbox {
    fn reply(&self, id: Value, result: Value) {
        send_message(&self.sink, &JsonRpcResponse::success(id, result));
    }

    fn fail(&self, id: Value, error: JsonRpcError) {
        send_message(&self.sink, &JsonRpcResponse::failure(id, error));
    }

    fn handle(&mut self, request: &JsonRpcRequest) {
        let id = request.id.clone();
        let command = match Command::from_request(request) {
            Ok(command) => command,
            Err(error) => {
                self.fail(id, JsonRpcError::from(&error));
                return;
            }
        };

        match command {
            Command::Ping => {
                if !self.behaviour.ignore_ping {
                    self.reply(id, json!("OK"));
                }
            }
            Command::Terminate => {
                if !self.behaviour.ignore_terminate {
                    self.reply(id, json!("OK"));
                }
            }
            Command::ExecuteSnap(params) => self.execute(id, params),
            Command::SnapRpc(params) => self.invoke(id, params),
        }
    }

    fn execute(&self, id: Value, params: ExecuteSnapParams) {
        if params.source_code.contains("hang") {
            return;
        }
        if params.source_code.contains("throw") {
            self.fail(id, JsonRpcError::internal("snap threw during evaluation"));
            return;
        }

        lock(&self.journal).executed.push(ExecutedSnap {
            job_id: self.job_id,
            snap_id: params.snap_id,
            source_code: params.source_code,
            endowments: params.endowments,
        });
        send_frame(
            &self.sink,
            RPC_STREAM,
            json!({"jsonrpc": "2.0", "method": "snap_ready"}),
        );
        self.reply(id, json!("OK"));
    }

    fn invoke(&mut self, id: Value, params: SnapRpcParams) {
        let SnapRpcParams {
            origin,
            handler,
            request,
            target,
        } = params;
        lock(&self.journal).calls.push(RecordedCall {
            snap_id: target,
            origin,
            handler,
            method: request.method.clone(),
        });

        match request.method.as_str() {
            "echo" => self.reply(id, request.params.unwrap_or(Value::Null)),
            "hang" => {}
            "slow" => {
                let sink = self.sink.clone();
                let delay = delay_of(&request);
                self.calls.spawn(async move {
                    tokio::time::sleep(delay).await;
                    send_message(&sink, &JsonRpcResponse::success(id, json!("done")));
                });
            }
            "outbound" => {
                let sink = self.sink.clone();
                let delay = delay_of(&request);
                self.calls.spawn(async move {
                    send_message(&sink, &JsonRpcNotification::new("OutboundRequest", None));
                    tokio::time::sleep(delay).await;
                    send_message(&sink, &JsonRpcNotification::new("OutboundResponse", None));
                    send_message(&sink, &JsonRpcResponse::success(id, json!("done")));
                });
            }
            "crash" => send_message(
                &self.sink,
                &JsonRpcNotification::new(
                    "UnhandledError",
                    Some(json!({"error": {"code": -32603, "message": "snap crashed"}})),
                ),
            ),
            "error" => self.fail(
                id,
                JsonRpcError::wrap_snap_error(json!({"code": -32000, "message": "handled failure"})),
            ),
            "throw" => self.fail(
                id,
                JsonRpcError::wrap_snap_error(json!({"message": "unhandled failure"})),
            ),
            _ => self.reply(id, Value::Null),
        }
    }
}
