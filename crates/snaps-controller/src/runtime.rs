//! Per-snap bookkeeping that lives only as long as the controller.
//!
//! A runtime exists for every snap instantiated since startup, including
//! snaps loaded from persisted state. Stopping a snap keeps its runtime, so
//! the interpreter survives stop/start cycles; only removal and a full state
//! reset drop it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use snaps_execution::{SnapId, Timer, TimerStatus};
use tokio::time::Instant;
use tracing::debug;

use crate::encryption::StateKey;
use crate::error::SnapControllerError;
use crate::fsm::{Interpreter, Machine, SnapStatus};
use crate::request_queue::RequestQueue;
use crate::snap::TruncatedSnap;
use crate::store::SnapStore;

const RUNTIME_TARGET: &str = "snaps_controller::runtime";

/// Install shared by every concurrent caller for the same snap.
pub(crate) type InstallTask = Shared<BoxFuture<'static, Result<TruncatedSnap, SnapControllerError>>>;

/// Start shared by every caller that found the snap stopped.
pub(crate) type StartTask = Shared<BoxFuture<'static, Result<(), SnapControllerError>>>;

/// An inbound request being served.
#[derive(Debug, Clone)]
pub(crate) struct PendingRequest {
    pub(crate) request_id: Value,
    pub(crate) timer: Timer,
}

#[derive(Default)]
struct RpcHandlerState {
    queue: Option<RequestQueue>,
    start: Option<StartTask>,
}

/// Memoized request entry point of one snap: its start slot and the queue of
/// callers waiting on it.
pub(crate) struct RpcHandler {
    max_queue_size: usize,
    state: Mutex<RpcHandlerState>,
}

impl RpcHandler {
    pub(crate) fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            state: Mutex::new(RpcHandlerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RpcHandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins the in-flight start, or installs the one built by `start`.
    /// Returns the task and whether the caller was queued behind it.
    pub(crate) fn join_start(
        &self,
        origin: &str,
        start: impl FnOnce() -> StartTask,
    ) -> Result<(StartTask, bool), SnapControllerError> {
        let mut state = self.lock();
        if let Some(task) = state.start.clone() {
            let max_queue_size = self.max_queue_size;
            state
                .queue
                .get_or_insert_with(|| RequestQueue::new(max_queue_size))
                .increment(origin)?;
            return Ok((task, true));
        }
        let task = start();
        state.start = Some(task.clone());
        Ok((task, false))
    }

    /// Releases a caller's queue slot and clears the start slot when it
    /// still holds `task`.
    pub(crate) fn finish_start(&self, origin: &str, task: &StartTask, queued: bool) {
        let mut state = self.lock();
        if queued
            && let Some(queue) = state.queue.as_mut()
            && let Err(error) = queue.decrement(origin)
        {
            debug!(target: RUNTIME_TARGET, %error, "queue already released");
        }
        if state.start.as_ref().is_some_and(|current| current.ptr_eq(task)) {
            state.start = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn queued(&self, origin: &str) -> usize {
        self.lock().queue.as_ref().map_or(0, |queue| queue.get(origin))
    }
}

/// Runtime record of one snap.
pub(crate) struct SnapRuntime {
    /// Completion of the last request; `None` while requests are in flight
    /// or the snap is stopped.
    pub(crate) last_request: Option<Instant>,
    pub(crate) rpc_handler: Option<Arc<RpcHandler>>,
    pub(crate) install_task: Option<InstallTask>,
    pub(crate) state_key: Option<StateKey>,
    pub(crate) active_references: u64,
    pub(crate) pending_inbound: Vec<PendingRequest>,
    pub(crate) pending_outbound: u64,
    pub(crate) interpreter: Interpreter<SnapStore>,
    pub(crate) stopping: bool,
    /// A boot is in flight in the execution layer.
    pub(crate) starting: bool,
}

impl SnapRuntime {
    fn new(interpreter: Interpreter<SnapStore>) -> Self {
        Self {
            last_request: None,
            rpc_handler: None,
            install_task: None,
            state_key: None,
            active_references: 0,
            pending_inbound: Vec::new(),
            pending_outbound: 0,
            interpreter,
            stopping: false,
            starting: false,
        }
    }

    pub(crate) fn status(&self) -> SnapStatus {
        self.interpreter.state()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.status() == SnapStatus::Running
    }

    /// Memoized request handler.
    pub(crate) fn rpc_handler(&mut self, max_queue_size: usize) -> Arc<RpcHandler> {
        Arc::clone(
            self.rpc_handler
                .get_or_insert_with(|| Arc::new(RpcHandler::new(max_queue_size))),
        )
    }

    /// Records an inbound request and marks the snap busy.
    pub(crate) fn begin_request(&mut self, request_id: Value, timer: Timer) {
        self.pending_inbound.push(PendingRequest { request_id, timer });
        self.last_request = None;
    }

    /// Forgets an inbound request; stamps the idle clock when it was the
    /// last one.
    pub(crate) fn finish_request(&mut self, request_id: &Value) {
        if let Some(position) = self
            .pending_inbound
            .iter()
            .position(|pending| &pending.request_id == request_id)
        {
            self.pending_inbound.remove(position);
        }
        if self.pending_inbound.is_empty() {
            self.last_request = Some(Instant::now());
        }
    }

    /// Freezes running inbound timers while the snap waits on an outbound
    /// request.
    pub(crate) fn begin_outbound(&mut self) {
        self.pending_outbound = self.pending_outbound.saturating_add(1);
        for pending in &self.pending_inbound {
            if pending.timer.status() == TimerStatus::Running
                && let Err(error) = pending.timer.pause()
            {
                debug!(target: RUNTIME_TARGET, %error, "inbound timer not paused");
            }
        }
    }

    /// Thaws paused inbound timers once no outbound request is pending.
    pub(crate) fn finish_outbound(&mut self) {
        self.pending_outbound = self.pending_outbound.saturating_sub(1);
        if self.pending_outbound > 0 {
            return;
        }
        for pending in &self.pending_inbound {
            if pending.timer.status() == TimerStatus::Paused
                && let Err(error) = pending.timer.resume()
            {
                debug!(target: RUNTIME_TARGET, %error, "inbound timer not resumed");
            }
        }
    }

    /// Drops request bookkeeping after the snap stopped.
    pub(crate) fn reset_requests(&mut self) {
        for pending in self.pending_inbound.drain(..) {
            if let Err(error) = pending.timer.cancel() {
                debug!(target: RUNTIME_TARGET, %error, "inbound timer already ended");
            }
        }
        self.pending_outbound = 0;
        self.last_request = None;
    }
}

/// Runtimes of every tracked snap.
#[derive(Default)]
pub(crate) struct RuntimeRegistry {
    runtimes: HashMap<SnapId, SnapRuntime>,
}

impl RuntimeRegistry {
    pub(crate) fn get(&self, snap_id: &SnapId) -> Option<&SnapRuntime> {
        self.runtimes.get(snap_id)
    }

    pub(crate) fn get_mut(&mut self, snap_id: &SnapId) -> Option<&mut SnapRuntime> {
        self.runtimes.get_mut(snap_id)
    }

    pub(crate) fn contains(&self, snap_id: &SnapId) -> bool {
        self.runtimes.contains_key(snap_id)
    }

    /// Returns the runtime of `snap_id`, creating one positioned at
    /// `initial` when missing.
    pub(crate) fn ensure(
        &mut self,
        machine: &Arc<Machine<SnapStore>>,
        snap_id: &SnapId,
        initial: SnapStatus,
    ) -> Result<&mut SnapRuntime, SnapControllerError> {
        if !self.runtimes.contains_key(snap_id) {
            let mut interpreter = Interpreter::new(Arc::clone(machine), snap_id.clone(), initial);
            interpreter.start()?;
            debug!(target: RUNTIME_TARGET, %snap_id, %initial, "runtime created");
            self.runtimes
                .insert(snap_id.clone(), SnapRuntime::new(interpreter));
        }
        self.runtimes
            .get_mut(snap_id)
            .ok_or_else(|| SnapControllerError::NoRuntime {
                snap_id: snap_id.clone(),
            })
    }

    pub(crate) fn remove(&mut self, snap_id: &SnapId) -> Option<SnapRuntime> {
        let mut runtime = self.runtimes.remove(snap_id)?;
        runtime.reset_requests();
        runtime.interpreter.stop();
        Some(runtime)
    }

    pub(crate) fn clear(&mut self) {
        let ids: Vec<SnapId> = self.runtimes.keys().cloned().collect();
        for snap_id in ids {
            self.remove(&snap_id);
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&SnapId, &SnapRuntime)> {
        self.runtimes.iter()
    }
}
