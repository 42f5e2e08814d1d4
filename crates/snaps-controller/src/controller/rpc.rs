//! Request dispatch to snap handlers.

use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use snaps_execution::jsonrpc::next_request_id;
use snaps_execution::{HandlerType, JsonRpcRequest, SnapId, SnapRpcRequest, TimedOut, Timer, with_timer};
use tracing::{debug, warn};

use super::{CONTROLLER_TARGET, SnapController};
use crate::error::SnapControllerError;
use crate::fsm::{SnapStatus, StatusEvent};
use crate::handlers::{assert_result_shape, authorize_request, triage_error};
use crate::runtime::{RpcHandler, StartTask};

/// A handler invocation addressed to a snap.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleRequest {
    /// Target snap.
    pub snap_id: SnapId,
    /// Caller origin.
    pub origin: String,
    /// Exported handler to invoke.
    pub handler: HandlerType,
    /// Request forwarded to the handler.
    pub request: JsonRpcRequest,
}

impl SnapController {
    /// Routes `request` to a snap handler, starting the snap when needed.
    ///
    /// # Errors
    ///
    /// Authorization failures are returned before the snap is touched.
    /// [`SnapControllerError::RequestTimeout`] and unhandled snap errors
    /// also crash the snap; handled snap errors come back as
    /// [`SnapControllerError::Snap`].
    pub async fn handle_request(self: &Arc<Self>, request: HandleRequest) -> Result<Value, SnapControllerError> {
        let HandleRequest {
            snap_id,
            origin,
            handler,
            mut request,
        } = request;
        if !request.has_id() {
            request.id = Value::from(next_request_id());
        }
        if !self.has(&snap_id) {
            return Err(SnapControllerError::NotFound { snap_id });
        }
        let timeout = authorize_request(
            self.permissions.as_ref(),
            &snap_id,
            &origin,
            handler,
            self.config.max_request_time(),
        )?;

        let rpc_handler = self.rpc_handler(&snap_id)?;
        if !self.is_running(&snap_id) {
            self.start_for_request(&rpc_handler, &snap_id, &origin).await?;
        }

        let timer = Timer::new(timeout);
        let request_id = request.id.clone();
        if let Some(runtime) = self.lock().runtimes.get_mut(&snap_id) {
            runtime.begin_request(request_id.clone(), timer.clone());
        }
        debug!(target: CONTROLLER_TARGET, %snap_id, %handler, %origin, "dispatching request");

        let outcome = with_timer(
            &timer,
            self.execution.handle_rpc_request(
                &snap_id,
                SnapRpcRequest {
                    origin,
                    handler,
                    request,
                },
            ),
        )
        .await;
        if let Some(runtime) = self.lock().runtimes.get_mut(&snap_id) {
            runtime.finish_request(&request_id);
        }

        match outcome {
            Err(TimedOut) => {
                warn!(target: CONTROLLER_TARGET, %snap_id, %handler, ?timeout, "request timed out");
                self.crash_snap(&snap_id).await;
                Err(SnapControllerError::RequestTimeout { snap_id, handler })
            }
            Ok(Err(error)) => {
                let triaged = triage_error(error);
                if !triaged.handled {
                    warn!(target: CONTROLLER_TARGET, %snap_id, %handler, error = %triaged.error, "unhandled snap error");
                    self.crash_snap(&snap_id).await;
                }
                Err(triaged.error)
            }
            Ok(Ok(value)) => {
                assert_result_shape(&snap_id, handler, &value)?;
                Ok(value)
            }
        }
    }

    /// The memoized handler of `snap_id`, after checking the snap may
    /// serve requests.
    fn rpc_handler(&self, snap_id: &SnapId) -> Result<Arc<RpcHandler>, SnapControllerError> {
        let mut state = self.lock();
        let snap = state
            .store
            .get(snap_id)
            .ok_or_else(|| SnapControllerError::NotFound {
                snap_id: snap_id.clone(),
            })?;
        if !snap.enabled {
            return Err(SnapControllerError::SnapDisabled {
                snap_id: snap_id.clone(),
            });
        }
        let runtime = state.runtimes.ensure(&self.machine, snap_id, snap.status)?;
        match runtime.status() {
            SnapStatus::Installing => {
                return Err(SnapControllerError::SnapInstalling {
                    snap_id: snap_id.clone(),
                });
            }
            SnapStatus::Updating => {
                return Err(SnapControllerError::SnapUpdating {
                    snap_id: snap_id.clone(),
                });
            }
            SnapStatus::Running | SnapStatus::Stopped | SnapStatus::Crashed => {}
        }
        Ok(runtime.rpc_handler(self.config.max_queue_size))
    }

    /// Starts `snap_id` once for every caller that found it stopped.
    async fn start_for_request(
        self: &Arc<Self>,
        rpc_handler: &RpcHandler,
        snap_id: &SnapId,
        origin: &str,
    ) -> Result<(), SnapControllerError> {
        let (task, queued) = rpc_handler.join_start(origin, || self.start_task(snap_id))?;
        let started = task.clone().await;
        rpc_handler.finish_start(origin, &task, queued);
        started
    }

    fn start_task(self: &Arc<Self>, snap_id: &SnapId) -> StartTask {
        let controller = Arc::clone(self);
        let snap_id = snap_id.clone();
        async move {
            match controller.start_snap(&snap_id).await {
                Err(SnapControllerError::AlreadyRunning { .. }) if controller.is_running(&snap_id) => {
                    Ok(())
                }
                other => other,
            }
        }
        .boxed()
        .shared()
    }

    async fn crash_snap(&self, snap_id: &SnapId) {
        if let Err(error) = self.stop_snap(snap_id, StatusEvent::Crash).await {
            warn!(target: CONTROLLER_TARGET, %snap_id, %error, "failed to stop crashed snap");
        }
    }
}
