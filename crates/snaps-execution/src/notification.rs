//! Notifications pushed by a sandbox and the events they become.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::jobs::SnapJobMap;
use crate::jsonrpc::{JsonRpcError, JsonRpcNotification};
use crate::types::{JobId, SnapId};

const NOTIFICATION_TARGET: &str = "snaps_execution::notification";

/// Notifications a sandbox may push on the command substream.
#[derive(Debug, Clone, PartialEq)]
pub enum JobNotification {
    /// The snap started a call into the host.
    OutboundRequest,
    /// A call into the host completed.
    OutboundResponse,
    /// The snap crashed outside any request.
    UnhandledError {
        /// What the snap reported.
        error: JsonRpcError,
    },
}

/// A notification could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationDecodeError {
    /// The method is not a known notification.
    #[error("unknown notification \"{method}\"")]
    UnknownMethod {
        /// The offending method.
        method: String,
    },
    /// `UnhandledError` arrived without an `error` parameter.
    #[error("UnhandledError notification carries no error")]
    MissingError,
}

impl JobNotification {
    /// Decodes a raw notification.
    ///
    /// An `UnhandledError` whose payload is not a JSON-RPC error object is
    /// reported as an internal error carrying the payload as its message.
    ///
    /// # Errors
    ///
    /// Returns [`NotificationDecodeError`] for unknown or incomplete
    /// notifications.
    pub fn from_notification(
        notification: &JsonRpcNotification,
    ) -> Result<Self, NotificationDecodeError> {
        match notification.method.as_str() {
            "OutboundRequest" => Ok(Self::OutboundRequest),
            "OutboundResponse" => Ok(Self::OutboundResponse),
            "UnhandledError" => {
                let payload = notification
                    .params
                    .as_ref()
                    .and_then(|params| params.get("error"))
                    .filter(|error| !error.is_null())
                    .ok_or(NotificationDecodeError::MissingError)?;
                let error = JsonRpcError::from_value(payload).unwrap_or_else(|| {
                    let message = match payload {
                        Value::String(message) => message.clone(),
                        other => other.to_string(),
                    };
                    JsonRpcError::internal(message)
                });
                Ok(Self::UnhandledError { error })
            }
            other => Err(NotificationDecodeError::UnknownMethod {
                method: other.to_owned(),
            }),
        }
    }
}

/// Events published by the execution layer, keyed by snap.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    /// The snap is waiting on the host.
    OutboundRequest {
        /// Emitting snap.
        snap_id: SnapId,
    },
    /// The host answered the snap.
    OutboundResponse {
        /// Emitting snap.
        snap_id: SnapId,
    },
    /// The snap crashed asynchronously.
    UnhandledError {
        /// Crashed snap.
        snap_id: SnapId,
        /// Reported error.
        error: JsonRpcError,
    },
}

/// Turns one job's notifications into [`ExecutionEvent`]s.
///
/// Only the first unhandled error of a job is published.
pub(crate) struct NotificationListener {
    job_id: JobId,
    mappings: Arc<Mutex<SnapJobMap>>,
    events: broadcast::Sender<ExecutionEvent>,
    forwards_unhandled: bool,
}

impl NotificationListener {
    pub(crate) fn new(
        job_id: JobId,
        mappings: Arc<Mutex<SnapJobMap>>,
        events: broadcast::Sender<ExecutionEvent>,
    ) -> Self {
        Self {
            job_id,
            mappings,
            events,
            forwards_unhandled: true,
        }
    }

    pub(crate) fn handle(&mut self, notification: JsonRpcNotification) {
        let job_id = self.job_id;
        let decoded = match JobNotification::from_notification(&notification) {
            Ok(decoded) => decoded,
            Err(error) => {
                warn!(target: NOTIFICATION_TARGET, %job_id, %error, "ignoring notification");
                return;
            }
        };

        let snap_id = self
            .mappings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snap_for(job_id);
        let Some(snap_id) = snap_id else {
            debug!(target: NOTIFICATION_TARGET, %job_id, "notification from unmapped job");
            return;
        };

        let event = match decoded {
            JobNotification::OutboundRequest => ExecutionEvent::OutboundRequest { snap_id },
            JobNotification::OutboundResponse => ExecutionEvent::OutboundResponse { snap_id },
            JobNotification::UnhandledError { error } => {
                if !self.forwards_unhandled {
                    debug!(
                        target: NOTIFICATION_TARGET,
                        %job_id,
                        %snap_id,
                        "dropping repeated unhandled error"
                    );
                    return;
                }
                self.forwards_unhandled = false;
                warn!(target: NOTIFICATION_TARGET, %job_id, %snap_id, %error, "snap crashed");
                ExecutionEvent::UnhandledError { snap_id, error }
            }
        };

        if self.events.send(event).is_err() {
            trace!(target: NOTIFICATION_TARGET, %job_id, "no execution event subscribers");
        }
    }
}
