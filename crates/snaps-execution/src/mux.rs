//! Substream multiplexing over a single duplex message channel.
//!
//! Every message on a job's raw stream is a frame `{"name": .., "data": ..}`.
//! The demultiplexer task routes inbound frames to per-substream channels;
//! [`SubStream`] wraps outbound payloads in frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::error::ExecutionError;
use crate::types::JobId;

const MUX_TARGET: &str = "snaps_execution::mux";

/// Substream carrying the command protocol.
pub const COMMAND_STREAM: &str = "command";

/// Substream carrying the snap's provider JSON-RPC traffic.
pub const RPC_STREAM: &str = "jsonRpc";

/// One multiplexed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxFrame {
    /// Substream name.
    pub name: String,
    /// Payload for that substream.
    pub data: Value,
}

/// Writing half of a named substream.
#[derive(Debug, Clone)]
pub struct SubStream {
    name: &'static str,
    sink: UnboundedSender<Value>,
}

impl SubStream {
    pub(crate) const fn new(name: &'static str, sink: UnboundedSender<Value>) -> Self {
        Self { name, sink }
    }

    /// Substream name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Sends `data` framed for this substream.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Disconnected`] when the raw stream is closed.
    pub fn send(&self, data: Value) -> Result<(), ExecutionError> {
        let frame = serde_json::to_value(MuxFrame {
            name: self.name.to_owned(),
            data,
        })?;
        self.sink
            .send(frame)
            .map_err(|_| ExecutionError::Disconnected)
    }
}

/// Host end of the provider substream, handed to a
/// [`SnapProvider`](crate::transport::SnapProvider).
#[derive(Debug)]
pub struct ProviderStream {
    /// Sends provider traffic to the sandbox.
    pub outbound: SubStream,
    /// Provider traffic received from the sandbox.
    pub inbound: UnboundedReceiver<Value>,
}

/// Routes raw frames to their substreams until the raw stream closes.
pub(crate) fn spawn_demultiplexer(
    job_id: JobId,
    mut raw: UnboundedReceiver<Value>,
    routes: Vec<(&'static str, UnboundedSender<Value>)>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = raw.recv().await {
            route_frame(job_id, message, &routes);
        }
        trace!(target: MUX_TARGET, %job_id, "raw stream closed");
    })
}

fn route_frame(job_id: JobId, message: Value, routes: &[(&'static str, UnboundedSender<Value>)]) {
    let frame: MuxFrame = match serde_json::from_value(message) {
        Ok(frame) => frame,
        Err(error) => {
            warn!(target: MUX_TARGET, %job_id, %error, "dropping malformed frame");
            return;
        }
    };

    let Some((name, sink)) = routes.iter().find(|(name, _)| *name == frame.name) else {
        warn!(
            target: MUX_TARGET,
            %job_id,
            substream = %frame.name,
            "dropping frame for unknown substream"
        );
        return;
    };

    if sink.send(frame.data).is_err() {
        trace!(target: MUX_TARGET, %job_id, substream = name, "substream reader gone");
    }
}
