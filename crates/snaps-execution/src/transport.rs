//! Contracts implemented by concrete sandbox integrations.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::trace;

use crate::error::ExecutionError;
use crate::mux::ProviderStream;
use crate::types::{JobId, SnapId};

/// One end of a duplex JSON message channel.
#[derive(Debug)]
pub struct MessageStream {
    /// Messages written to the peer.
    pub sender: UnboundedSender<Value>,
    /// Messages received from the peer.
    pub receiver: UnboundedReceiver<Value>,
}

impl MessageStream {
    /// Creates two connected ends, for in-process sandboxes.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = unbounded_channel();
        let (right_tx, left_rx) = unbounded_channel();
        (
            Self {
                sender: left_tx,
                receiver: left_rx,
            },
            Self {
                sender: right_tx,
                receiver: right_rx,
            },
        )
    }
}

/// What a transport returns for a freshly created job.
#[derive(Debug)]
pub struct WorkerConnection<W> {
    /// Handle used later to tear the sandbox down.
    pub worker: W,
    /// Raw multiplexed stream to the sandbox.
    pub stream: MessageStream,
}

/// Creates and destroys sandboxes of one kind (iframe, worker, process, ...).
#[async_trait]
pub trait ExecutionTransport: Send + Sync + 'static {
    /// Handle identifying a live sandbox.
    type Worker: Send + 'static;

    /// Creates a sandbox for `job_id` and connects to it.
    async fn init_job(
        &self,
        job_id: JobId,
    ) -> Result<WorkerConnection<Self::Worker>, ExecutionError>;

    /// Destroys the sandbox of `job_id`. `worker` is `None` when the job
    /// never finished starting.
    async fn terminate_job(&self, job_id: JobId, worker: Option<Self::Worker>);
}

/// Receives the provider substream of each snap that starts.
pub trait SnapProvider: Send + Sync {
    /// Wires `stream` to whatever serves the snap's provider requests.
    fn setup_snap_provider(&self, snap_id: &SnapId, stream: ProviderStream);
}

/// Provider hook that drops the stream; the snap gets no provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProvider;

impl SnapProvider for NoProvider {
    fn setup_snap_provider(&self, snap_id: &SnapId, stream: ProviderStream) {
        trace!(
            target: "snaps_execution::transport",
            %snap_id,
            substream = stream.outbound.name(),
            "no provider configured"
        );
    }
}
