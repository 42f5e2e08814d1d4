//! Bookkeeping for live jobs and their snap mappings.

use std::collections::HashMap;

use tokio::task::JoinHandle;

use crate::command::CommandClient;
use crate::types::{JobId, SnapId};

/// One live sandbox instance.
pub(crate) struct Job<W> {
    pub(crate) worker: Option<W>,
    pub(crate) client: CommandClient,
    pumps: Vec<JoinHandle<()>>,
}

impl<W> Job<W> {
    pub(crate) fn new(worker: W, client: CommandClient, pumps: Vec<JoinHandle<()>>) -> Self {
        Self {
            worker: Some(worker),
            client,
            pumps,
        }
    }

    /// Stops the stream pumps and fails any command still waiting.
    pub(crate) fn close_streams(&mut self) {
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        self.client.disconnect();
    }
}

/// Memoized dispatch handle for a running snap.
#[derive(Debug, Clone)]
pub(crate) struct RpcHook {
    pub(crate) job_id: JobId,
    pub(crate) client: CommandClient,
}

/// Two-way snap/job mapping plus cached RPC hooks.
#[derive(Debug, Default)]
pub(crate) struct SnapJobMap {
    snap_to_job: HashMap<SnapId, JobId>,
    job_to_snap: HashMap<JobId, SnapId>,
    rpc_hooks: HashMap<SnapId, RpcHook>,
}

impl SnapJobMap {
    /// Maps `snap_id` to `job_id`; returns `false` if the snap is already mapped.
    pub(crate) fn bind(&mut self, snap_id: SnapId, job_id: JobId) -> bool {
        if self.snap_to_job.contains_key(&snap_id) {
            return false;
        }
        self.job_to_snap.insert(job_id, snap_id.clone());
        self.snap_to_job.insert(snap_id, job_id);
        true
    }

    pub(crate) fn job_for(&self, snap_id: &SnapId) -> Option<JobId> {
        self.snap_to_job.get(snap_id).copied()
    }

    pub(crate) fn snap_for(&self, job_id: JobId) -> Option<SnapId> {
        self.job_to_snap.get(&job_id).cloned()
    }

    /// Removes every trace of `job_id`.
    pub(crate) fn unbind_job(&mut self, job_id: JobId) -> Option<SnapId> {
        let snap_id = self.job_to_snap.remove(&job_id)?;
        self.snap_to_job.remove(&snap_id);
        self.rpc_hooks.remove(&snap_id);
        Some(snap_id)
    }

    pub(crate) fn hook(&self, snap_id: &SnapId) -> Option<RpcHook> {
        self.rpc_hooks.get(snap_id).cloned()
    }

    pub(crate) fn set_hook(&mut self, snap_id: SnapId, hook: RpcHook) {
        self.rpc_hooks.insert(snap_id, hook);
    }

    pub(crate) fn clear(&mut self) {
        self.snap_to_job.clear();
        self.job_to_snap.clear();
        self.rpc_hooks.clear();
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.snap_to_job.is_empty() && self.job_to_snap.is_empty() && self.rpc_hooks.is_empty()
    }
}
