//! Job lifecycle over an [`ExecutionTransport`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use snaps_config::ExecutionConfig;
use tokio::sync::broadcast;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

use crate::command::{
    CommandClient, Command, ExecuteSnapParams, SnapRpcParams, spawn_command_pump,
};
use crate::error::ExecutionError;
use crate::jobs::{Job, RpcHook, SnapJobMap};
use crate::mux::{COMMAND_STREAM, ProviderStream, RPC_STREAM, SubStream, spawn_demultiplexer};
use crate::notification::{ExecutionEvent, NotificationListener};
use crate::timer::{TimedOut, Timer, with_timeout, with_timer};
use crate::transport::{ExecutionTransport, SnapProvider, WorkerConnection};
use crate::types::{JobId, SnapExecutionData, SnapId, SnapRpcRequest};

/// Log target for execution service operations.
pub(crate) const SERVICE_TARGET: &str = "snaps_execution::service";

const EVENT_CAPACITY: usize = 64;

/// What the controller needs from an execution layer.
#[async_trait]
pub trait ExecutionEnvironment: Send + Sync {
    /// Boots a snap in a new job.
    async fn execute_snap(&self, data: SnapExecutionData) -> Result<(), ExecutionError>;

    /// Terminates the job of `snap_id`.
    async fn terminate_snap(&self, snap_id: &SnapId) -> Result<(), ExecutionError>;

    /// Terminates every job.
    async fn terminate_all_snaps(&self);

    /// Invokes a handler of a running snap.
    async fn handle_rpc_request(
        &self,
        snap_id: &SnapId,
        request: SnapRpcRequest,
    ) -> Result<Value, ExecutionError>;

    /// Subscribes to outbound and crash events.
    fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent>;
}

/// Turns raw sandbox streams into jobs speaking the command protocol.
pub struct ExecutionService<T: ExecutionTransport> {
    transport: Arc<T>,
    provider: Arc<dyn SnapProvider>,
    config: ExecutionConfig,
    jobs: Mutex<HashMap<JobId, Job<T::Worker>>>,
    mappings: Arc<Mutex<SnapJobMap>>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl<T: ExecutionTransport> ExecutionService<T> {
    /// Creates a service over `transport`.
    #[must_use]
    pub fn new(transport: Arc<T>, provider: Arc<dyn SnapProvider>, config: ExecutionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            transport,
            provider,
            config,
            jobs: Mutex::new(HashMap::new()),
            mappings: Arc::new(Mutex::new(SnapJobMap::default())),
            events,
        }
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, Job<T::Worker>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_mappings(&self) -> MutexGuard<'_, SnapJobMap> {
        self.mappings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.lock_jobs().len()
    }

    /// Returns `true` when `snap_id` is mapped to a job.
    #[must_use]
    pub fn is_executing(&self, snap_id: &SnapId) -> bool {
        self.lock_mappings().job_for(snap_id).is_some()
    }

    /// Creates a job and wires its substreams. The transport is bounded by
    /// `timer`.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::StartTimeout`] when the transport does not
    /// produce a stream in time, or the transport's own error.
    pub async fn init_job(
        &self,
        job_id: JobId,
        timer: &Timer,
    ) -> Result<ProviderStream, ExecutionError> {
        debug!(target: SERVICE_TARGET, %job_id, "creating job");

        let connection = match with_timer(timer, self.transport.init_job(job_id)).await {
            Ok(Ok(connection)) => connection,
            Ok(Err(error)) => {
                self.transport.terminate_job(job_id, None).await;
                return Err(error);
            }
            Err(TimedOut) => {
                warn!(target: SERVICE_TARGET, %job_id, "execution environment did not start in time");
                self.transport.terminate_job(job_id, None).await;
                return Err(ExecutionError::StartTimeout { job_id });
            }
        };

        let WorkerConnection { worker, stream } = connection;
        let (command_tx, command_rx) = unbounded_channel();
        let (rpc_tx, rpc_rx) = unbounded_channel();

        let client = CommandClient::new(SubStream::new(COMMAND_STREAM, stream.sender.clone()));
        let listener =
            NotificationListener::new(job_id, Arc::clone(&self.mappings), self.events.clone());
        let demux = spawn_demultiplexer(
            job_id,
            stream.receiver,
            vec![(COMMAND_STREAM, command_tx), (RPC_STREAM, rpc_tx)],
        );
        let command_pump = spawn_command_pump(job_id, command_rx, client.clone(), listener);

        self.lock_jobs()
            .insert(job_id, Job::new(worker, client, vec![demux, command_pump]));

        Ok(ProviderStream {
            outbound: SubStream::new(RPC_STREAM, stream.sender),
            inbound: rpc_rx,
        })
    }

    /// Sends a command to a job and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::JobNotFound`] for unknown jobs, or the
    /// sandbox's decoded error.
    pub async fn command(&self, job_id: JobId, command: Command) -> Result<Value, ExecutionError> {
        let client = self
            .lock_jobs()
            .get(&job_id)
            .map(|job| job.client.clone())
            .ok_or(ExecutionError::JobNotFound { job_id })?;
        client.request(command).await
    }

    /// Asks a job to terminate, then tears it down regardless of the answer.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::JobNotFound`] for unknown jobs.
    pub async fn terminate(&self, job_id: JobId) -> Result<(), ExecutionError> {
        let client = self
            .lock_jobs()
            .get(&job_id)
            .map(|job| job.client.clone())
            .ok_or(ExecutionError::JobNotFound { job_id })?;

        match with_timeout(
            self.config.termination_timeout(),
            client.request(Command::Terminate),
        )
        .await
        {
            Ok(Ok(_)) => debug!(target: SERVICE_TARGET, %job_id, "job acknowledged terminate"),
            Ok(Err(error)) => warn!(
                target: SERVICE_TARGET,
                %job_id,
                %error,
                "job failed to terminate gracefully"
            ),
            Err(TimedOut) => warn!(
                target: SERVICE_TARGET,
                %job_id,
                "job did not acknowledge terminate in time"
            ),
        }

        let job = self.lock_jobs().remove(&job_id);
        let snap_id = self.lock_mappings().unbind_job(job_id);
        if let Some(mut job) = job {
            job.close_streams();
            self.transport.terminate_job(job_id, job.worker.take()).await;
        }

        info!(
            target: SERVICE_TARGET,
            %job_id,
            snap_id = snap_id.as_ref().map(tracing::field::display),
            "job terminated"
        );
        Ok(())
    }

    async fn start_job(
        &self,
        job_id: JobId,
        data: &SnapExecutionData,
        timer: &Timer,
    ) -> Result<(), ExecutionError> {
        let provider_stream = self.init_job(job_id, timer).await?;
        let snap_id = &data.snap_id;

        // The ping has its own budget; only job creation and execution count
        // against the start budget.
        if let Err(error) = timer.pause() {
            debug!(target: SERVICE_TARGET, %job_id, %error, "start timer already ended");
        }

        if self.config.use_ping {
            match with_timeout(self.config.ping_timeout(), self.command(job_id, Command::Ping)).await
            {
                Ok(result) => {
                    result?;
                }
                Err(TimedOut) => {
                    return Err(ExecutionError::PingTimeout {
                        snap_id: snap_id.clone(),
                    });
                }
            }
        }

        self.provider.setup_snap_provider(snap_id, provider_stream);

        if let Err(error) = timer.resume() {
            debug!(target: SERVICE_TARGET, %job_id, %error, "start timer not paused");
        }
        let execute = Command::ExecuteSnap(ExecuteSnapParams {
            snap_id: snap_id.clone(),
            source_code: data.source_code.clone(),
            endowments: data.endowments.clone(),
        });
        match with_timer(timer, self.command(job_id, execute)).await {
            Ok(result) => result.map(drop),
            Err(TimedOut) => Err(ExecutionError::ExecuteTimeout {
                snap_id: snap_id.clone(),
            }),
        }
    }

    async fn discard_failed_job(&self, job_id: JobId) {
        let has_job = self.lock_jobs().contains_key(&job_id);
        if !has_job {
            self.lock_mappings().unbind_job(job_id);
            return;
        }
        if let Err(error) = self.terminate(job_id).await {
            debug!(target: SERVICE_TARGET, %job_id, %error, "failed job already gone");
        }
    }

    fn rpc_hook(&self, snap_id: &SnapId) -> Result<RpcHook, ExecutionError> {
        if let Some(hook) = self.lock_mappings().hook(snap_id) {
            return Ok(hook);
        }
        let not_running = || ExecutionError::SnapNotRunning {
            snap_id: snap_id.clone(),
        };
        let job_id = self.lock_mappings().job_for(snap_id).ok_or_else(not_running)?;
        let client = self
            .lock_jobs()
            .get(&job_id)
            .map(|job| job.client.clone())
            .ok_or_else(not_running)?;
        let hook = RpcHook { job_id, client };

        let mut mappings = self.lock_mappings();
        // The job may have been torn down while the hook was being built.
        if mappings.job_for(snap_id) != Some(job_id) {
            return Err(not_running());
        }
        mappings.set_hook(snap_id.clone(), hook.clone());
        Ok(hook)
    }
}

#[async_trait]
impl<T: ExecutionTransport> ExecutionEnvironment for ExecutionService<T> {
    async fn execute_snap(&self, data: SnapExecutionData) -> Result<(), ExecutionError> {
        let job_id = JobId::generate();
        if !self.lock_mappings().bind(data.snap_id.clone(), job_id) {
            return Err(ExecutionError::AlreadyRunning {
                snap_id: data.snap_id,
            });
        }

        debug!(target: SERVICE_TARGET, snap_id = %data.snap_id, %job_id, "executing snap");
        let timer = Timer::new(self.config.init_timeout());
        match self.start_job(job_id, &data, &timer).await {
            Ok(()) => {
                info!(target: SERVICE_TARGET, snap_id = %data.snap_id, %job_id, "snap executed");
                Ok(())
            }
            Err(error) => {
                warn!(
                    target: SERVICE_TARGET,
                    snap_id = %data.snap_id,
                    %job_id,
                    %error,
                    "snap failed to start"
                );
                self.discard_failed_job(job_id).await;
                Err(error)
            }
        }
    }

    async fn terminate_snap(&self, snap_id: &SnapId) -> Result<(), ExecutionError> {
        let job_id = self
            .lock_mappings()
            .job_for(snap_id)
            .ok_or_else(|| ExecutionError::SnapNotRunning {
                snap_id: snap_id.clone(),
            })?;
        self.terminate(job_id).await
    }

    async fn terminate_all_snaps(&self) {
        let job_ids: Vec<JobId> = self.lock_jobs().keys().copied().collect();
        let results = join_all(job_ids.iter().map(|job_id| self.terminate(*job_id))).await;
        for (job_id, result) in job_ids.iter().zip(results) {
            if let Err(error) = result {
                debug!(target: SERVICE_TARGET, %job_id, %error, "job vanished during shutdown");
            }
        }
        self.lock_mappings().clear();
    }

    async fn handle_rpc_request(
        &self,
        snap_id: &SnapId,
        request: SnapRpcRequest,
    ) -> Result<Value, ExecutionError> {
        let hook = self.rpc_hook(snap_id)?;
        let SnapRpcRequest {
            origin,
            handler,
            request,
        } = request;
        debug!(
            target: SERVICE_TARGET,
            %snap_id,
            job_id = %hook.job_id,
            %handler,
            method = %request.method,
            "dispatching snap request"
        );
        hook.client
            .request(Command::SnapRpc(SnapRpcParams {
                origin,
                handler,
                request,
                target: snap_id.clone(),
            }))
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }
}

impl<T: ExecutionTransport> fmt::Debug for ExecutionService<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionService")
            .field("config", &self.config)
            .field("jobs", &self.job_count())
            .finish_non_exhaustive()
    }
}
