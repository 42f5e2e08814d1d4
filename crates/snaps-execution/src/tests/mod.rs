//! Execution service tests against the simulated sandbox.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::{fixture, rstest};
use serde_json::{Value, json};
use snaps_config::ExecutionConfig;
use tokio::time::Instant;

use crate::error::ExecutionError;
use crate::jsonrpc::{JsonRpcRequest, WRAPPED_SNAP_ERROR};
use crate::mux::ProviderStream;
use crate::notification::ExecutionEvent;
use crate::service::{ExecutionEnvironment, ExecutionService};
use crate::test_support::{SimulatedBehaviour, SimulatedTransport};
use crate::transport::{NoProvider, SnapProvider};
use crate::types::{HandlerType, SnapExecutionData, SnapId, SnapRpcRequest};

type Service = ExecutionService<SimulatedTransport>;

#[derive(Default)]
struct RecordingProvider {
    streams: Mutex<Vec<(SnapId, ProviderStream)>>,
}

impl SnapProvider for RecordingProvider {
    fn setup_snap_provider(&self, snap_id: &SnapId, stream: ProviderStream) {
        self.streams
            .lock()
            .expect("provider lock")
            .push((snap_id.clone(), stream));
    }
}

#[fixture]
fn config() -> ExecutionConfig {
    ExecutionConfig {
        init_timeout_ms: 1_000,
        ping_timeout_ms: 100,
        termination_timeout_ms: 50,
        use_ping: true,
    }
}

fn service_with(behaviour: SimulatedBehaviour, config: ExecutionConfig) -> (Service, Arc<SimulatedTransport>) {
    let transport = Arc::new(SimulatedTransport::with_behaviour(behaviour));
    let service = ExecutionService::new(Arc::clone(&transport), Arc::new(NoProvider), config);
    (service, transport)
}

fn snap(id: &str, source: &str) -> SnapExecutionData {
    SnapExecutionData {
        snap_id: SnapId::from(id),
        source_code: source.to_owned(),
        endowments: vec!["console".to_owned()],
    }
}

fn rpc(method: &str, params: Option<Value>) -> SnapRpcRequest {
    SnapRpcRequest {
        origin: "https://dapp.example".to_owned(),
        handler: HandlerType::OnRpcRequest,
        request: JsonRpcRequest::with_id(1, method, params),
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn executes_and_dispatches_requests(config: ExecutionConfig) {
    let (service, transport) = service_with(SimulatedBehaviour::default(), config);
    let snap_id = SnapId::from("npm:echo");

    service
        .execute_snap(snap("npm:echo", "exports.onRpcRequest = echo"))
        .await
        .expect("execute");
    assert!(service.is_executing(&snap_id));

    let result = service
        .handle_rpc_request(&snap_id, rpc("echo", Some(json!({"value": 1}))))
        .await
        .expect("rpc");
    assert_eq!(result, json!({"value": 1}));

    let executed = transport.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed.first().map(|e| e.endowments.clone()), Some(vec!["console".to_owned()]));
    let calls = transport.calls();
    assert_eq!(calls.first().map(|c| c.origin.as_str()), Some("https://dapp.example"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn rejects_second_execution_of_same_snap(config: ExecutionConfig) {
    let (service, _transport) = service_with(SimulatedBehaviour::default(), config);
    service.execute_snap(snap("npm:a", "ok")).await.expect("first");

    let error = service
        .execute_snap(snap("npm:a", "ok"))
        .await
        .expect_err("second execution must fail");
    assert_eq!(
        error,
        ExecutionError::AlreadyRunning {
            snap_id: SnapId::from("npm:a")
        }
    );
    assert_eq!(service.job_count(), 1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn transport_that_never_starts_times_out(config: ExecutionConfig) {
    let behaviour = SimulatedBehaviour {
        never_start: true,
        ..SimulatedBehaviour::default()
    };
    let (service, transport) = service_with(behaviour, config);
    let started_at = Instant::now();

    let error = service
        .execute_snap(snap("npm:slow", "ok"))
        .await
        .expect_err("start must time out");

    assert!(matches!(error, ExecutionError::StartTimeout { .. }));
    assert!(started_at.elapsed() >= Duration::from_millis(1_000));
    assert!(started_at.elapsed() < Duration::from_millis(1_100));
    assert_eq!(transport.terminated().len(), 1);
    assert!(!service.is_executing(&SnapId::from("npm:slow")));
    assert_eq!(service.job_count(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn unanswered_ping_terminates_job(config: ExecutionConfig) {
    let behaviour = SimulatedBehaviour {
        ignore_ping: true,
        ..SimulatedBehaviour::default()
    };
    let (service, transport) = service_with(behaviour, config);

    let error = service
        .execute_snap(snap("npm:mute", "ok"))
        .await
        .expect_err("ping must time out");

    assert_eq!(
        error,
        ExecutionError::PingTimeout {
            snap_id: SnapId::from("npm:mute")
        }
    );
    assert_eq!(transport.terminated().len(), 1);
    assert_eq!(service.job_count(), 0);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn ping_can_be_disabled(config: ExecutionConfig) {
    let behaviour = SimulatedBehaviour {
        ignore_ping: true,
        ..SimulatedBehaviour::default()
    };
    let config = ExecutionConfig {
        use_ping: false,
        ..config
    };
    let (service, _transport) = service_with(behaviour, config);
    service
        .execute_snap(snap("npm:mute", "ok"))
        .await
        .expect("execution without ping");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failing_source_is_reported_and_cleaned_up(config: ExecutionConfig) {
    let (service, transport) = service_with(SimulatedBehaviour::default(), config);

    let error = service
        .execute_snap(snap("npm:bad", "throw new Error()"))
        .await
        .expect_err("evaluation must fail");

    assert!(matches!(error, ExecutionError::Rpc(_)));
    assert_eq!(transport.terminated().len(), 1);
    assert!(!service.is_executing(&SnapId::from("npm:bad")));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn execution_is_bounded_by_start_budget(config: ExecutionConfig) {
    let (service, _transport) = service_with(SimulatedBehaviour::default(), config);

    let error = service
        .execute_snap(snap("npm:forever", "hang"))
        .await
        .expect_err("execution must time out");

    assert_eq!(
        error,
        ExecutionError::ExecuteTimeout {
            snap_id: SnapId::from("npm:forever")
        }
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn terminate_proceeds_without_acknowledgement(config: ExecutionConfig) {
    let behaviour = SimulatedBehaviour {
        ignore_terminate: true,
        ..SimulatedBehaviour::default()
    };
    let (service, transport) = service_with(behaviour, config);
    let snap_id = SnapId::from("npm:stubborn");
    service
        .execute_snap(snap("npm:stubborn", "ok"))
        .await
        .expect("execute");

    let started_at = Instant::now();
    service.terminate_snap(&snap_id).await.expect("terminate");

    assert!(started_at.elapsed() >= Duration::from_millis(50));
    assert!(started_at.elapsed() < Duration::from_millis(100));
    assert_eq!(transport.terminated().len(), 1);
    assert!(!service.is_executing(&snap_id));
    assert_eq!(
        service.terminate_snap(&snap_id).await,
        Err(ExecutionError::SnapNotRunning { snap_id })
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn terminate_fails_pending_requests(config: ExecutionConfig) {
    let (service, _transport) = service_with(SimulatedBehaviour::default(), config);
    let service = Arc::new(service);
    let snap_id = SnapId::from("npm:hang");
    service.execute_snap(snap("npm:hang", "ok")).await.expect("execute");

    let pending = {
        let service = Arc::clone(&service);
        let snap_id = snap_id.clone();
        tokio::spawn(async move { service.handle_rpc_request(&snap_id, rpc("hang", None)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    service.terminate_snap(&snap_id).await.expect("terminate");

    let result = pending.await.expect("join");
    assert_eq!(result, Err(ExecutionError::Disconnected));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn terminate_all_clears_every_job(config: ExecutionConfig) {
    let (service, transport) = service_with(SimulatedBehaviour::default(), config);
    for id in ["npm:a", "npm:b", "npm:c"] {
        service.execute_snap(snap(id, "ok")).await.expect("execute");
    }

    service.terminate_all_snaps().await;

    assert_eq!(service.job_count(), 0);
    assert_eq!(transport.terminated().len(), 3);
    for id in ["npm:a", "npm:b", "npm:c"] {
        assert!(!service.is_executing(&SnapId::from(id)));
    }
    let error = service
        .handle_rpc_request(&SnapId::from("npm:a"), rpc("echo", None))
        .await
        .expect_err("no job left");
    assert!(matches!(error, ExecutionError::SnapNotRunning { .. }));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn snap_errors_are_returned_to_the_caller(config: ExecutionConfig) {
    let (service, _transport) = service_with(SimulatedBehaviour::default(), config);
    let snap_id = SnapId::from("npm:err");
    service.execute_snap(snap("npm:err", "ok")).await.expect("execute");

    let error = service
        .handle_rpc_request(&snap_id, rpc("error", None))
        .await
        .expect_err("snap error");
    let ExecutionError::Rpc(error) = error else {
        panic!("expected an RPC error, got {error:?}");
    };
    assert_eq!(error.code, WRAPPED_SNAP_ERROR);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn publishes_outbound_and_crash_events(config: ExecutionConfig) {
    let (service, _transport) = service_with(SimulatedBehaviour::default(), config);
    let mut events = service.subscribe();
    let snap_id = SnapId::from("npm:events");
    service.execute_snap(snap("npm:events", "ok")).await.expect("execute");

    let result = service
        .handle_rpc_request(&snap_id, rpc("outbound", Some(json!({"delay_ms": 20}))))
        .await
        .expect("outbound request");
    assert_eq!(result, json!("done"));
    assert_eq!(
        events.recv().await.expect("event"),
        ExecutionEvent::OutboundRequest {
            snap_id: snap_id.clone()
        }
    );
    assert_eq!(
        events.recv().await.expect("event"),
        ExecutionEvent::OutboundResponse {
            snap_id: snap_id.clone()
        }
    );

    let crashing = service.handle_rpc_request(&snap_id, rpc("crash", None));
    tokio::select! {
        _ = crashing => panic!("crash request must not complete"),
        event = events.recv() => {
            assert!(matches!(
                event.expect("event"),
                ExecutionEvent::UnhandledError { snap_id: id, .. } if id == snap_id
            ));
        }
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn provider_receives_the_rpc_substream(config: ExecutionConfig) {
    let transport = Arc::new(SimulatedTransport::new());
    let provider = Arc::new(RecordingProvider::default());
    let service = ExecutionService::new(
        Arc::clone(&transport),
        Arc::clone(&provider) as Arc<dyn SnapProvider>,
        config,
    );
    service
        .execute_snap(snap("npm:provided", "ok"))
        .await
        .expect("execute");

    let (snap_id, mut stream) = provider
        .streams
        .lock()
        .expect("provider lock")
        .pop()
        .expect("provider stream");
    assert_eq!(snap_id, SnapId::from("npm:provided"));
    assert_eq!(
        stream.inbound.recv().await,
        Some(json!({"jsonrpc": "2.0", "method": "snap_ready"}))
    );
}
