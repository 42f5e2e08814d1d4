//! Idle sweeps, references, persistence, preinstalled snaps, and blocking.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;
use rstest::rstest;
use semver::Version;
use serde_json::json;
use snaps_config::ControllerConfig;
use snaps_execution::SnapId;

use super::support::{SOURCE, Setup, controller_config, drain, harness, package, preinstalled};
use crate::controller::PREINSTALLED_ORIGIN;
use crate::error::SnapControllerError;
use crate::events::ControllerEvent;
use crate::fsm::{SnapStatus, StatusEvent};
use crate::handlers::RPC_PERMISSION;
use crate::permissions::PermissionController;
use crate::registry::{RegistryError, RegistryQuery, RegistryVerdict, SnapsRegistry};
use crate::snap::{BlockReason, PersistedSnapsState};
use crate::test_support::snap_record;

mock! {
    Registry {}
    #[async_trait]
    impl SnapsRegistry for Registry {
        async fn get(
            &self,
            queries: Vec<RegistryQuery>,
        ) -> Result<BTreeMap<SnapId, RegistryVerdict>, RegistryError>;
    }
}

fn persisted(snaps: &[(&str, &str)]) -> PersistedSnapsState {
    PersistedSnapsState {
        snaps: snaps
            .iter()
            .map(|(snap_id, version)| {
                let mut snap = snap_record(snap_id, version);
                snap.status = SnapStatus::Running;
                (snap.id.clone(), snap)
            })
            .collect(),
        ..PersistedSnapsState::default()
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn idle_snaps_are_stopped() {
    let harness = harness();
    harness.installed("npm:idle", "1.0.0").await;
    let mut events = harness.controller.subscribe();

    tokio::time::sleep(Duration::from_secs(40)).await;

    assert_eq!(harness.status("npm:idle"), SnapStatus::Stopped);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, ControllerEvent::SnapTerminated { .. })));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn referenced_snaps_survive_the_sweep() {
    let harness = harness();
    harness.installed("npm:held", "1.0.0").await;
    let snap_id = SnapId::from("npm:held");
    harness
        .controller
        .increment_active_references(&snap_id)
        .expect("reference");

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(harness.status("npm:held"), SnapStatus::Running);

    harness
        .controller
        .decrement_active_references(&snap_id)
        .expect("release");
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.status("npm:held"), SnapStatus::Stopped);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn snaps_serving_requests_survive_the_sweep() {
    let harness = Setup {
        config: ControllerConfig {
            max_request_time_ms: 60_000,
            ..controller_config()
        },
        ..Setup::default()
    }
    .build();
    harness.installed("npm:busy", "1.0.0").await;

    let (result, ()) = tokio::join!(
        harness.request("npm:busy", "slow", Some(json!({ "delay_ms": 45_000 }))),
        async {
            tokio::time::sleep(Duration::from_secs(40)).await;
            assert_eq!(harness.status("npm:busy"), SnapStatus::Running);
        }
    );

    result.expect("slow request");
    assert_eq!(harness.status("npm:busy"), SnapStatus::Running);
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(harness.status("npm:busy"), SnapStatus::Stopped);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn concurrent_starts_boot_one_job() {
    let harness = harness();
    harness.installed("npm:raced", "1.0.0").await;
    let snap_id = SnapId::from("npm:raced");
    harness
        .controller
        .stop_snap(&snap_id, StatusEvent::Stop)
        .await
        .expect("stop");

    let (first, second) = tokio::join!(
        harness.controller.start_snap(&snap_id),
        harness.controller.start_snap(&snap_id)
    );

    assert_eq!(first, Ok(()));
    assert_eq!(
        second,
        Err(SnapControllerError::AlreadyRunning {
            snap_id: snap_id.clone()
        })
    );
    assert_eq!(harness.status("npm:raced"), SnapStatus::Running);
    assert!(harness.controller.is_running(&snap_id));
    assert_eq!(harness.transport.executed().len(), 2);
    assert_eq!(
        harness
            .request("npm:raced", "echo", Some(json!("still here")))
            .await,
        Ok(json!("still here"))
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn snaps_disabled_while_booting_discard_their_job() {
    let harness = harness();
    harness.installed("npm:vetoed", "1.0.0").await;
    let snap_id = SnapId::from("npm:vetoed");
    harness
        .controller
        .stop_snap(&snap_id, StatusEvent::Stop)
        .await
        .expect("stop");
    let terminated = harness.transport.terminated().len();

    let (started, disabled) = tokio::join!(
        harness.controller.start_snap(&snap_id),
        harness.controller.disable_snap(&snap_id)
    );

    disabled.expect("disable");
    assert_eq!(
        started,
        Err(SnapControllerError::SnapDisabled {
            snap_id: snap_id.clone()
        })
    );
    assert_eq!(harness.status("npm:vetoed"), SnapStatus::Stopped);
    assert!(!harness.controller.is_running(&snap_id));
    assert_eq!(harness.transport.terminated().len(), terminated + 1);

    harness.controller.enable_snap(&snap_id).expect("enable");
    harness.controller.start_snap(&snap_id).await.expect("restart");
    assert!(harness.controller.is_running(&snap_id));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn references_cannot_go_negative() {
    let harness = harness();
    harness.installed("npm:counted", "1.0.0").await;
    let snap_id = SnapId::from("npm:counted");

    assert_eq!(
        harness.controller.decrement_active_references(&snap_id),
        Err(SnapControllerError::NoActiveReferences {
            snap_id: snap_id.clone()
        })
    );
    let unknown = SnapId::from("npm:unknown");
    assert_eq!(
        harness.controller.increment_active_references(&unknown),
        Err(SnapControllerError::NoRuntime { snap_id: unknown })
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn persisted_snaps_load_stopped() {
    let harness = Setup {
        persisted: Some(persisted(&[("npm:saved", "1.0.0")])),
        ..Setup::default()
    }
    .build();
    let snap_id = SnapId::from("npm:saved");

    assert_eq!(harness.status("npm:saved"), SnapStatus::Stopped);
    assert!(!harness.controller.is_running(&snap_id));
    harness
        .controller
        .increment_active_references(&snap_id)
        .expect("runtime exists");

    harness.controller.start_snap(&snap_id).await.expect("start");
    assert_eq!(harness.status("npm:saved"), SnapStatus::Running);
    assert_eq!(
        harness.controller.start_snap(&snap_id).await,
        Err(SnapControllerError::AlreadyRunning { snap_id })
    );
    let projected = harness.controller.persisted_state();
    assert!(projected
        .snaps
        .values()
        .all(|snap| snap.status == SnapStatus::Stopped));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn preinstalled_snaps_are_applied_at_startup() {
    let harness = Setup {
        preinstalled: vec![preinstalled("npm:bundled", "1.0.0")],
        ..Setup::default()
    }
    .build();
    let snap_id = SnapId::from("npm:bundled");

    let snap = harness.controller.get_expect(&snap_id).expect("preinstalled");
    assert!(snap.preinstalled);
    assert!(!snap.removable);
    assert_eq!(snap.status, SnapStatus::Stopped);
    assert!(snap
        .version_history
        .iter()
        .all(|entry| entry.origin == PREINSTALLED_ORIGIN));
    assert!(harness.permissions.has_permission(&snap_id, RPC_PERMISSION));
    assert_eq!(
        harness.controller.remove_snap(&snap_id).await,
        Err(SnapControllerError::NotRemovable { snap_id })
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn newer_preinstalled_versions_replace_persisted_ones() {
    let harness = Setup {
        persisted: Some(persisted(&[("npm:bundled", "1.0.0")])),
        preinstalled: vec![preinstalled("npm:bundled", "2.0.0")],
        ..Setup::default()
    }
    .build();

    let snap = harness
        .controller
        .get_expect(&SnapId::from("npm:bundled"))
        .expect("record");
    assert_eq!(snap.version, Version::new(2, 0, 0));
    assert!(snap.preinstalled);
    assert_eq!(snap.status, SnapStatus::Stopped);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn clearing_state_keeps_only_preinstalled_snaps() {
    let harness = Setup {
        preinstalled: vec![preinstalled("npm:bundled", "1.0.0")],
        ..Setup::default()
    }
    .build();
    harness.installed("npm:extra", "1.0.0").await;
    let extra = SnapId::from("npm:extra");

    harness.controller.clear_state().await.expect("clear");

    assert!(!harness.controller.has(&extra));
    assert!(harness.permissions.granted(&extra).is_empty());
    assert!(harness.controller.has(&SnapId::from("npm:bundled")));
    assert_eq!(harness.status("npm:bundled"), SnapStatus::Stopped);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn destroy_stops_every_snap() {
    let harness = harness();
    harness.installed("npm:one", "1.0.0").await;
    harness.installed("npm:two", "1.0.0").await;

    harness.controller.destroy().await;

    assert_eq!(harness.status("npm:one"), SnapStatus::Stopped);
    assert_eq!(harness.status("npm:two"), SnapStatus::Stopped);
    assert!(!harness.controller.is_running(&SnapId::from("npm:one")));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn removal_is_all_or_nothing() {
    let harness = harness();
    harness.installed("npm:kept", "1.0.0").await;
    let kept = SnapId::from("npm:kept");
    let missing = SnapId::from("npm:missing");

    assert_eq!(
        harness
            .controller
            .remove_snaps(&[kept.clone(), missing.clone()])
            .await,
        Err(SnapControllerError::NotFound { snap_id: missing })
    );
    assert!(harness.controller.has(&kept));
    assert!(harness.controller.is_running(&kept));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn enabling_and_disabling_publish_events() {
    let harness = harness();
    harness.installed("npm:toggled", "1.0.0").await;
    let snap_id = SnapId::from("npm:toggled");
    let mut events = harness.controller.subscribe();

    harness.controller.disable_snap(&snap_id).await.expect("disable");
    assert!(!harness.controller.get_expect(&snap_id).expect("record").enabled);
    assert_eq!(
        harness.controller.start_snap(&snap_id).await,
        Err(SnapControllerError::SnapDisabled {
            snap_id: snap_id.clone()
        })
    );
    harness.controller.enable_snap(&snap_id).expect("enable");

    let events = drain(&mut events);
    assert!(events
        .iter()
        .any(|event| matches!(event, ControllerEvent::SnapDisabled { .. })));
    assert!(events
        .iter()
        .any(|event| matches!(event, ControllerEvent::SnapEnabled { .. })));
    assert!(harness.controller.get_runnable_snaps().iter().any(|snap| snap.id == snap_id));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn registry_verdicts_block_and_unblock_snaps() {
    let blocked = Arc::new(AtomicBool::new(true));
    let verdict = Arc::clone(&blocked);
    let mut registry = MockRegistry::new();
    registry.expect_get().returning(move |queries| {
        let verdict = if verdict.load(Ordering::SeqCst) {
            RegistryVerdict::Blocked {
                reason: Some(BlockReason {
                    info_url: Some("https://registry.example/advisory".to_owned()),
                    explanation: Some("exfiltrates keys".to_owned()),
                }),
            }
        } else {
            RegistryVerdict::Verified
        };
        Ok(queries
            .into_iter()
            .map(|query| (query.snap_id, verdict.clone()))
            .collect())
    });
    blocked.store(false, Ordering::SeqCst);
    let harness = Setup {
        registry: Arc::new(registry),
        ..Setup::default()
    }
    .build();
    harness.installed("npm:suspect", "1.0.0").await;
    let snap_id = SnapId::from("npm:suspect");
    let mut events = harness.controller.subscribe();

    blocked.store(true, Ordering::SeqCst);
    harness.controller.update_blocked_snaps().await.expect("refresh");

    let snap = harness.controller.get_expect(&snap_id).expect("record");
    assert!(snap.blocked);
    assert!(!snap.enabled);
    assert_eq!(
        snap.block_information
            .as_ref()
            .and_then(|reason| reason.explanation.as_deref()),
        Some("exfiltrates keys")
    );
    assert!(!harness.controller.is_running(&snap_id));
    assert!(harness.controller.get_runnable_snaps().is_empty());

    blocked.store(false, Ordering::SeqCst);
    harness.controller.update_blocked_snaps().await.expect("refresh");

    let snap = harness.controller.get_expect(&snap_id).expect("record");
    assert!(!snap.blocked);
    assert!(!snap.enabled);
    let events = drain(&mut events);
    assert!(events.iter().any(|event| matches!(
        event,
        ControllerEvent::SnapBlocked { explanation: Some(text), .. } if text == "exfiltrates keys"
    )));
    assert!(events
        .iter()
        .any(|event| matches!(event, ControllerEvent::SnapUnblocked { .. })));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn registry_outages_are_reported() {
    let mut registry = MockRegistry::new();
    registry.expect_get().returning(|_| {
        Err(RegistryError {
            message: "offline".to_owned(),
        })
    });
    let harness = Setup {
        persisted: Some(persisted(&[("npm:saved", "1.0.0")])),
        registry: Arc::new(registry),
        ..Setup::default()
    }
    .build();

    assert_eq!(
        harness.controller.update_blocked_snaps().await,
        Err(SnapControllerError::Registry {
            message: "offline".to_owned()
        })
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn installed_snaps_are_listed_for_connected_origins_only() {
    let harness = harness();
    harness.serve(
        "npm:linked",
        package("1.0.0", SOURCE).with_connection("https://wallet.example"),
    );
    harness.install("npm:linked", None).await.expect("install");

    let permitted = harness.controller.get_permitted_snaps("https://wallet.example");
    assert_eq!(permitted.len(), 1);
    assert!(harness
        .controller
        .get_permitted_snaps("https://stranger.example")
        .is_empty());
}
