//! Behavioural tests for the snap lifecycle.

use std::time::Duration;

use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use semver::Version;
use serde_json::Value;
use snaps_execution::SnapId;
use tokio::runtime::{Builder, Runtime};

use super::support::{Harness, Setup, package};
use crate::error::SnapControllerError;
use crate::fsm::StatusEvent;
use crate::snap::TruncatedSnap;

struct LifecycleWorld {
    runtime: Runtime,
    harness: Option<Harness>,
    request: Option<Result<Value, SnapControllerError>>,
    update: Option<Result<TruncatedSnap, SnapControllerError>>,
}

impl LifecycleWorld {
    fn new() -> Self {
        Self {
            runtime: Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .expect("runtime"),
            harness: None,
            request: None,
            update: None,
        }
    }

    fn harness(&self) -> &Harness {
        self.harness.as_ref().expect("controller not created")
    }
}

fn unquote(text: &str) -> &str {
    text.trim_matches('"')
}

#[fixture]
fn world() -> LifecycleWorld {
    LifecycleWorld::new()
}

#[given("a snap controller")]
fn given_controller(world: &mut LifecycleWorld) {
    let harness = world.runtime.block_on(async { Setup::default().build() });
    world.harness = Some(harness);
}

#[when("snap {snap} version {version} is installed")]
fn when_installed(world: &mut LifecycleWorld, snap: String, version: String) {
    let harness = world.harness();
    world
        .runtime
        .block_on(harness.installed(unquote(&snap), unquote(&version)));
}

#[when("snap {snap} is stopped")]
fn when_stopped(world: &mut LifecycleWorld, snap: String) {
    let harness = world.harness();
    let snap_id = SnapId::from(unquote(&snap));
    world
        .runtime
        .block_on(harness.controller.stop_snap(&snap_id, StatusEvent::Stop))
        .expect("stop");
}

#[when("snap {snap} is asked to {method}")]
fn when_asked(world: &mut LifecycleWorld, snap: String, method: String) {
    let harness = world.harness();
    let result = world
        .runtime
        .block_on(harness.request(unquote(&snap), unquote(&method), None));
    world.request = Some(result);
}

#[when("{seconds} seconds pass")]
fn when_time_passes(world: &mut LifecycleWorld, seconds: u64) {
    world
        .runtime
        .block_on(async { tokio::time::sleep(Duration::from_secs(seconds)).await });
}

#[when("snap {snap} is updated to broken version {version}")]
fn when_broken_update(world: &mut LifecycleWorld, snap: String, version: String) {
    let harness = world.harness();
    let snap = unquote(&snap);
    let version = unquote(&version);
    harness.serve(snap, package(version, "throw during evaluation"));
    let result = world
        .runtime
        .block_on(harness.install(snap, Some(version)));
    world.update = Some(result);
}

#[then("snap {snap} has status {status}")]
fn then_status(world: &mut LifecycleWorld, snap: String, status: String) {
    assert_eq!(
        world.harness().status(unquote(&snap)).to_string(),
        unquote(&status)
    );
}

#[then("snap {snap} is at version {version}")]
fn then_version(world: &mut LifecycleWorld, snap: String, version: String) {
    let record = world
        .harness()
        .controller
        .get_expect(&SnapId::from(unquote(&snap)))
        .expect("record");
    assert_eq!(
        record.version,
        Version::parse(unquote(&version)).expect("version")
    );
}

#[then("the request succeeds")]
fn then_request_succeeds(world: &mut LifecycleWorld) {
    let result = world.request.as_ref().expect("no request made");
    assert!(result.is_ok(), "request failed: {result:?}");
}

#[then("the request fails")]
fn then_request_fails(world: &mut LifecycleWorld) {
    let result = world.request.as_ref().expect("no request made");
    assert!(result.is_err());
}

#[then("the update fails")]
fn then_update_fails(world: &mut LifecycleWorld) {
    let result = world.update.as_ref().expect("no update made");
    assert!(matches!(result, Err(SnapControllerError::Execution(_))));
}

#[scenario(
    path = "tests/features/snap_lifecycle.feature",
    name = "A freshly installed snap serves requests"
)]
fn installed_snap_serves_requests(#[from(world)] _world: LifecycleWorld) {}

#[scenario(
    path = "tests/features/snap_lifecycle.feature",
    name = "A stopped snap is started by its next request"
)]
fn stopped_snap_restarts_on_request(#[from(world)] _world: LifecycleWorld) {}

#[scenario(
    path = "tests/features/snap_lifecycle.feature",
    name = "An idle snap is stopped by the sweep"
)]
fn idle_snap_is_swept(#[from(world)] _world: LifecycleWorld) {}

#[scenario(
    path = "tests/features/snap_lifecycle.feature",
    name = "An unhandled error crashes the snap"
)]
fn unhandled_error_crashes_snap(#[from(world)] _world: LifecycleWorld) {}

#[scenario(
    path = "tests/features/snap_lifecycle.feature",
    name = "A broken update is rolled back"
)]
fn broken_update_rolls_back(#[from(world)] _world: LifecycleWorld) {}
