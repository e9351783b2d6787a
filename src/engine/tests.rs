//! Unit tests for the reconciliation engine against scripted fakes.

use std::time::Duration;

use rstest::rstest;

use super::*;
use crate::backend::ServerStatus;
use crate::state::{DeploymentState, STATUS_TERMINATED};
use crate::test_support::{
    FakeBackend, FakeTunnel, MemoryStateStore, ScriptedConsole, StaticProbe, sample_config,
    sample_key,
};

type TestReconciler =
    Reconciler<FakeBackend, FakeTunnel, MemoryStateStore, ScriptedConsole, StaticProbe>;

fn reconciler(
    backend: &FakeBackend,
    tunnel: &FakeTunnel,
    store: &MemoryStateStore,
    console: &ScriptedConsole,
) -> TestReconciler {
    Reconciler::new(
        sample_config(),
        backend.clone(),
        tunnel.clone(),
        store.clone(),
        console.clone(),
        StaticProbe::default(),
    )
    .with_key_poll(2, Duration::from_millis(0))
}

fn deployed_state() -> DeploymentState {
    let mut state = DeploymentState::default();
    state.record_deployment("vpn-server-us-central1-a", "us-central1", "us-central1-a");
    state
}

#[tokio::test]
async fn deploy_rejects_a_malformed_zone_before_any_cloud_call() {
    let backend = FakeBackend::new();
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &MemoryStateStore::new(),
        &ScriptedConsole::headless(),
    );

    let err = engine.deploy("bogus").await.expect_err("zone must be rejected");

    assert!(matches!(err, EngineError::InvalidZone { ref zone } if zone == "bogus"));
    assert!(backend.calls().is_empty(), "no cloud call may be issued");
}

#[tokio::test]
async fn deploy_refuses_to_replace_an_existing_instance_unattended() {
    let backend = FakeBackend::new();
    let store = MemoryStateStore::with_state(deployed_state());
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &store,
        &ScriptedConsole::headless(),
    );

    let err = engine
        .deploy("us-central1-a")
        .await
        .expect_err("unattended deploy over an instance must hard-fail");

    assert!(matches!(err, EngineError::AlreadyDeployed { .. }));
    assert!(backend.calls().is_empty());
    assert_eq!(store.current(), deployed_state(), "state must be untouched");
}

#[tokio::test]
async fn deploy_records_state_and_rewrites_the_tunnel_config() {
    let backend = FakeBackend::new();
    let tunnel = FakeTunnel::new();
    let store = MemoryStateStore::new();
    let key = sample_key();
    backend.push_create("vpn-server-us-central1-a", Some("1.2.3.4"));
    backend.push_serial(&format!("boot...\n[PUBLIC_KEY] {key}\n"));

    let engine = reconciler(&backend, &tunnel, &store, &ScriptedConsole::headless());
    engine
        .deploy("us-central1-a")
        .await
        .expect("deploy should succeed");

    let state = store.current();
    assert_eq!(state.instance_name.as_deref(), Some("vpn-server-us-central1-a"));
    assert_eq!(state.region.as_deref(), Some("us-central1"));
    assert_eq!(state.zone.as_deref(), Some("us-central1-a"));
    assert_eq!(state.status.as_deref(), Some(STATUS_RUNNING));
    assert_eq!(state.server_public_key.as_deref(), Some(key.as_str()));
    assert_eq!(tunnel.endpoint(), Some((String::from("1.2.3.4"), 51820)));
    assert_eq!(tunnel.peer_key().as_deref(), Some(key.as_str()));
}

#[tokio::test]
async fn deploy_tolerates_a_missing_server_key() {
    let backend = FakeBackend::new();
    let store = MemoryStateStore::new();
    backend.push_create("vpn-server-us-central1-a", Some("1.2.3.4"));
    // Serial console never yields a key; the scripted default is empty.

    let console = ScriptedConsole::headless();
    let engine = reconciler(&backend, &FakeTunnel::new(), &store, &console);
    engine
        .deploy("us-central1-a")
        .await
        .expect("key retrieval failure is non-fatal");

    assert_eq!(store.current().server_public_key, None);
    assert!(console.printed("Public key not found"));
}

#[tokio::test]
async fn deploy_without_a_public_ip_fails() {
    let backend = FakeBackend::new();
    backend.push_create("vpn-server-us-central1-a", None);
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &MemoryStateStore::new(),
        &ScriptedConsole::headless(),
    );

    let err = engine
        .deploy("us-central1-a")
        .await
        .expect_err("missing IP must fail deployment");
    assert!(matches!(err, EngineError::DeploymentFailed { .. }));
}

#[tokio::test]
async fn deploy_config_failure_is_fatal_but_state_stays_persisted() {
    let backend = FakeBackend::new();
    let tunnel = FakeTunnel::new();
    let store = MemoryStateStore::new();
    backend.push_create("vpn-server-us-central1-a", Some("1.2.3.4"));
    tunnel.fail_config();

    let engine = reconciler(&backend, &tunnel, &store, &ScriptedConsole::headless());
    let err = engine
        .deploy("us-central1-a")
        .await
        .expect_err("config rewrite failure is fatal");

    assert!(matches!(err, EngineError::ConfigUpdate(_)));
    // The accepted inconsistency window: state persisted, config stale.
    assert!(store.current().is_deployed());
}

#[tokio::test]
async fn start_without_an_instance_fails() {
    let engine = reconciler(
        &FakeBackend::new(),
        &FakeTunnel::new(),
        &MemoryStateStore::new(),
        &ScriptedConsole::headless(),
    );
    let err = engine.start().await.expect_err("no instance in state");
    assert!(matches!(err, EngineError::NoInstance));
}

#[rstest]
#[case(ServerStatus::NotFound)]
#[case(ServerStatus::Unavailable { message: String::from("503") })]
#[tokio::test]
async fn start_fails_when_status_cannot_be_confirmed(#[case] status: ServerStatus) {
    let backend = FakeBackend::new();
    backend.push_status(status);
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &MemoryStateStore::with_state(deployed_state()),
        &ScriptedConsole::headless(),
    );

    let err = engine.start().await.expect_err("status must be confirmed");
    assert!(matches!(err, EngineError::StatusCheckFailed { .. }));
    assert_eq!(backend.call_count("start"), 0);
}

#[tokio::test]
async fn start_refuses_a_transitioning_instance() {
    let backend = FakeBackend::new();
    backend.push_status(ServerStatus::Known {
        raw: String::from("STOPPING"),
    });
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &MemoryStateStore::with_state(deployed_state()),
        &ScriptedConsole::headless(),
    );

    let err = engine.start().await.expect_err("transitioning state");
    assert!(matches!(err, EngineError::Busy { .. }));
    assert_eq!(backend.call_count("start"), 0);
}

#[tokio::test]
async fn start_on_a_running_instance_refreshes_without_a_start_call() {
    let backend = FakeBackend::new();
    let tunnel = FakeTunnel::new();
    let mut seeded = deployed_state();
    seeded.server_public_key = Some(sample_key());
    backend.push_status_running();
    backend.push_ip(Some("5.6.7.8"));

    let engine = reconciler(
        &backend,
        &tunnel,
        &MemoryStateStore::with_state(seeded),
        &ScriptedConsole::headless(),
    );
    engine.start().await.expect("idempotent start should succeed");

    assert_eq!(backend.call_count("start"), 0, "no start command when running");
    assert_eq!(tunnel.endpoint(), Some((String::from("5.6.7.8"), 51820)));
    assert_eq!(tunnel.peer_key(), Some(sample_key()));
}

#[tokio::test]
async fn start_brings_a_stopped_instance_up() {
    let backend = FakeBackend::new();
    let tunnel = FakeTunnel::new();
    let mut seeded = deployed_state();
    seeded.status = Some(STATUS_TERMINATED.to_owned());
    seeded.server_public_key = Some(sample_key());
    let store = MemoryStateStore::with_state(seeded);
    backend.push_status(ServerStatus::Known {
        raw: STATUS_TERMINATED.to_owned(),
    });
    backend.push_start(Some("9.9.9.9"));

    let engine = reconciler(&backend, &tunnel, &store, &ScriptedConsole::headless());
    engine.start().await.expect("start should succeed");

    assert_eq!(backend.call_count("start"), 1);
    assert_eq!(store.current().status.as_deref(), Some(STATUS_RUNNING));
    assert_eq!(tunnel.endpoint(), Some((String::from("9.9.9.9"), 51820)));
}

#[tokio::test]
async fn stop_without_an_instance_is_a_no_op_success() {
    let backend = FakeBackend::new();
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &MemoryStateStore::new(),
        &ScriptedConsole::headless(),
    );
    engine.stop().await.expect("nothing to stop is success");
    assert!(backend.calls().is_empty());
}

#[tokio::test]
async fn stop_disconnects_first_and_aborts_on_failure() {
    let backend = FakeBackend::new();
    let tunnel = FakeTunnel::new();
    tunnel.set_connected(true);
    tunnel.fail_disconnect();
    let store = MemoryStateStore::with_state(deployed_state());

    let engine = reconciler(&backend, &tunnel, &store, &ScriptedConsole::headless());
    let err = engine.stop().await.expect_err("failed disconnect aborts stop");

    assert!(matches!(err, EngineError::Tunnel(_)));
    assert_eq!(backend.call_count("stop"), 0, "cloud stop must not be issued");
    assert_eq!(store.current().status.as_deref(), Some(STATUS_RUNNING));
}

#[tokio::test]
async fn stop_marks_the_instance_terminated() {
    let backend = FakeBackend::new();
    let store = MemoryStateStore::with_state(deployed_state());
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &store,
        &ScriptedConsole::headless(),
    );

    engine.stop().await.expect("stop should succeed");

    assert_eq!(backend.call_count("stop"), 1);
    let state = store.current();
    assert_eq!(state.status.as_deref(), Some(STATUS_TERMINATED));
    assert!(state.is_deployed(), "identity survives a stop");
}

#[tokio::test]
async fn stopping_twice_issues_only_one_cloud_call() {
    let backend = FakeBackend::new();
    let store = MemoryStateStore::with_state(deployed_state());
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &store,
        &ScriptedConsole::headless(),
    );

    engine.stop().await.expect("first stop should succeed");
    engine.stop().await.expect("second stop is a no-op");

    assert_eq!(backend.call_count("stop"), 1);
}

#[tokio::test]
async fn delete_unattended_without_force_requires_confirmation() {
    let backend = FakeBackend::new();
    let store = MemoryStateStore::with_state(deployed_state());
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &store,
        &ScriptedConsole::headless(),
    );

    let err = engine.delete(false).await.expect_err("must require --force");

    assert!(matches!(err, EngineError::ConfirmationRequired));
    assert_eq!(backend.call_count("delete"), 0);
    assert_eq!(store.current(), deployed_state());
}

#[tokio::test]
async fn delete_declined_interactively_leaves_state_unchanged() {
    let backend = FakeBackend::new();
    let store = MemoryStateStore::with_state(deployed_state());
    let console = ScriptedConsole::interactive();
    console.push_confirm(false);

    let engine = reconciler(&backend, &FakeTunnel::new(), &store, &console);
    let err = engine.delete(false).await.expect_err("declined confirm fails");

    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(backend.call_count("delete"), 0);
    assert_eq!(store.current(), deployed_state());
}

#[tokio::test]
async fn delete_forced_clears_identity_and_key() {
    let backend = FakeBackend::new();
    let mut seeded = deployed_state();
    seeded.server_public_key = Some(sample_key());
    let store = MemoryStateStore::with_state(seeded);

    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &store,
        &ScriptedConsole::headless(),
    );
    engine.delete(true).await.expect("forced delete should succeed");

    assert_eq!(backend.call_count("delete"), 1);
    let state = store.current();
    assert!(!state.is_deployed());
    assert_eq!(state.region, None);
    assert_eq!(state.status, None);
    assert_eq!(state.server_public_key, None);
}

#[tokio::test]
async fn connect_while_connected_is_idempotent() {
    let backend = FakeBackend::new();
    let tunnel = FakeTunnel::new();
    tunnel.set_connected(true);

    let engine = reconciler(
        &backend,
        &tunnel,
        &MemoryStateStore::with_state(deployed_state()),
        &ScriptedConsole::headless(),
    );
    engine.connect(None).await.expect("already connected is success");

    assert!(backend.calls().is_empty());
    assert!(tunnel.events().is_empty(), "no tunnel mutation may happen");
}

#[tokio::test]
async fn connect_requires_a_running_instance() {
    let backend = FakeBackend::new();
    backend.push_status(ServerStatus::Known {
        raw: STATUS_TERMINATED.to_owned(),
    });
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &MemoryStateStore::with_state(deployed_state()),
        &ScriptedConsole::headless(),
    );

    let err = engine.connect(None).await.expect_err("stopped server");
    assert!(matches!(err, EngineError::NotRunning { ref display } if display == "STOPPED"));
}

#[tokio::test]
async fn connect_fails_without_an_obtainable_key() {
    let backend = FakeBackend::new();
    backend.push_status_running();
    // Serial console stays silent; both poll attempts find nothing.
    let engine = reconciler(
        &backend,
        &FakeTunnel::new(),
        &MemoryStateStore::with_state(deployed_state()),
        &ScriptedConsole::headless(),
    );

    let err = engine.connect(None).await.expect_err("no key, no tunnel");
    assert!(matches!(err, EngineError::MissingServerKey));
}

#[tokio::test]
async fn connect_applies_mode_fetches_key_and_connects() {
    let backend = FakeBackend::new();
    let tunnel = FakeTunnel::new();
    let store = MemoryStateStore::with_state(deployed_state());
    let key = sample_key();
    backend.push_status_running();
    backend.push_serial(&format!("[PUBLIC_KEY] {key}"));

    let engine = reconciler(&backend, &tunnel, &store, &ScriptedConsole::headless());
    engine
        .connect(Some(TunnelMode::Socks5))
        .await
        .expect("connect should succeed");

    assert!(tunnel.is_connected());
    assert_eq!(tunnel.route_scope(), Some(TunnelMode::Socks5));
    assert_eq!(tunnel.peer_key().as_deref(), Some(key.as_str()));
    let state = store.current();
    assert_eq!(state.tunnel_mode, Some(TunnelMode::Socks5));
    assert_eq!(state.server_public_key.as_deref(), Some(key.as_str()));
}

#[tokio::test]
async fn disconnect_while_down_is_idempotent() {
    let tunnel = FakeTunnel::new();
    let engine = reconciler(
        &FakeBackend::new(),
        &tunnel,
        &MemoryStateStore::new(),
        &ScriptedConsole::headless(),
    );
    engine.disconnect().expect("already down is success");
    assert!(tunnel.events().is_empty());
}

#[tokio::test]
async fn switch_mode_unattended_toggles_and_warns_instead_of_cycling() {
    let tunnel = FakeTunnel::new();
    tunnel.set_connected(true);
    let store = MemoryStateStore::with_state(deployed_state());
    let console = ScriptedConsole::headless();

    let engine = reconciler(&FakeBackend::new(), &tunnel, &store, &console);
    engine.switch_mode(None).await.expect("toggle should succeed");

    assert_eq!(store.current().tunnel_mode, Some(TunnelMode::Socks5));
    assert_eq!(tunnel.route_scope(), Some(TunnelMode::Socks5));
    assert!(tunnel.is_connected(), "no automatic reconnect cycle");
    assert!(console.printed("applies after a reconnect"));
}

#[tokio::test]
async fn switch_mode_to_the_current_mode_is_a_no_op() {
    let tunnel = FakeTunnel::new();
    let store = MemoryStateStore::with_state(deployed_state());
    let engine = reconciler(
        &FakeBackend::new(),
        &tunnel,
        &store,
        &ScriptedConsole::headless(),
    );

    engine
        .switch_mode(Some(TunnelMode::Vpn))
        .await
        .expect("unchanged mode is success");
    assert!(tunnel.events().is_empty());
    assert_eq!(store.save_count(), 0);
}

#[tokio::test]
async fn rotation_requires_an_instance() {
    let engine = reconciler(
        &FakeBackend::new(),
        &FakeTunnel::new(),
        &MemoryStateStore::new(),
        &ScriptedConsole::headless(),
    );
    let err = engine.rotate_ip(None).await.expect_err("nothing to rotate");
    assert!(matches!(err, EngineError::NoInstance));
}
