//! HTTP-level tests for the Compute Engine backend against a mock server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::backend::{CloudBackend, DeployRequest, ServerStatus};
use crate::test_support::{StaticTokenSource, sample_config};

const PROJECT_PATH: &str = "/projects/proj/zones/us-central1-a";

fn backend_for(server: &MockServer) -> GceBackend {
    let mut config = sample_config();
    config.project_id = String::from("proj");
    GceBackend::connect(&config, Arc::new(StaticTokenSource::new("test-token")))
        .unwrap_or_else(|err| panic!("connect should succeed: {err}"))
        .with_api_base(server.uri())
        .with_poll_interval(Duration::from_millis(5))
        .with_wait_timeout(Duration::from_millis(250))
}

fn deploy_request() -> DeployRequest {
    DeployRequest {
        name: String::from("vpn-server-us-central1-a"),
        region: String::from("us-central1"),
        zone: String::from("us-central1-a"),
        boot_payload: String::from("#!/bin/bash\ntrue\n"),
    }
}

#[tokio::test]
async fn server_status_maps_provider_answers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/instances/running")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "RUNNING"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/instances/missing")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/instances/locked")))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/instances/flaky")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let zone = "us-central1-a";

    let running = backend
        .server_status("running", zone)
        .await
        .expect("status query should not error");
    assert_eq!(
        running,
        ServerStatus::Known {
            raw: String::from("RUNNING")
        }
    );
    assert_eq!(
        backend.server_status("missing", zone).await.expect("query"),
        ServerStatus::NotFound
    );
    assert_eq!(
        backend.server_status("locked", zone).await.expect("query"),
        ServerStatus::Forbidden
    );
    assert!(matches!(
        backend.server_status("flaky", zone).await.expect("query"),
        ServerStatus::Unavailable { .. }
    ));
}

#[tokio::test]
async fn public_ip_reads_the_first_access_config() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/instances/vpn-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "RUNNING",
            "networkInterfaces": [
                {"accessConfigs": [{"natIP": "203.0.113.9"}]}
            ]
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let ip = backend
        .public_ip("vpn-1", "us-central1-a")
        .await
        .expect("lookup should not error");
    assert_eq!(ip, Some(String::from("203.0.113.9")));
}

#[tokio::test]
async fn create_server_waits_for_the_operation_then_reads_the_ip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{PROJECT_PATH}/instances")))
        .and(body_partial_json(json!({
            "name": "vpn-server-us-central1-a",
            "canIpForward": true,
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operation-create-1",
            "status": "PENDING"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{PROJECT_PATH}/operations/operation-create-1/wait")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operation-create-1",
            "status": "DONE"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "{PROJECT_PATH}/instances/vpn-server-us-central1-a"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "RUNNING",
            "networkInterfaces": [
                {"accessConfigs": [{"natIP": "198.51.100.4"}]}
            ]
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let created = backend
        .create_server(&deploy_request())
        .await
        .expect("create should succeed");

    assert_eq!(created.name, "vpn-server-us-central1-a");
    assert_eq!(created.public_ip, Some(String::from("198.51.100.4")));
}

#[tokio::test]
async fn completed_operation_errors_are_reported_as_remote_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{PROJECT_PATH}/instances/vpn-1/start")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operation-start-1",
            "status": "DONE",
            "error": {"errors": [
                {"code": "QUOTA_EXCEEDED", "message": "no CPUs left"}
            ]}
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let err = backend
        .start_server("vpn-1", "us-central1-a")
        .await
        .expect_err("remote failure should surface");

    let GceError::OperationFailed { message, .. } = err else {
        panic!("expected OperationFailed, got {err:?}");
    };
    assert!(message.contains("QUOTA_EXCEEDED"));
}

#[tokio::test]
async fn operation_wait_times_out_distinctly() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{PROJECT_PATH}/instances/vpn-1/stop")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operation-stop-1",
            "status": "PENDING"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{PROJECT_PATH}/operations/operation-stop-1/wait")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "operation-stop-1",
            "status": "RUNNING"
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let err = backend
        .stop_server("vpn-1", "us-central1-a")
        .await
        .expect_err("stuck operation should time out");

    assert!(matches!(err, GceError::OperationTimeout { action: "stop", .. }));
}

#[tokio::test]
async fn delete_treats_missing_instances_as_success() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{PROJECT_PATH}/instances/vpn-1")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    backend
        .delete_server("vpn-1", "us-central1-a")
        .await
        .expect("idempotent delete should succeed");
}

#[tokio::test]
async fn serial_console_returns_contents() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/instances/vpn-1/serialPort")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contents": "[PUBLIC_KEY] abc"
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let contents = backend
        .read_serial_console("vpn-1", "us-central1-a")
        .await
        .expect("serial read should succeed");
    assert_eq!(contents, "[PUBLIC_KEY] abc");
}

#[tokio::test]
async fn list_server_names_collects_item_names() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{PROJECT_PATH}/instances")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"name": "vpn-server-us-central1-a"},
                {"name": "vpn-server-us-central1-a-rotate2"}
            ]
        })))
        .mount(&server)
        .await;

    let backend = backend_for(&server);
    let names = backend
        .list_server_names("us-central1-a")
        .await
        .expect("list should succeed");
    assert_eq!(
        names,
        vec![
            String::from("vpn-server-us-central1-a"),
            String::from("vpn-server-us-central1-a-rotate2"),
        ]
    );
}
