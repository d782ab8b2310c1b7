// Copyright 2024 Mason project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use grpc_util::retry::RetryConfig;
use hashing::HashFunction;
use protos::gen::build::bazel::remote::execution::v2 as remexec;
use testutil::StubExecution;

use crate::execution_client::{ExecutionClient, ExecutionError};
use crate::RemoteOptions;

fn client(stub: &StubExecution) -> ExecutionClient {
    let mut options = RemoteOptions::new(&stub.address);
    options.retry = RetryConfig::new(Some(1), Some(1), Some(2)).unwrap();
    ExecutionClient::new(&options).unwrap()
}

fn sample_response(exit_code: i32) -> remexec::ExecuteResponse {
    remexec::ExecuteResponse {
        result: Some(remexec::ActionResult {
            exit_code,
            ..remexec::ActionResult::default()
        }),
        cached_result: false,
        ..remexec::ExecuteResponse::default()
    }
}

#[tokio::test]
async fn execute_returns_the_final_response() {
    let stub = StubExecution::new(0).await;
    let digest = HashFunction::Compatible.hash_data(b"action");
    stub.set_response(&digest.hash.to_hex(), sample_response(0));

    let response = client(&stub).execute(digest, false, "build-1").await.unwrap();
    assert_eq!(response.result.unwrap().exit_code, 0);
    assert_eq!(stub.execute_calls(), 1);
    assert_eq!(stub.wait_calls(), 0);
}

#[tokio::test]
async fn failed_actions_are_successful_calls() {
    // A non-zero exit code is a successful remote call with a failed action: it must come
    // back as a response, not as an error.
    let stub = StubExecution::new(0).await;
    let digest = HashFunction::Compatible.hash_data(b"failing action");
    stub.set_response(&digest.hash.to_hex(), sample_response(17));

    let response = client(&stub).execute(digest, false, "build-1").await.unwrap();
    assert_eq!(response.result.unwrap().exit_code, 17);
}

#[tokio::test]
async fn dropped_streams_reconnect_via_wait_execution() {
    let stub = StubExecution::new(1).await;
    let digest = HashFunction::Compatible.hash_data(b"slow action");
    stub.set_response(&digest.hash.to_hex(), sample_response(0));

    let response = client(&stub).execute(digest, false, "build-1").await.unwrap();
    assert_eq!(response.result.unwrap().exit_code, 0);
    assert_eq!(stub.execute_calls(), 1);
    assert_eq!(stub.wait_calls(), 1);
}

#[tokio::test]
async fn server_timeout_is_fatal_for_the_action() {
    let stub = StubExecution::new(0).await;
    let digest = HashFunction::Compatible.hash_data(b"deadline action");
    stub.set_response(
        &digest.hash.to_hex(),
        remexec::ExecuteResponse {
            status: Some(protos::gen::google::rpc::Status {
                code: tonic::Code::DeadlineExceeded as i32,
                message: "action timed out".to_string(),
                details: vec![],
            }),
            ..remexec::ExecuteResponse::default()
        },
    );

    match client(&stub).execute(digest, false, "build-1").await {
        Err(ExecutionError::Timeout) => {}
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn precondition_failures_are_reported_as_such() {
    let stub = StubExecution::new(0).await;
    let digest = HashFunction::Compatible.hash_data(b"incomplete action");
    stub.set_response(
        &digest.hash.to_hex(),
        remexec::ExecuteResponse {
            status: Some(protos::gen::google::rpc::Status {
                code: tonic::Code::FailedPrecondition as i32,
                message: "missing input blobs".to_string(),
                details: vec![],
            }),
            ..remexec::ExecuteResponse::default()
        },
    );

    match client(&stub).execute(digest, false, "build-1").await {
        Err(ExecutionError::Precondition(msg)) => assert!(msg.contains("missing input blobs")),
        other => panic!("expected a precondition error, got {other:?}"),
    }
}
