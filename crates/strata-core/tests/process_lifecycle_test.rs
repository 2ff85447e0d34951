// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for process lifecycle, provenance and checkpoints.

mod common;

use common::*;
use strata_core::node::{Direction, LinkType, Node};
use strata_core::payload::Inputs;
use strata_core::process::ProcessState;
use strata_core::runner::RunnerError;

#[tokio::test]
async fn test_run_records_provenance() {
    let ctx = TestContext::memory();

    let (outputs, record) = ctx.runner.run_get_node::<AddOne>(x(41)).await.unwrap();
    let pid = record.pk.unwrap();

    assert_eq!(outputs.get("result").and_then(Node::as_int), Some(42));
    assert_eq!(record.process_state(), Some(ProcessState::Finished));
    assert!(record.is_finished_ok());
    assert!(record.sealed);

    // 1. input went in over an INPUT link
    let inputs = ctx
        .store
        .get_links(pid, Direction::Incoming, Some(LinkType::Input))
        .await
        .unwrap();
    assert_eq!(inputs.len(), 1);
    assert_eq!(inputs[0].label, "x");

    // 2. the new output came out over a CREATE link
    let created = ctx
        .store
        .get_links(pid, Direction::Outgoing, Some(LinkType::Create))
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].label, "result");
    assert_eq!(Some(created[0].target), outputs.get("result").and_then(|n| n.pk));

    // 3. no checkpoint survives a terminal state
    assert!(!ctx.has_checkpoint(pid).await);
}

#[tokio::test]
async fn test_checkpoint_exists_while_waiting() {
    let ctx = TestContext::memory();

    let handle = ctx.runner.submit::<Sleeper>(Inputs::new()).await.unwrap();
    let pid = handle.pid();
    ctx.wait_for_state(pid, ProcessState::Waiting).await;
    assert!(ctx.has_checkpoint(pid).await);

    assert!(ctx.controller().kill_process(pid, Some("enough")).await.unwrap());
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, RunnerError::Killed { .. }));
    assert!(!ctx.has_checkpoint(pid).await);

    let record = ctx.record(pid).await;
    assert!(record.is_killed());
    assert_eq!(record.process_status(), Some("enough"));

    let logs = ctx.store.get_logs(pid).await.unwrap();
    assert!(logs.iter().any(|log| log.message.contains("enough")));
}

#[tokio::test]
async fn test_resume_on_another_runner() {
    let ctx = TestContext::memory();

    let first = ctx.runner.clone();
    let handle = first.submit::<Napper>(Inputs::new()).await.unwrap();
    let pid = handle.pid();
    ctx.wait_for_state(pid, ProcessState::Waiting).await;

    // worker goes away mid-sleep; the checkpoint stays
    first.close().await;
    assert!(matches!(handle.wait().await, Err(RunnerError::Closed)));
    assert!(ctx.has_checkpoint(pid).await);
    assert!(!ctx.record(pid).await.is_terminated());

    let second = ctx.new_runner();
    let (outputs, record) = second.resume(pid).await.unwrap().wait().await.unwrap();
    assert_eq!(outputs.get("naps").and_then(Node::as_int), Some(1));
    assert!(record.is_finished_ok());
    assert!(!ctx.has_checkpoint(pid).await);
    second.close().await;
}

#[tokio::test]
async fn test_state_machine_never_leaves_terminal() {
    let ctx = TestContext::memory();

    let (_, record) = ctx.runner.run_get_node::<AddOne>(x(1)).await.unwrap();
    let pid = record.pk.unwrap();

    // a sealed record can't be resumed or continued
    assert!(ctx.runner.resume(pid).await.is_err());
    assert!(ctx.runner.continue_process(pid).await.is_err());
    assert_eq!(
        ctx.record(pid).await.process_state(),
        Some(ProcessState::Finished)
    );
}

#[tokio::test]
async fn test_invalid_inputs_store_nothing() {
    let ctx = TestContext::memory();

    let err = ctx.runner.run::<AddOne>(Inputs::new()).await.unwrap_err();
    assert!(matches!(err, RunnerError::Process(_)));
    let records = ctx
        .store
        .query(&strata_core::node::NodeFilter::processes())
        .await
        .unwrap();
    assert!(records.is_empty());
}
