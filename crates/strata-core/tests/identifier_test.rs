// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifier resolution against the SQLite store.

mod common;

use common::*;
use strata_core::identifier::{resolve_identifier, resolve_process};
use strata_core::node::Node;

#[tokio::test]
async fn test_pk_label_and_uuid_precedence() {
    let ctx = TestContext::sqlite().await;
    let store = ctx.store.as_ref();

    let a = store.store_node(&Node::string("a")).await.unwrap();
    let a_pk = a.pk.unwrap();
    let b = store
        .store_node(&Node::string("b").with_label(a_pk.to_string()))
        .await
        .unwrap();
    let c = store
        .store_node(&Node::string("c").with_label(a.uuid.to_string()))
        .await
        .unwrap();

    // the pk wins over a label spelled the same
    let resolved = resolve_identifier(store, &a_pk.to_string(), None).await.unwrap();
    assert_eq!(resolved.uuid, a.uuid);
    // the escape forces the label
    let resolved = resolve_identifier(store, &format!("{a_pk}!"), None).await.unwrap();
    assert_eq!(resolved.uuid, b.uuid);

    // a full uuid is a uuid even when it is also a label
    let resolved = resolve_identifier(store, &a.uuid.to_string(), None).await.unwrap();
    assert_eq!(resolved.uuid, a.uuid);
    let resolved = resolve_identifier(store, &format!("{}!", a.uuid), None).await.unwrap();
    assert_eq!(resolved.uuid, c.uuid);
}

#[tokio::test]
async fn test_uuid_prefix_and_ambiguity() {
    let ctx = TestContext::sqlite().await;
    let store = ctx.store.as_ref();

    let node = store.store_node(&Node::int(7)).await.unwrap();
    let prefix = node.uuid.to_string()[..13].to_string();
    let resolved = resolve_identifier(store, &prefix, None).await.unwrap();
    assert_eq!(resolved.pk, node.pk);

    store.store_node(&Node::int(1).with_label("dup")).await.unwrap();
    store.store_node(&Node::int(2).with_label("dup")).await.unwrap();
    let err = resolve_identifier(store, "dup", None).await.unwrap_err();
    assert_eq!(err.error_code(), "MULTIPLE_OBJECTS");
}

#[tokio::test]
async fn test_resolve_process_by_label() {
    let ctx = TestContext::sqlite().await;
    let (_, record) = ctx.runner.run_get_node::<AddOne>(x(3)).await.unwrap();

    // process records are labelled with the process label by default
    let label = record.label.clone();
    let resolved = resolve_process(ctx.store.as_ref(), &format!("{label}!")).await.unwrap();
    assert_eq!(resolved.pk, record.pk);
}
