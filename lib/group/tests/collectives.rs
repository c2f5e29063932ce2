// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end collective rounds between in-process tasks over loopback TCP

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use canopy_group::{
    CommunicationGroupClient, CommunicationGroupDriver, GroupConfig, GroupError, OperatorSpec,
    ReduceFunctionKind,
};
use canopy_runtime::{CodecKind, InMemoryNameRegistry, TransportConfig};
use tokio::task::JoinHandle;

type Clients = HashMap<String, Arc<CommunicationGroupClient>>;

fn group_config() -> GroupConfig {
    GroupConfig {
        receive_timeout_ms: Some(10_000),
        ..GroupConfig::default()
    }
}

async fn join(
    driver: &CommunicationGroupDriver,
    naming: &Arc<InMemoryNameRegistry>,
    task_id: &str,
) -> Arc<CommunicationGroupClient> {
    join_with(driver, naming, task_id, &group_config()).await
}

async fn join_with(
    driver: &CommunicationGroupDriver,
    naming: &Arc<InMemoryNameRegistry>,
    task_id: &str,
    config: &GroupConfig,
) -> Arc<CommunicationGroupClient> {
    let client = CommunicationGroupClient::listen(
        driver.task_configuration(task_id).unwrap(),
        TransportConfig::default(),
        naming.clone(),
        config,
    )
    .await
    .unwrap();
    Arc::new(client)
}

async fn join_all(driver: &CommunicationGroupDriver, naming: &Arc<InMemoryNameRegistry>) -> Clients {
    let mut clients = HashMap::new();
    for task_id in driver.members() {
        clients.insert(task_id.clone(), join(driver, naming, task_id).await);
    }
    clients
}

async fn results<T: std::fmt::Debug>(
    handles: Vec<(String, JoinHandle<Result<T, GroupError>>)>,
) -> HashMap<String, T> {
    let mut out = HashMap::new();
    for (task_id, handle) in handles {
        let value = handle.await.unwrap().unwrap();
        out.insert(task_id, value);
    }
    out
}

fn four_task_driver() -> CommunicationGroupDriver {
    let mut driver = CommunicationGroupDriver::new("g", 3).unwrap();
    driver.add_broadcast("model", "R").unwrap();
    driver
        .add_operator(
            "sum",
            OperatorSpec::reduce("R", ReduceFunctionKind::Sum).with_codec(CodecKind::Integer),
        )
        .unwrap();
    for task_id in ["R", "A", "B", "C"] {
        driver.add_task(task_id).unwrap();
    }
    driver
}

/// One broadcast of `value` from R followed by one sum of `locals` at R.
async fn broadcast_then_reduce(
    clients: &Clients,
    value: i64,
    locals: &[(&str, i64)],
) -> (HashMap<String, i64>, i64) {
    let mut receivers = Vec::new();
    for (task_id, _) in locals {
        let endpoint = clients[*task_id].broadcast_receiver::<i64>("model").unwrap();
        receivers.push((
            task_id.to_string(),
            tokio::spawn(async move { endpoint.receive().await }),
        ));
    }
    clients["R"]
        .broadcast_sender::<i64>("model")
        .unwrap()
        .send(value)
        .await
        .unwrap();
    let observed = results(receivers).await;

    let mut senders = Vec::new();
    for (task_id, local) in locals {
        let endpoint = clients[*task_id].reduce_sender::<i64>("sum").unwrap();
        let local = *local;
        senders.push((
            task_id.to_string(),
            tokio::spawn(async move { endpoint.send(local).await }),
        ));
    }
    let total = clients["R"]
        .reduce_receiver::<i64>("sum")
        .unwrap()
        .reduce()
        .await
        .unwrap();
    results(senders).await;

    (observed, total)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_and_sum_over_four_tasks() {
    canopy_runtime::logging::init();
    let driver = four_task_driver();
    let naming = Arc::new(InMemoryNameRegistry::new());
    let clients = join_all(&driver, &naming).await;

    let (observed, total) =
        broadcast_then_reduce(&clients, 42, &[("A", 1), ("B", 2), ("C", 3)]).await;

    for task_id in ["A", "B", "C"] {
        assert_eq!(observed[task_id], 42, "{task_id}");
    }
    assert_eq!(total, 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replaced_task_joins_next_round() {
    let mut driver = four_task_driver();
    let naming = Arc::new(InMemoryNameRegistry::new());
    let mut clients = join_all(&driver, &naming).await;
    let depth_before = driver.topology("model").unwrap().depth();

    // B dies; the driver re-places and every survivor picks up its new bundle
    clients.remove("B").unwrap().shutdown().await.unwrap();
    driver.replace_task("B", "D").unwrap();

    let d_config = driver.task_configuration("D").unwrap();
    let d_model = d_config.operator("model").unwrap();
    assert_eq!(d_model.topology.parent.as_deref(), Some("R"));
    assert!(d_model.topology.children.is_empty());
    assert_eq!(driver.topology("model").unwrap().depth(), depth_before);

    for task_id in ["R", "A", "C"] {
        clients[task_id]
            .reconfigure(driver.task_configuration(task_id).unwrap())
            .unwrap();
    }
    clients.insert("D".to_string(), join(&driver, &naming, "D").await);

    let (observed, total) =
        broadcast_then_reduce(&clients, 7, &[("A", 1), ("C", 3), ("D", 4)]).await;

    assert_eq!(observed.len(), 3);
    assert!(observed.values().all(|v| *v == 7));
    assert_eq!(total, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_late_value_from_abandoned_round_is_not_reduced() {
    let config = GroupConfig {
        receive_timeout_ms: Some(1_000),
        ..GroupConfig::default()
    };
    let mut driver = four_task_driver();
    let naming = Arc::new(InMemoryNameRegistry::new());
    let mut clients = HashMap::new();
    for task_id in ["R", "A", "B", "C"] {
        clients.insert(
            task_id.to_string(),
            join_with(&driver, &naming, task_id, &config).await,
        );
    }

    // A and B report, C is slow and R gives up on the round
    for (task_id, local) in [("A", 1), ("B", 2)] {
        clients[task_id]
            .reduce_sender::<i64>("sum")
            .unwrap()
            .send(local)
            .await
            .unwrap();
    }
    let err = clients["R"]
        .reduce_receiver::<i64>("sum")
        .unwrap()
        .reduce()
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::Timeout { source_task, .. } if source_task == "C"));

    // C's value lands in R's mailbox after the round was abandoned
    clients["C"]
        .reduce_sender::<i64>("sum")
        .unwrap()
        .send(100)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    clients.remove("B").unwrap().shutdown().await.unwrap();
    driver.replace_task("B", "D").unwrap();
    for task_id in ["R", "A", "C"] {
        clients[task_id]
            .reconfigure(driver.task_configuration(task_id).unwrap())
            .unwrap();
    }
    clients.insert("D".to_string(), join_with(&driver, &naming, "D", &config).await);

    let (observed, total) =
        broadcast_then_reduce(&clients, 7, &[("A", 1), ("C", 3), ("D", 4)]).await;
    assert!(observed.values().all(|v| *v == 7));
    assert_eq!(total, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_send_to_departed_task_is_unresolved() {
    let driver = four_task_driver();
    let naming = Arc::new(InMemoryNameRegistry::new());
    let mut clients = join_all(&driver, &naming).await;

    clients.remove("B").unwrap().shutdown().await.unwrap();

    let err = clients["R"]
        .broadcast_sender::<i64>("model")
        .unwrap()
        .send(1)
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::UnresolvedTask(t) if t == "B"));
}

fn seven_task_driver(spec_name: &str, spec: OperatorSpec) -> CommunicationGroupDriver {
    let mut driver = CommunicationGroupDriver::new("deep", 2).unwrap();
    driver.add_operator(spec_name, spec).unwrap();
    for task_id in ["R", "t1", "t2", "t3", "t4", "t5", "t6"] {
        driver.add_task(task_id).unwrap();
    }
    driver
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pipelined_broadcast_through_two_levels() {
    let chunk_size = NonZeroUsize::new(3).unwrap();
    let driver = seven_task_driver(
        "weights",
        OperatorSpec::broadcast("R").with_chunk_size(chunk_size),
    );
    assert_eq!(driver.topology("weights").unwrap().depth(), Some(2));

    let naming = Arc::new(InMemoryNameRegistry::new());
    let clients = join_all(&driver, &naming).await;

    let mut receivers = Vec::new();
    for task_id in ["t1", "t2", "t3", "t4", "t5", "t6"] {
        let endpoint = clients[task_id]
            .broadcast_receiver::<Vec<u32>>("weights")
            .unwrap();
        receivers.push((
            task_id.to_string(),
            tokio::spawn(async move { endpoint.receive().await }),
        ));
    }

    let weights: Vec<u32> = (0..20).collect();
    clients["R"]
        .broadcast_sender::<Vec<u32>>("weights")
        .unwrap()
        .send(weights.clone())
        .await
        .unwrap();

    let observed = results(receivers).await;
    assert_eq!(observed.len(), 6);
    for (task_id, value) in observed {
        assert_eq!(value, weights, "{task_id}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sum_through_two_levels() {
    let driver = seven_task_driver("sum", OperatorSpec::reduce("R", ReduceFunctionKind::Sum));
    let naming = Arc::new(InMemoryNameRegistry::new());
    let clients = join_all(&driver, &naming).await;

    let mut senders = Vec::new();
    for (i, task_id) in ["t1", "t2", "t3", "t4", "t5", "t6"].into_iter().enumerate() {
        let endpoint = clients[task_id].reduce_sender::<u64>("sum").unwrap();
        let local = i as u64 + 1;
        senders.push((
            task_id.to_string(),
            tokio::spawn(async move { endpoint.send(local).await }),
        ));
    }

    let total = clients["R"]
        .reduce_receiver::<u64>("sum")
        .unwrap()
        .reduce()
        .await
        .unwrap();
    results(senders).await;
    assert_eq!(total, 21);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_double_sum_carries_infinite_partials() {
    let driver = seven_task_driver(
        "sum",
        OperatorSpec::reduce("R", ReduceFunctionKind::Sum).with_codec(CodecKind::Double),
    );
    let naming = Arc::new(InMemoryNameRegistry::new());
    let clients = join_all(&driver, &naming).await;

    let mut senders = Vec::new();
    for task_id in ["t1", "t2", "t3", "t4", "t5", "t6"] {
        let endpoint = clients[task_id].reduce_sender::<f64>("sum").unwrap();
        senders.push((
            task_id.to_string(),
            tokio::spawn(async move { endpoint.send(f64::MAX).await }),
        ));
    }

    let total = clients["R"]
        .reduce_receiver::<f64>("sum")
        .unwrap()
        .reduce()
        .await
        .unwrap();
    results(senders).await;
    assert_eq!(total, f64::INFINITY);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scatter_delivers_each_element_once() {
    let driver = seven_task_driver("shards", OperatorSpec::scatter("R"));
    let naming = Arc::new(InMemoryNameRegistry::new());
    let clients = join_all(&driver, &naming).await;

    let mut receivers = Vec::new();
    for task_id in ["t1", "t2", "t3", "t4", "t5", "t6"] {
        let endpoint = clients[task_id].scatter_receiver::<u32>("shards").unwrap();
        receivers.push((
            task_id.to_string(),
            tokio::spawn(async move { endpoint.receive().await }),
        ));
    }

    let elements: Vec<u32> = (0..100).collect();
    clients["R"]
        .scatter_sender::<u32>("shards")
        .unwrap()
        .send(elements.clone())
        .await
        .unwrap();

    let shares = results(receivers).await;
    assert!(shares.values().all(|share| !share.is_empty()));

    let mut delivered: Vec<u32> = shares.into_values().flatten().collect();
    delivered.sort_unstable();
    assert_eq!(delivered, elements);
}

#[tokio::test]
async fn test_role_mismatches_are_rejected() {
    let driver = four_task_driver();
    let naming = Arc::new(InMemoryNameRegistry::new());
    let root = join(&driver, &naming, "R").await;
    let leaf = join(&driver, &naming, "A").await;

    assert!(matches!(
        leaf.broadcast_sender::<i64>("model"),
        Err(GroupError::NotRoot { .. })
    ));
    assert!(matches!(
        root.broadcast_receiver::<i64>("model"),
        Err(GroupError::NotReceiver { .. })
    ));
    assert!(matches!(
        root.reduce_sender::<i64>("sum"),
        Err(GroupError::NotSender { .. })
    ));
    assert!(matches!(
        leaf.reduce_receiver::<i64>("sum"),
        Err(GroupError::NotRoot { .. })
    ));
    assert!(matches!(
        leaf.broadcast_receiver::<i64>("sum"),
        Err(GroupError::WrongOperatorKind { .. })
    ));
    assert!(matches!(
        leaf.scatter_receiver::<i64>("missing"),
        Err(GroupError::UnknownOperator(_))
    ));
    // the integer codec only carries i64
    assert!(matches!(
        leaf.reduce_sender::<f64>("sum"),
        Err(GroupError::Serialization(_))
    ));
}

#[tokio::test]
async fn test_lone_root_reduction_is_empty() {
    let mut driver = CommunicationGroupDriver::new("solo", 2).unwrap();
    driver
        .add_operator("sum", OperatorSpec::reduce("R", ReduceFunctionKind::Sum))
        .unwrap();
    driver.add_task("R").unwrap();

    let naming = Arc::new(InMemoryNameRegistry::new());
    let root = join(&driver, &naming, "R").await;

    let err = root
        .reduce_receiver::<i64>("sum")
        .unwrap()
        .reduce()
        .await
        .unwrap_err();
    assert!(matches!(err, GroupError::EmptyReduction));
}

#[tokio::test]
async fn test_shutdown_fails_pending_receive() {
    let driver = four_task_driver();
    let naming = Arc::new(InMemoryNameRegistry::new());
    let leaf = join(&driver, &naming, "A").await;

    let endpoint = leaf.broadcast_receiver::<i64>("model").unwrap();
    let pending = tokio::spawn(async move { endpoint.receive().await });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    leaf.shutdown().await.unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, GroupError::ConnectionClosed(t) if t == "R"));
}
