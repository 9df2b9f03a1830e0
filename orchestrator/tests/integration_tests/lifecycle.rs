// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Agent waits, concurrent runs, cancellation and teardown

use crate::common::{count_matching, default_reply, TestContext, MASTER};
use async_trait::async_trait;
use gluu_common::api::{Node, NodeRole, NodeState};
use gluu_common::steps::Step;
use gluu_datastore::{Error, MemoryBackend, StoreBackend, Table};
use gluu_orchestrator::setup::StepError;
use gluu_orchestrator::SetupError;
use gluu_remote_exec::{FakeReply, Target};
use gluu_test_utils::dev::poll::{wait_for_condition, CondCheckError};
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test(start_paused = true)]
async fn test_agent_wait_gives_up() {
    let cptestctx = TestContext::new("test_agent_wait_gives_up").await;
    let node = cptestctx.add_node("web-1", NodeRole::WebFront).await;
    cptestctx.executor.set_handler(Box::new(|target, command| {
        if command == "supervisorctl pid" {
            FakeReply::Timeout
        } else {
            default_reply(target, command)
        }
    }));

    let start = tokio::time::Instant::now();
    let err = cptestctx.deploy(&node).await.unwrap_err();
    let elapsed = start.elapsed();

    match err {
        SetupError::Step {
            step: Step::WaitForAgent,
            err: StepError::AgentUnreachable { attempts, .. },
        } => assert_eq!(attempts, 6),
        err => panic!("unexpected error: {err:?}"),
    }
    let probes: Vec<_> = cptestctx
        .executor
        .invocations()
        .into_iter()
        .filter(|i| i.command == "supervisorctl pid")
        .collect();
    assert_eq!(probes.len(), 6);
    for pair in probes.windows(2) {
        assert!(pair[1].at - pair[0].at >= Duration::from_secs(10));
    }
    assert!(elapsed >= Duration::from_secs(50));

    let node = cptestctx.node(&node).await;
    assert_eq!(node.state, NodeState::Failed);
    assert!(node.steps.is_done(Step::AttachOverlay));
    assert!(!node.steps.is_done(Step::WaitForAgent));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_parallel_deploys_get_distinct_addresses() {
    let cptestctx =
        TestContext::new("test_parallel_deploys_get_distinct_addresses").await;
    let web1 = cptestctx.add_node("web-1", NodeRole::WebFront).await;
    let web2 = cptestctx.add_node("web-2", NodeRole::WebFront).await;

    let (r1, r2) =
        tokio::join!(cptestctx.deploy(&web1), cptestctx.deploy(&web2));
    assert_eq!(r1.unwrap(), NodeState::SetupFinished);
    assert_eq!(r2.unwrap(), NodeState::SetupFinished);

    let a1 = cptestctx.node(&web1).await.overlay.unwrap().addr;
    let a2 = cptestctx.node(&web2).await.overlay.unwrap().addr;
    assert_ne!(a1, a2);
    let reserved = cptestctx.cluster().await.reserved_addrs;
    assert!(reserved.contains(&a1));
    assert!(reserved.contains(&a2));
    assert_eq!(reserved.len(), 2);

    cptestctx.cleanup_successful();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_deploy_of_same_node_is_rejected() {
    let cptestctx =
        TestContext::new("test_concurrent_deploy_of_same_node_is_rejected")
            .await;
    let node = cptestctx.add_node("web-1", NodeRole::WebFront).await;
    let agent_up = Arc::new(AtomicBool::new(false));
    let up = agent_up.clone();
    cptestctx.executor.set_handler(Box::new(move |target, command| {
        if command == "supervisorctl pid" && !up.load(Ordering::SeqCst) {
            FakeReply::failure()
        } else {
            default_reply(target, command)
        }
    }));

    let orchestrator = cptestctx.orchestrator.clone();
    let node_id = node.id;
    let first = tokio::spawn(async move {
        orchestrator.deploy(node_id, &CancellationToken::new()).await
    });

    // Wait until the first run is retrying its agent probe.
    let executor = cptestctx.executor.clone();
    wait_for_condition(
        || {
            let executor = executor.clone();
            async move {
                if executor.commands().iter().any(|c| c == "supervisorctl pid")
                {
                    Ok(())
                } else {
                    Err(CondCheckError::<()>::NotYet)
                }
            }
        },
        &Duration::from_millis(10),
        &Duration::from_secs(5),
    )
    .await
    .unwrap();

    let err = cptestctx.deploy(&node).await.unwrap_err();
    assert!(
        matches!(err, SetupError::Busy { node_id } if node_id == node.id),
        "unexpected error: {err:?}"
    );
    let err = cptestctx.orchestrator.teardown(node.id).await.unwrap_err();
    assert!(
        matches!(err, SetupError::Busy { .. }),
        "unexpected error: {err:?}"
    );

    agent_up.store(true, Ordering::SeqCst);
    let state = first.await.unwrap().unwrap();
    assert_eq!(state, NodeState::SetupFinished);
    // Only one container was ever created.
    assert_eq!(count_matching(&cptestctx.executor.commands(), "docker run"), 1);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_cancelled_deploy_runs_nothing() {
    let cptestctx =
        TestContext::new("test_cancelled_deploy_runs_nothing").await;
    let node = cptestctx.add_node("web-1", NodeRole::WebFront).await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err =
        cptestctx.orchestrator.deploy(node.id, &cancel).await.unwrap_err();
    assert!(
        matches!(err, SetupError::Cancelled { step: Step::CreateContainer }),
        "unexpected error: {err:?}"
    );
    assert!(cptestctx.executor.invocations().is_empty());
    let node = cptestctx.node(&node).await;
    assert_eq!(node.state, NodeState::Failed);
    assert_eq!(node.last_completed_step(), None);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_step_delay_observes_cancellation() {
    let cptestctx = TestContext::with_config(
        "test_step_delay_observes_cancellation",
        |config| config.step_delay_ms = 60_000,
    )
    .await;
    let node = cptestctx.add_node("web-1", NodeRole::WebFront).await;
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    cptestctx.executor.set_handler(Box::new(move |target, command| {
        if command.starts_with("sudo docker run") {
            canceller.cancel();
        }
        default_reply(target, command)
    }));

    // Not paused: the delay must be cut short by the token, not by time.
    let err = tokio::time::timeout(
        Duration::from_secs(30),
        cptestctx.orchestrator.deploy(node.id, &cancel),
    )
    .await
    .expect("deploy did not stop at cancellation")
    .unwrap_err();
    assert!(
        matches!(err, SetupError::Cancelled { step: Step::AttachOverlay }),
        "unexpected error: {err:?}"
    );
    let node = cptestctx.node(&node).await;
    assert!(node.steps.is_done(Step::CreateContainer));
    assert_eq!(node.state, NodeState::Failed);

    cptestctx.cleanup_successful();
}

fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

async fn assert_removed(cptestctx: &TestContext, node: &Node) {
    let err = cptestctx.datastore.get::<Node>(node.id).await.unwrap_err();
    assert!(
        matches!(err, gluu_datastore::Error::ObjectNotFound { .. }),
        "unexpected error: {err:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_teardown_leaves_replication() {
    let cptestctx = TestContext::new("test_teardown_leaves_replication").await;
    cptestctx.deployed("ldap-1", NodeRole::Directory).await;
    let second = cptestctx.deployed("ldap-2", NodeRole::Directory).await;
    cptestctx.executor.clear();

    let state = cptestctx.orchestrator.teardown(second.id).await.unwrap();
    assert_eq!(state, NodeState::TeardownFinished);

    let on_second = cptestctx.commands_on(&cptestctx.container_target(&second));
    assert_eq!(
        on_second,
        vec![
            "cat > /home/ldap/.pw".to_string(),
            "/opt/opendj/bin/dsreplication disable --hostname 10.20.10.2 \
             --port 4444 --adminUID admin --adminPasswordFile /home/ldap/.pw \
             -X -n --disableAll"
                .to_string(),
            "rm -f /home/ldap/.pw".to_string(),
        ]
    );
    assert_eq!(
        cptestctx.commands_on(&Target::machine(MASTER)),
        vec![
            "sudo weave detach ldap-2-cid".to_string(),
            "sudo docker rm -f ldap-2-cid".to_string(),
        ]
    );
    assert_removed(&cptestctx, &second).await;
    let reserved = cptestctx.cluster().await.reserved_addrs;
    assert!(reserved.contains(&addr("10.20.10.1")));
    assert!(!reserved.contains(&addr("10.20.10.2")));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_teardown_of_sole_directory() {
    let cptestctx = TestContext::new("test_teardown_of_sole_directory").await;
    let node = cptestctx.deployed("ldap-1", NodeRole::Directory).await;
    cptestctx.executor.clear();

    cptestctx.orchestrator.teardown(node.id).await.unwrap();
    let commands = cptestctx.executor.commands();
    assert_eq!(count_matching(&commands, "dsreplication"), 0);
    assert_eq!(count_matching(&commands, "docker rm -f ldap-1-cid"), 1);
    assert_removed(&cptestctx, &node).await;
    assert!(cptestctx.cluster().await.reserved_addrs.is_empty());

    cptestctx.cleanup_successful();
}

#[tokio::test(start_paused = true)]
async fn test_failed_teardown_keeps_node() {
    let cptestctx = TestContext::new("test_failed_teardown_keeps_node").await;
    cptestctx.deployed("ldap-1", NodeRole::Directory).await;
    let second = cptestctx.deployed("ldap-2", NodeRole::Directory).await;
    cptestctx.executor.set_handler(Box::new(|target, command| {
        if command.contains("dsreplication disable") {
            FakeReply::failure()
        } else {
            default_reply(target, command)
        }
    }));
    cptestctx.executor.clear();

    let err = cptestctx.orchestrator.teardown(second.id).await.unwrap_err();
    assert!(
        matches!(err, SetupError::Teardown(_)),
        "unexpected error: {err:?}"
    );
    let node = cptestctx.node(&second).await;
    assert_eq!(node.state, NodeState::Failed);
    let commands = cptestctx.executor.commands();
    assert_eq!(count_matching(&commands, "docker rm"), 0);
    assert_eq!(
        commands.last().map(String::as_str),
        Some("rm -f /home/ldap/.pw")
    );
    assert!(cptestctx
        .cluster()
        .await
        .reserved_addrs
        .contains(&addr("10.20.10.2")));

    cptestctx.cleanup_successful();
}

async fn set_state(cptestctx: &TestContext, node: &Node, state: NodeState) {
    let mut node = cptestctx.node(node).await;
    node.state = state;
    node.touch();
    cptestctx.datastore.update(&node).await.unwrap();
}

#[tokio::test]
async fn test_complete_node_runs_nothing() {
    let cptestctx = TestContext::new("test_complete_node_runs_nothing").await;
    let node = cptestctx.deployed("ldap-1", NodeRole::Directory).await;

    for state in [NodeState::Failed, NodeState::Pending] {
        set_state(&cptestctx, &node, state).await;
        cptestctx.executor.clear();
        let state = cptestctx.deploy(&node).await.unwrap();
        assert_eq!(state, NodeState::SetupFinished);
        assert!(cptestctx.executor.invocations().is_empty());
        assert_eq!(
            cptestctx.node(&node).await.state,
            NodeState::SetupFinished
        );
    }

    cptestctx.deploy(&node).await.unwrap();
    assert!(cptestctx.executor.invocations().is_empty());

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_claimed_node_is_left_alone() {
    let cptestctx = TestContext::new("test_claimed_node_is_left_alone").await;
    let node = cptestctx.add_node("web-1", NodeRole::WebFront).await;
    // As left behind by a run in another process.
    set_state(&cptestctx, &node, NodeState::SetupInProgress).await;

    let err = cptestctx.deploy(&node).await.unwrap_err();
    assert!(
        matches!(err, SetupError::Busy { node_id } if node_id == node.id),
        "unexpected error: {err:?}"
    );
    let err = cptestctx.orchestrator.teardown(node.id).await.unwrap_err();
    assert!(
        matches!(err, SetupError::Busy { .. }),
        "unexpected error: {err:?}"
    );
    assert!(cptestctx.executor.invocations().is_empty());
    assert_eq!(cptestctx.node(&node).await.state, NodeState::SetupInProgress);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_recover_waits_for_claim_to_go_stale() {
    let cptestctx =
        TestContext::new("test_recover_waits_for_claim_to_go_stale").await;
    let node = cptestctx.add_node("web-1", NodeRole::WebFront).await;
    set_state(&cptestctx, &node, NodeState::SetupInProgress).await;

    let err = cptestctx.orchestrator.recover(node.id, false).await.unwrap_err();
    assert!(
        matches!(err, SetupError::ClaimNotStale { node_id, .. }
            if node_id == node.id),
        "unexpected error: {err:?}"
    );
    assert_eq!(cptestctx.node(&node).await.state, NodeState::SetupInProgress);

    let mut stuck = cptestctx.node(&node).await;
    stuck.time_modified = chrono::Utc::now() - chrono::Duration::hours(2);
    cptestctx.datastore.update(&stuck).await.unwrap();
    let state = cptestctx.orchestrator.recover(node.id, false).await.unwrap();
    assert_eq!(state, NodeState::Failed);
    assert_eq!(cptestctx.node(&node).await.state, NodeState::Failed);

    let state = cptestctx.deploy(&node).await.unwrap();
    assert_eq!(state, NodeState::SetupFinished);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_forced_recover_clears_replication_flag() {
    let cptestctx =
        TestContext::new("test_forced_recover_clears_replication_flag").await;
    let node = cptestctx.deployed("ldap-1", NodeRole::Directory).await;
    let mut flagged = cptestctx.node(&node).await;
    flagged.replicating = true;
    flagged.touch();
    cptestctx.datastore.update(&flagged).await.unwrap();
    cptestctx.executor.clear();

    let err = cptestctx.orchestrator.teardown(node.id).await.unwrap_err();
    assert!(
        matches!(err, SetupError::Busy { .. }),
        "unexpected error: {err:?}"
    );
    assert!(cptestctx.executor.invocations().is_empty());

    let state = cptestctx.orchestrator.recover(node.id, true).await.unwrap();
    assert_eq!(state, NodeState::SetupFinished);
    let node = cptestctx.node(&node).await;
    assert!(!node.replicating);
    cptestctx.orchestrator.teardown(node.id).await.unwrap();

    cptestctx.cleanup_successful();
}

/// Refuses to store any node as finished.
struct NoFinishBackend {
    inner: MemoryBackend,
}

#[async_trait]
impl StoreBackend for NoFinishBackend {
    async fn get(
        &self,
        table: Table,
        id: Uuid,
    ) -> Result<Option<serde_json::Value>, Error> {
        self.inner.get(table, id).await
    }

    async fn insert(
        &self,
        table: Table,
        id: Uuid,
        doc: serde_json::Value,
    ) -> Result<(), Error> {
        self.inner.insert(table, id, doc).await
    }

    async fn replace(
        &self,
        table: Table,
        id: Uuid,
        doc: serde_json::Value,
    ) -> Result<(), Error> {
        if table == Table::Nodes && doc["state"] == "setup_finished" {
            return Err(Error::Io {
                message: format!("writing node {id}"),
                err: io::Error::new(io::ErrorKind::Other, "disk full"),
            });
        }
        self.inner.replace(table, id, doc).await
    }

    async fn replace_if(
        &self,
        table: Table,
        id: Uuid,
        expected: &serde_json::Value,
        doc: serde_json::Value,
    ) -> Result<bool, Error> {
        self.inner.replace_if(table, id, expected, doc).await
    }

    async fn delete(&self, table: Table, id: Uuid) -> Result<bool, Error> {
        self.inner.delete(table, id).await
    }

    async fn all(&self, table: Table) -> Result<Vec<serde_json::Value>, Error> {
        self.inner.all(table).await
    }
}

#[tokio::test]
async fn test_unrecorded_finish_fails() {
    let backend = Arc::new(NoFinishBackend { inner: MemoryBackend::new() });
    let cptestctx =
        TestContext::with_backend("test_unrecorded_finish_fails", backend)
            .await;
    let node = cptestctx.add_node("web-1", NodeRole::WebFront).await;

    let err = cptestctx.deploy(&node).await.unwrap_err();
    assert!(
        matches!(err, SetupError::Store(Error::Io { .. })),
        "unexpected error: {err:?}"
    );
    let node = cptestctx.node(&node).await;
    assert_eq!(node.state, NodeState::Failed);
    assert!(node.is_complete());

    cptestctx.cleanup_successful();
}
