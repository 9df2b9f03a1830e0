// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovery, master and worker hosts

use crate::common::{TestContext, MASTER_ADDRESS, NEW_MACHINE_ADDRESS};
use gluu_common::api::{NodeRole, NodeState};
use gluu_common::steps::Step;
use gluu_orchestrator::setup::StepError;
use gluu_orchestrator::SetupError;
use gluu_remote_exec::Target;

#[tokio::test]
async fn test_discovery_then_worker() {
    let cptestctx = TestContext::new("test_discovery_then_worker").await;
    assert!(cptestctx.master.address.is_some());

    let consul = cptestctx.deployed("consul", NodeRole::Discovery).await;
    assert_eq!(
        consul.address.map(|a| a.to_string()).as_deref(),
        Some(NEW_MACHINE_ADDRESS)
    );
    let local = cptestctx.commands_on(&Target::Local);
    assert_eq!(
        local,
        vec![
            "docker-machine create --driver generic consul".to_string(),
            "docker-machine ip consul".to_string(),
        ]
    );
    let on_consul = cptestctx.commands_on(&Target::machine("consul"));
    assert_eq!(on_consul.len(), 1);
    assert!(on_consul[0].contains("progrium/consul -server -bootstrap"));
    cptestctx.executor.clear();

    let worker = cptestctx.deployed("worker-1", NodeRole::Worker).await;
    assert!(worker.is_complete());
    let create = &cptestctx.commands_on(&Target::Local)[0];
    assert!(
        create.starts_with("docker-machine create --driver generic --swarm ")
    );
    assert!(!create.contains("--swarm-master"));
    assert!(create.contains(&format!(
        "--swarm-discovery=consul://{NEW_MACHINE_ADDRESS}:8500"
    )));
    assert!(create.ends_with(" worker-1"));

    let on_worker = cptestctx.commands_on(&Target::machine("worker-1"));
    assert_eq!(
        on_worker,
        vec![
            "sudo curl -L git.io/weave -o /usr/local/bin/weave".to_string(),
            "sudo chmod +x /usr/local/bin/weave".to_string(),
            format!("sudo weave launch {MASTER_ADDRESS}"),
            on_worker[3].clone(),
            on_worker[4].clone(),
            "sudo docker pull gluufederation/oxauth:latest && \
             sudo docker pull gluufederation/nginx:latest"
                .to_string(),
        ]
    );
    assert!(on_worker[3].contains("recovery.py"));
    assert!(on_worker[4].contains("rng-tools"));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_master_needs_discovery() {
    let cptestctx = TestContext::new("test_master_needs_discovery").await;
    let master = cptestctx.add_node("master-2", NodeRole::Master).await;

    let err = cptestctx.deploy(&master).await.unwrap_err();
    match err {
        SetupError::Step {
            step: Step::Create,
            err: StepError::MissingPeer { role, cluster_id },
        } => {
            assert_eq!(role, NodeRole::Discovery);
            assert_eq!(cluster_id, cptestctx.cluster.id);
        }
        err => panic!("unexpected error: {err:?}"),
    }
    assert!(cptestctx.executor.invocations().is_empty());
    assert_eq!(cptestctx.node(&master).await.state, NodeState::Failed);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_master_joins_swarm_as_master() {
    let cptestctx = TestContext::new("test_master_joins_swarm_as_master").await;
    cptestctx.deployed("consul", NodeRole::Discovery).await;
    cptestctx.executor.clear();

    cptestctx.deployed("master-2", NodeRole::Master).await;
    let create = &cptestctx.commands_on(&Target::Local)[0];
    assert!(create.contains(" --swarm --swarm-master "));
    let on_master = cptestctx.commands_on(&Target::machine("master-2"));
    assert!(on_master.iter().any(|c| c == "sudo weave launch"));
    // Masters also receive the docker client certificates.
    assert!(on_master
        .iter()
        .any(|c| c == "sudo mkdir -p /opt/gluu/docker/certs"));
    let pushes = cptestctx
        .commands_on(&Target::Local)
        .into_iter()
        .filter(|c| c.starts_with("docker-machine scp"))
        .count();
    assert_eq!(pushes, 3);

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_host_teardown_removes_machine() {
    let cptestctx =
        TestContext::new("test_host_teardown_removes_machine").await;
    let consul = cptestctx.deployed("consul", NodeRole::Discovery).await;
    cptestctx.executor.clear();

    cptestctx.orchestrator.teardown(consul.id).await.unwrap();
    assert_eq!(
        cptestctx.executor.commands(),
        vec!["docker-machine rm -y consul".to_string()]
    );

    cptestctx.cleanup_successful();
}
