// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background execution through the task queue

use crate::common::{default_reply, TestContext};
use gluu_common::api::{Node, NodeRole, NodeState};
use gluu_common::typed_uuid::NodeUuid;
use gluu_orchestrator::task_queue::{
    Operation, TaskQueue, TaskQueueError, TaskRequest, TaskStatus,
};
use gluu_remote_exec::FakeReply;

#[tokio::test]
async fn test_queue_runs_requests_to_completion() {
    let cptestctx =
        TestContext::new("test_queue_runs_requests_to_completion").await;
    let web1 = cptestctx.add_node("web-1", NodeRole::WebFront).await;
    let web2 = cptestctx.add_node("web-2", NodeRole::WebFront).await;
    let missing = NodeUuid::new_v4();

    let queue = TaskQueue::start(
        &cptestctx.logctx.log,
        cptestctx.orchestrator.clone(),
        2,
    );
    let deploy = |node_id| TaskRequest { node_id, op: Operation::Deploy };
    let t1 = queue.enqueue(deploy(web1.id)).unwrap();
    let t2 = queue.enqueue(deploy(web2.id)).unwrap();
    let t3 = queue.enqueue(deploy(missing)).unwrap();
    assert!(queue.status(t1).is_some());

    queue.drain().await;
    assert_eq!(queue.status(t1), Some(TaskStatus::Succeeded));
    assert_eq!(queue.status(t2), Some(TaskStatus::Succeeded));
    match queue.status(t3) {
        Some(TaskStatus::Failed { message }) => {
            assert!(message.contains(&missing.to_string()), "{message}");
        }
        status => panic!("unexpected status: {status:?}"),
    }
    for node in [&web1, &web2] {
        assert_eq!(cptestctx.node(node).await.state, NodeState::SetupFinished);
    }

    let err = queue.enqueue(deploy(web1.id)).unwrap_err();
    assert!(matches!(err, TaskQueueError::ShutDown));

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_queue_teardown_and_failure() {
    let cptestctx = TestContext::new("test_queue_teardown_and_failure").await;
    let web = cptestctx.deployed("web-1", NodeRole::WebFront).await;
    let auth = cptestctx.add_node("auth-1", NodeRole::AuthServer).await;
    cptestctx.executor.set_handler(Box::new(|target, command| {
        if command.starts_with("sudo docker run") {
            FakeReply::failure()
        } else {
            default_reply(target, command)
        }
    }));

    let queue = TaskQueue::start(
        &cptestctx.logctx.log,
        cptestctx.orchestrator.clone(),
        1,
    );
    let teardown = queue
        .enqueue(TaskRequest { node_id: web.id, op: Operation::Teardown })
        .unwrap();
    let deploy = queue
        .enqueue(TaskRequest { node_id: auth.id, op: Operation::Deploy })
        .unwrap();
    queue.drain().await;

    assert_eq!(queue.status(teardown), Some(TaskStatus::Succeeded));
    match queue.status(deploy) {
        Some(TaskStatus::Failed { message }) => {
            assert!(message.contains("create-container"), "{message}");
        }
        status => panic!("unexpected status: {status:?}"),
    }
    assert_eq!(cptestctx.node(&auth).await.state, NodeState::Failed);
    assert!(cptestctx.datastore.get::<Node>(web.id).await.is_err());

    cptestctx.cleanup_successful();
}

#[tokio::test]
async fn test_cancelled_queue_starts_nothing() {
    let cptestctx =
        TestContext::new("test_cancelled_queue_starts_nothing").await;
    let web = cptestctx.add_node("web-1", NodeRole::WebFront).await;

    let queue = TaskQueue::start(
        &cptestctx.logctx.log,
        cptestctx.orchestrator.clone(),
        1,
    );
    queue.cancel();
    let task = queue
        .enqueue(TaskRequest { node_id: web.id, op: Operation::Deploy })
        .unwrap();
    queue.shutdown().await;

    let status = queue.status(task).unwrap();
    assert!(status.is_finished());
    assert!(matches!(status, TaskStatus::Failed { .. }), "{status:?}");
    assert_eq!(cptestctx.node(&web).await.state, NodeState::Pending);
    assert!(cptestctx.executor.invocations().is_empty());

    cptestctx.cleanup_successful();
}
