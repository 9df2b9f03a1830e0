// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background execution of node operations
//!
//! Requests are accepted immediately and run on a bounded number of tokio
//! tasks. Callers poll [`TaskQueue::status`] to learn the outcome.

use crate::orchestrator::Orchestrator;
use display_error_chain::DisplayErrorChain;
use gluu_common::typed_uuid::{NodeUuid, TaskUuid};
use slog::{debug, error, info, o, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Deploy,
    Teardown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskRequest {
    pub node_id: NodeUuid,
    pub op: Operation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed { message: String },
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error("task queue is shut down")]
    ShutDown,
}

type Statuses = Arc<Mutex<BTreeMap<TaskUuid, TaskStatus>>>;

fn set_status(statuses: &Statuses, id: TaskUuid, status: TaskStatus) {
    statuses.lock().unwrap().insert(id, status);
}

pub struct TaskQueue {
    log: Logger,
    tx: Mutex<Option<mpsc::UnboundedSender<(TaskUuid, TaskRequest)>>>,
    statuses: Statuses,
    cancel: CancellationToken,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Starts a queue running at most `workers` operations at once.
    pub fn start(
        log: &Logger,
        orchestrator: Arc<Orchestrator>,
        workers: usize,
    ) -> TaskQueue {
        let log = log.new(o!("component" => "TaskQueue"));
        let (tx, rx) = mpsc::unbounded_channel();
        let statuses = Statuses::default();
        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(
            log.clone(),
            orchestrator,
            rx,
            statuses.clone(),
            cancel.clone(),
            workers.max(1),
        ));
        TaskQueue {
            log,
            tx: Mutex::new(Some(tx)),
            statuses,
            cancel,
            dispatcher: tokio::sync::Mutex::new(Some(dispatcher)),
        }
    }

    pub fn enqueue(
        &self,
        request: TaskRequest,
    ) -> Result<TaskUuid, TaskQueueError> {
        let tx = self.tx.lock().unwrap();
        let tx = tx.as_ref().ok_or(TaskQueueError::ShutDown)?;
        let id = TaskUuid::new_v4();
        set_status(&self.statuses, id, TaskStatus::Queued);
        if tx.send((id, request)).is_err() {
            self.statuses.lock().unwrap().remove(&id);
            return Err(TaskQueueError::ShutDown);
        }
        debug!(
            self.log,
            "queued task";
            "task_id" => %id,
            "node_id" => %request.node_id,
            "op" => ?request.op,
        );
        Ok(id)
    }

    pub fn status(&self, id: TaskUuid) -> Option<TaskStatus> {
        self.statuses.lock().unwrap().get(&id).cloned()
    }

    /// Stops accepting requests and waits for every accepted one to finish.
    pub async fn drain(&self) {
        drop(self.tx.lock().unwrap().take());
        let Some(handle) = self.dispatcher.lock().await.take() else {
            return;
        };
        if let Err(err) = handle.await {
            error!(self.log, "task dispatcher failed"; "error" => %err);
        }
    }

    /// Makes running deploys stop before their next step and keeps queued
    /// requests from starting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancels outstanding work and waits for it to wind down.
    pub async fn shutdown(&self) {
        self.cancel();
        self.drain().await;
    }
}

async fn dispatch(
    log: Logger,
    orchestrator: Arc<Orchestrator>,
    mut rx: mpsc::UnboundedReceiver<(TaskUuid, TaskRequest)>,
    statuses: Statuses,
    cancel: CancellationToken,
    workers: usize,
) {
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    while let Some((id, request)) = rx.recv().await {
        while let Some(result) = tasks.try_join_next() {
            reap(&log, result);
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if cancel.is_cancelled() {
            set_status(
                &statuses,
                id,
                TaskStatus::Failed { message: "cancelled".to_string() },
            );
            continue;
        }

        let log = log.new(o!("task_id" => id.to_string()));
        let orchestrator = Arc::clone(&orchestrator);
        let statuses = statuses.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            set_status(&statuses, id, TaskStatus::Running);
            let result = match request.op {
                Operation::Deploy => {
                    orchestrator.deploy(request.node_id, &cancel).await
                }
                Operation::Teardown => {
                    orchestrator.teardown(request.node_id).await
                }
            };
            let status = match result {
                Ok(state) => {
                    info!(log, "task succeeded"; "state" => %state);
                    TaskStatus::Succeeded
                }
                Err(err) => {
                    let message = DisplayErrorChain::new(&err).to_string();
                    info!(log, "task failed"; "error" => &message);
                    TaskStatus::Failed { message }
                }
            };
            set_status(&statuses, id, status);
            drop(permit);
        });
    }

    while let Some(result) = tasks.join_next().await {
        reap(&log, result);
    }
}

fn reap(log: &Logger, result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        error!(log, "task panicked"; "error" => %err);
    }
}
