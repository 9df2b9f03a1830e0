// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives nodes through their provisioning steps and tears them down

use crate::config::OrchestratorConfig;
use crate::ip_pool::OverlayPool;
use crate::node_log::{NodeLog, NodeLogError};
use crate::replication::ReplicationCoordinator;
use crate::setup::{setup_for_role, RoleSetup, StepContext, StepError};
use crate::template::TemplateRenderer;
use crate::topology::Topology;
use display_error_chain::DisplayErrorChain;
use gluu_common::api::{Cluster, Node, NodeState, Provider};
use gluu_common::backoff::{retry_notify, BackoffError};
use gluu_common::steps::{NextStep, Step};
use gluu_common::typed_uuid::NodeUuid;
use gluu_datastore::DataStore;
use gluu_remote_exec::BoxedExecutor;
use chrono::Utc;
use slog::{error, info, o, warn, Logger};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("node {node_id} already has an operation in progress")]
    Busy { node_id: NodeUuid },

    #[error("state store operation failed")]
    Store(#[from] gluu_datastore::Error),

    #[error(transparent)]
    NodeLog(#[from] NodeLogError),

    #[error("step {step} failed")]
    Step {
        step: Step,
        #[source]
        err: StepError,
    },

    #[error("cancelled before step {step}")]
    Cancelled { step: Step },

    #[error("failed to detach node from the cluster")]
    Teardown(#[source] StepError),

    #[error(
        "node {node_id} was last updated {age:?} ago; \
         claims younger than {stale_after:?} are left alone"
    )]
    ClaimNotStale { node_id: NodeUuid, age: Duration, stale_after: Duration },
}

/// Owns the shared services every node operation needs.
pub struct Orchestrator {
    log: Logger,
    config: OrchestratorConfig,
    executor: BoxedExecutor,
    datastore: DataStore,
    topology: Topology,
    templates: Arc<dyn TemplateRenderer>,
    replication: ReplicationCoordinator,
    overlay: OverlayPool,
}

impl Orchestrator {
    pub fn new(
        log: &Logger,
        config: OrchestratorConfig,
        executor: BoxedExecutor,
        datastore: DataStore,
        templates: Arc<dyn TemplateRenderer>,
    ) -> Arc<Self> {
        let log = log.new(o!("component" => "Orchestrator"));
        let replication = ReplicationCoordinator::new(
            executor.clone(),
            datastore.clone(),
            config.replication,
        );
        Arc::new(Orchestrator {
            overlay: OverlayPool::new(&log, datastore.clone()),
            topology: Topology::new(datastore.clone()),
            log,
            config,
            executor,
            datastore,
            templates,
            replication,
        })
    }

    pub fn datastore(&self) -> &DataStore {
        &self.datastore
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Moves `node` into the in-progress `state`, failing with `Busy` if
    /// anyone else holds the node or changed it since it was read.
    ///
    /// The claim lives in the stored record, so it is honored by every
    /// orchestrator sharing the store. It is released by moving the node
    /// out of the in-progress state. A run that dies first leaves the claim
    /// behind until [`Orchestrator::recover`] clears it.
    async fn claim(
        &self,
        node: &mut Node,
        state: NodeState,
    ) -> Result<(), SetupError> {
        debug_assert!(state.is_in_progress());
        let node_id = node.id;
        if node.state.is_in_progress() || node.replicating {
            return Err(SetupError::Busy { node_id });
        }
        let mut claimed = node.clone();
        claimed.state = state;
        claimed.touch();
        if !self.datastore.update_if_unchanged(&*node, &claimed).await? {
            return Err(SetupError::Busy { node_id });
        }
        *node = claimed;
        Ok(())
    }

    async fn persist_state(
        &self,
        node: &mut Node,
        state: NodeState,
    ) -> Result<(), SetupError> {
        node.state = state;
        node.touch();
        self.datastore.update(&*node).await?;
        Ok(())
    }

    /// Runs the node's remaining steps until it is fully provisioned.
    ///
    /// Steps already recorded as done are skipped, so deploying a node that
    /// failed earlier resumes where it stopped. A node whose steps are all
    /// done is only marked finished; nothing runs against it.
    pub async fn deploy(
        &self,
        node_id: NodeUuid,
        cancel: &CancellationToken,
    ) -> Result<NodeState, SetupError> {
        let mut node: Node = self.datastore.get(node_id).await?;
        if node.is_complete() {
            return self.settle_complete(node).await;
        }
        let cluster: Cluster = self.datastore.get(node.cluster_id).await?;
        let provider: Provider = self.datastore.get(node.provider_id).await?;
        let node_log =
            NodeLog::open(&self.log, &self.config.node_log_dir, &node)?;
        let log = node_log.log();
        let setup = setup_for_role(node.role);
        let ctx = StepContext {
            log,
            executor: &self.executor,
            datastore: &self.datastore,
            topology: &self.topology,
            templates: self.templates.as_ref(),
            replication: &self.replication,
            overlay: &self.overlay,
            config: &self.config,
            cluster: &cluster,
            provider: &provider,
        };

        self.claim(&mut node, NodeState::SetupInProgress).await?;
        info!(
            log,
            "deploying node";
            "pending" => ?node.steps.pending(node.role),
        );

        let mut result = self.run_steps(&ctx, setup, &mut node, cancel).await;
        if let Err(err) = setup.cleanup(&ctx, &node).await {
            warn!(
                log,
                "cleanup after deploy failed";
                "error" => %DisplayErrorChain::new(&err),
            );
        }
        if result.is_ok() {
            result =
                self.persist_state(&mut node, NodeState::SetupFinished).await;
        }

        match result {
            Ok(()) => {
                info!(log, "node deployed");
                setup.notify(&ctx, &node).await;
                Ok(NodeState::SetupFinished)
            }
            Err(err) => {
                error!(
                    log,
                    "deploy failed";
                    "error" => %DisplayErrorChain::new(&err),
                );
                self.record_failure(log, &mut node).await;
                Err(err)
            }
        }
    }

    /// Marks a node with every step done as finished without touching it.
    async fn settle_complete(
        &self,
        node: Node,
    ) -> Result<NodeState, SetupError> {
        if node.state == NodeState::SetupFinished {
            info!(self.log, "node already deployed"; "node" => &node.name);
            return Ok(NodeState::SetupFinished);
        }
        if node.state.is_in_progress() || node.replicating {
            return Err(SetupError::Busy { node_id: node.id });
        }
        let mut finished = node.clone();
        finished.state = NodeState::SetupFinished;
        finished.touch();
        if !self.datastore.update_if_unchanged(&node, &finished).await? {
            return Err(SetupError::Busy { node_id: node.id });
        }
        info!(
            self.log,
            "all steps already done, marking node deployed";
            "node" => &node.name,
            "was" => %node.state,
        );
        Ok(NodeState::SetupFinished)
    }

    /// Moves a claimed node to `Failed`, logging if even that cannot be
    /// stored.
    async fn record_failure(&self, log: &Logger, node: &mut Node) {
        if let Err(err) = self.persist_state(node, NodeState::Failed).await {
            warn!(
                log,
                "failed to record failure, node stays claimed";
                "state" => %node.state,
                "error" => %DisplayErrorChain::new(&err),
            );
        }
    }

    async fn run_steps(
        &self,
        ctx: &StepContext<'_>,
        setup: &dyn RoleSetup,
        node: &mut Node,
        cancel: &CancellationToken,
    ) -> Result<(), SetupError> {
        let log = ctx.log;
        loop {
            let step = match node.next_step() {
                NextStep::Complete => return Ok(()),
                NextStep::Run(step) => step,
            };
            if cancel.is_cancelled() {
                return Err(SetupError::Cancelled { step });
            }

            info!(log, "running step"; "step" => %step);
            let result = if step.is_agent_wait() {
                self.wait_for_agent(ctx, setup, node).await
            } else {
                setup.run_step(ctx, node, step).await
            };
            match result {
                Ok(()) => info!(log, "step completed"; "step" => %step),
                Err(err) if !step.is_critical() => {
                    warn!(
                        log,
                        "optional step failed, continuing without it";
                        "step" => %step,
                        "error" => %DisplayErrorChain::new(&err),
                    );
                }
                Err(err) => return Err(SetupError::Step { step, err }),
            }

            node.steps.mark_done(step);
            node.touch();
            self.datastore.update(&*node).await?;

            let delay = self.config.step_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {}
                }
            }
        }
    }

    /// Probes the node until its agent answers, under the bounded agent-wait
    /// policy.
    async fn wait_for_agent(
        &self,
        ctx: &StepContext<'_>,
        setup: &dyn RoleSetup,
        node: &Node,
    ) -> Result<(), StepError> {
        let log = ctx.log;
        let attempts = AtomicU32::new(0);
        let attempts_ref = &attempts;
        retry_notify(
            self.config.agent_wait.policy(),
            move || async move {
                attempts_ref.fetch_add(1, Ordering::SeqCst);
                setup
                    .probe_agent(ctx, node)
                    .await
                    .map_err(BackoffError::transient)
            },
            |err: StepError, delay: Duration| {
                info!(
                    log,
                    "agent not reachable yet";
                    "error" => %err,
                    "retry_in" => ?delay,
                );
            },
        )
        .await
        .map_err(|err| StepError::AgentUnreachable {
            node: node.name.clone(),
            attempts: attempts.load(Ordering::SeqCst),
            err: Box::new(err),
        })
    }

    /// Detaches the node from the cluster, frees its resources, and removes
    /// its record.
    pub async fn teardown(
        &self,
        node_id: NodeUuid,
    ) -> Result<NodeState, SetupError> {
        let mut node: Node = self.datastore.get(node_id).await?;
        let cluster: Cluster = self.datastore.get(node.cluster_id).await?;
        let provider: Provider = self.datastore.get(node.provider_id).await?;
        let node_log =
            NodeLog::open(&self.log, &self.config.node_log_dir, &node)?;
        let log = node_log.log();
        let setup = setup_for_role(node.role);
        let ctx = StepContext {
            log,
            executor: &self.executor,
            datastore: &self.datastore,
            topology: &self.topology,
            templates: self.templates.as_ref(),
            replication: &self.replication,
            overlay: &self.overlay,
            config: &self.config,
            cluster: &cluster,
            provider: &provider,
        };

        let was_deployed = node.state == NodeState::SetupFinished;
        info!(log, "tearing down node"; "state" => %node.state);
        self.claim(&mut node, NodeState::TeardownInProgress).await?;

        if let Err(err) = setup.teardown(&ctx, &node).await {
            error!(
                log,
                "teardown failed";
                "error" => %DisplayErrorChain::new(&err),
            );
            self.record_failure(log, &mut node).await;
            return Err(SetupError::Teardown(err));
        }
        setup.release(&ctx, &node).await;
        if let Err(err) = self.datastore.delete::<Node>(node.id).await {
            error!(
                log,
                "failed to remove node record";
                "error" => %DisplayErrorChain::new(&err),
            );
            self.record_failure(log, &mut node).await;
            return Err(err.into());
        }
        info!(log, "node removed");

        if was_deployed {
            setup.notify(&ctx, &node).await;
        }
        Ok(NodeState::TeardownFinished)
    }

    /// Clears a claim left behind by a run that never finished.
    ///
    /// A node stuck in `SetupInProgress` or `TeardownInProgress` moves to
    /// `Failed`, and a leftover replication flag is cleared. Unless `force`
    /// is set, the node must not have been updated for the configured stale
    /// claim age, since a live run updates its node after every step.
    /// Returns the node's state afterwards.
    pub async fn recover(
        &self,
        node_id: NodeUuid,
        force: bool,
    ) -> Result<NodeState, SetupError> {
        let node: Node = self.datastore.get(node_id).await?;
        if !node.state.is_in_progress() && !node.replicating {
            info!(self.log, "node is not claimed"; "node" => &node.name);
            return Ok(node.state);
        }

        let stale_after = self.config.stale_claim();
        let age = (Utc::now() - node.time_modified)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if !force && age < stale_after {
            return Err(SetupError::ClaimNotStale { node_id, age, stale_after });
        }

        let mut recovered = node.clone();
        if recovered.state.is_in_progress() {
            recovered.state = NodeState::Failed;
        }
        recovered.replicating = false;
        recovered.touch();
        if !self.datastore.update_if_unchanged(&node, &recovered).await? {
            return Err(SetupError::Busy { node_id });
        }
        warn!(
            self.log,
            "recovered abandoned claim";
            "node" => &node.name,
            "was" => %node.state,
            "was_replicating" => node.replicating,
            "age" => ?age,
            "forced" => force,
        );
        Ok(recovered.state)
    }
}
