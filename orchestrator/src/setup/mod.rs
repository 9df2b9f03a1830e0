// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Role-specific provisioning
//!
//! Each node role has a [`RoleSetup`] that knows how to run that role's
//! steps. The mapping from role to handler is fixed at compile time by
//! [`setup_for_role`]. Handlers never decide which step runs next; the
//! orchestrator does that from the node's step flags.

use crate::config::OrchestratorConfig;
use crate::ip_pool::{OverlayPool, OverlayPoolError};
use crate::replication::{ReplicationCoordinator, ReplicationError};
use crate::template::{TemplateError, TemplateRenderer};
use crate::topology::{Topology, TopologyError};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use gluu_common::api::{Cluster, Node, NodeRole, Provider};
use gluu_common::steps::Step;
use gluu_common::typed_uuid::ClusterUuid;
use gluu_datastore::DataStore;
use gluu_remote_exec::{BoxedExecutor, ExecutionError, Target};
use serde_json::json;
use slog::{debug, Logger};

mod capability;
mod container;
mod directory;
mod host;
mod oxapp;
mod web;

pub use capability::{CertIssuer, HostFileEditor};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Exec(#[from] ExecutionError),

    #[error("state store operation failed")]
    Store(#[from] gluu_datastore::Error),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    OverlayPool(#[from] OverlayPoolError),

    #[error("no deployed {role} node in cluster {cluster_id}")]
    MissingPeer { role: NodeRole, cluster_id: ClusterUuid },

    #[error("{role} nodes do not run step {step}")]
    Unsupported { step: Step, role: NodeRole },

    #[error("unexpected output from [{command}]: {output:?}")]
    UnexpectedOutput { command: String, output: String },

    #[error("{what} is not running")]
    NotReady { what: String },

    #[error("{node} did not become reachable after {attempts} attempts")]
    AgentUnreachable {
        node: String,
        attempts: u32,
        #[source]
        err: Box<StepError>,
    },

    #[error("failed to read {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// Everything a step needs besides the node it runs on.
pub struct StepContext<'a> {
    /// Logger of the orchestration run, writing to the node's log file.
    pub log: &'a Logger,
    pub executor: &'a BoxedExecutor,
    pub datastore: &'a DataStore,
    pub topology: &'a Topology,
    pub templates: &'a dyn TemplateRenderer,
    pub replication: &'a ReplicationCoordinator,
    pub overlay: &'a OverlayPool,
    pub config: &'a OrchestratorConfig,
    pub cluster: &'a Cluster,
    pub provider: &'a Provider,
}

impl StepContext<'_> {
    pub async fn target(&self, node: &Node) -> Result<Target, StepError> {
        Ok(self.topology.target_for(node).await?)
    }

    pub async fn exec(
        &self,
        target: &Target,
        command: &str,
    ) -> Result<String, StepError> {
        Ok(self.executor.exec(target, command).await?)
    }

    /// Renders `template` and writes the result to `dest` on `target`.
    pub async fn render_to(
        &self,
        target: &Target,
        template: &str,
        dest: &Utf8Path,
        context: &serde_json::Value,
    ) -> Result<(), StepError> {
        let contents = self.templates.render(template, context)?;
        debug!(
            self.log,
            "writing rendered template";
            "template" => template,
            "dest" => %dest,
        );
        self.executor.write_file(target, dest, contents.as_bytes()).await?;
        Ok(())
    }

    /// Deployed nodes of `role` in this node's cluster, oldest first.
    pub async fn finished_peers(
        &self,
        role: NodeRole,
    ) -> Result<Vec<Node>, StepError> {
        Ok(self.topology.finished_peers(self.cluster.id, role, None).await?)
    }

    /// Values most cluster-wide templates refer to.
    pub fn cluster_context(&self) -> serde_json::Value {
        let cluster = self.cluster;
        let secrets = &cluster.secrets;
        json!({
            "hostname": cluster.hostname,
            "org_name": cluster.org_name,
            "admin_email": cluster.admin_email,
            "admin_password": secrets.admin_password,
            "client_id": secrets.client_id,
            "client_secret": secrets.client_secret,
            "inum_org": secrets.inum_org,
            "inum_org_fn": inum_fn(&secrets.inum_org),
            "inum_appliance": secrets.inum_appliance,
            "scim_rs_client_id": secrets.scim_rs_client_id,
            "scim_rp_client_id": secrets.scim_rp_client_id,
        })
    }
}

/// An inum with its punctuation removed, usable inside OIDs and names.
fn inum_fn(inum: &str) -> String {
    inum.chars().filter(|c| !matches!(c, '@' | '!' | '.')).collect()
}

/// Provisioning logic for one node role.
#[async_trait]
pub trait RoleSetup: Send + Sync {
    /// Runs one step against `node`, recording on `node` whatever the step
    /// learns about it (address, container id). The caller persists it.
    async fn run_step(
        &self,
        ctx: &StepContext<'_>,
        node: &mut Node,
        step: Step,
    ) -> Result<(), StepError>;

    /// One attempt at checking that the node answers commands.
    async fn probe_agent(
        &self,
        ctx: &StepContext<'_>,
        node: &Node,
    ) -> Result<(), StepError> {
        container::probe_supervisor(ctx, node).await
    }

    /// Runs after every deploy attempt, successful or not.
    async fn cleanup(
        &self,
        _ctx: &StepContext<'_>,
        _node: &Node,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Detaches the node from the rest of the cluster before removal.
    async fn teardown(
        &self,
        _ctx: &StepContext<'_>,
        _node: &Node,
    ) -> Result<(), StepError> {
        Ok(())
    }

    /// Frees the node's remote resources. Failures are logged, not returned.
    async fn release(&self, ctx: &StepContext<'_>, node: &Node) {
        container::release(ctx, node).await
    }

    /// Tells dependent nodes that this one appeared or went away.
    ///
    /// Best effort: failures are logged and never affect this node.
    async fn notify(&self, _ctx: &StepContext<'_>, _node: &Node) {}
}

pub fn setup_for_role(role: NodeRole) -> &'static dyn RoleSetup {
    match role {
        NodeRole::Discovery | NodeRole::Master | NodeRole::Worker => {
            &host::HostSetup
        }
        NodeRole::Directory => &directory::DirectorySetup,
        NodeRole::AuthServer => &oxapp::AUTH_SERVER,
        NodeRole::TrustServer => &oxapp::TRUST_SERVER,
        NodeRole::FederationProxy => &oxapp::FEDERATION_PROXY,
        NodeRole::WebFront => &web::WEB_FRONT,
    }
}
