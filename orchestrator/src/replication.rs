// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-master replication between directory replicas
//!
//! A new directory node joins the cluster by enabling replication with an
//! existing replica and then initializing its data from it, once per base DN
//! and always in the cluster's base DN order. The directory server needs time
//! to settle after each of those commands, so the coordinator waits between
//! them.
//!
//! A node takes part in at most one replication setup at a time. The
//! `replicating` flag on its record is the lock: it is set with a conditional
//! store update, so coordinators in other processes sharing the store see it
//! too. A flag left behind by a crashed process is only cleared by an
//! explicit recovery of the node.

use crate::config::ReplicationConfig;
use crate::opendj;
use crate::topology::{Topology, TopologyError};
use gluu_common::api::{Cluster, Node, NodeState};
use gluu_common::typed_uuid::NodeUuid;
use gluu_datastore::DataStore;
use gluu_remote_exec::{shell_quote, BoxedExecutor, ExecutionError, Target};
use slog::{info, o, warn, Logger};

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("node {node_id} is busy with another operation")]
    Busy { node_id: NodeUuid },

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error("failed to write the bind password file on {node}")]
    PasswordFile {
        node: String,
        #[source]
        err: ExecutionError,
    },

    #[error(
        "failed to enable replication of {base_dn} between {existing} and \
         {joining}"
    )]
    Enable {
        base_dn: String,
        existing: String,
        joining: String,
        #[source]
        err: ExecutionError,
    },

    #[error("failed to initialize {base_dn} on {joining} from {existing}")]
    Initialize {
        base_dn: String,
        existing: String,
        joining: String,
        #[source]
        err: ExecutionError,
    },

    #[error("failed to disable replication on {node}")]
    Disable {
        node: String,
        #[source]
        err: ExecutionError,
    },

    #[error("failed to record replication state of node {node_id}")]
    Store {
        node_id: NodeUuid,
        #[source]
        err: gluu_datastore::Error,
    },
}

/// Callers pass the logger of the orchestration run they belong to.
pub struct ReplicationCoordinator {
    executor: BoxedExecutor,
    datastore: DataStore,
    topology: Topology,
    config: ReplicationConfig,
}

impl ReplicationCoordinator {
    pub fn new(
        executor: BoxedExecutor,
        datastore: DataStore,
        config: ReplicationConfig,
    ) -> Self {
        ReplicationCoordinator {
            executor,
            topology: Topology::new(datastore.clone()),
            datastore,
            config,
        }
    }

    /// Sets the node's `replicating` flag in the store.
    ///
    /// Fails with `Busy` if the flag is already set or the record changes
    /// under us. With `require_deployed`, also fails unless the node is fully
    /// deployed: any other node belongs to a run that is not ours.
    async fn mark_replicating(
        &self,
        node_id: NodeUuid,
        require_deployed: bool,
    ) -> Result<(), ReplicationError> {
        let current: Node = self
            .datastore
            .get(node_id)
            .await
            .map_err(|err| ReplicationError::Store { node_id, err })?;
        if current.replicating
            || (require_deployed && current.state != NodeState::SetupFinished)
        {
            return Err(ReplicationError::Busy { node_id });
        }
        let mut node = current.clone();
        node.replicating = true;
        node.touch();
        let swapped = self
            .datastore
            .update_if_unchanged(&current, &node)
            .await
            .map_err(|err| ReplicationError::Store { node_id, err })?;
        if !swapped {
            return Err(ReplicationError::Busy { node_id });
        }
        Ok(())
    }

    /// Clears a flag set by [`Self::mark_replicating`].
    async fn unmark_replicating(&self, log: &Logger, node_id: NodeUuid) {
        let result = async {
            let current: Node = self.datastore.get(node_id).await?;
            let mut node = current.clone();
            node.replicating = false;
            node.touch();
            self.datastore.update_if_unchanged(&current, &node).await
        }
        .await;
        match result {
            Ok(true) => (),
            Ok(false) => warn!(
                log,
                "node changed while replicating, flag left set";
                "node_id" => %node_id,
            ),
            Err(err) => warn!(
                log,
                "failed to clear replicating flag";
                "node_id" => %node_id,
                "error" => %err,
            ),
        }
    }

    async fn write_password(
        &self,
        cluster: &Cluster,
        node: &Node,
        target: &Target,
    ) -> Result<(), ReplicationError> {
        self.executor
            .write_file(
                target,
                opendj::password_file(),
                cluster.secrets.admin_password.as_bytes(),
            )
            .await
            .map_err(|err| ReplicationError::PasswordFile {
                node: node.name.clone(),
                err,
            })
    }

    async fn remove_password(
        &self,
        log: &Logger,
        node: &Node,
        target: &Target,
    ) {
        if let Err(err) =
            self.executor.remove_file(target, opendj::password_file()).await
        {
            warn!(
                log,
                "failed to remove bind password file";
                "node" => &node.name,
                "error" => %err,
            );
        }
    }

    /// Joins `joining` to the replication topology of `existing` and copies
    /// `existing`'s data onto it.
    ///
    /// Fails with `Busy`, running nothing, if either node is already
    /// replicating or `existing` is not fully deployed. Otherwise the bind
    /// password file is removed from both nodes and both `replicating` flags
    /// are cleared before this returns, whether or not replication succeeded.
    pub async fn replicate_from(
        &self,
        log: &Logger,
        cluster: &Cluster,
        joining: &Node,
        existing: &Node,
    ) -> Result<(), ReplicationError> {
        let log = log.new(o!(
            "component" => "ReplicationCoordinator",
            "existing" => existing.name.clone(),
        ));
        let joining_target = self.topology.target_for(joining).await?;
        let existing_target = self.topology.target_for(existing).await?;

        self.mark_replicating(joining.id, false).await?;
        if let Err(err) = self.mark_replicating(existing.id, true).await {
            self.unmark_replicating(&log, joining.id).await;
            return Err(err);
        }
        let result = self
            .replicate_locked(
                &log,
                cluster,
                joining,
                &joining_target,
                existing,
                &existing_target,
            )
            .await;

        self.remove_password(&log, joining, &joining_target).await;
        self.remove_password(&log, existing, &existing_target).await;
        self.unmark_replicating(&log, joining.id).await;
        self.unmark_replicating(&log, existing.id).await;
        result
    }

    async fn replicate_locked(
        &self,
        log: &Logger,
        cluster: &Cluster,
        joining: &Node,
        joining_target: &Target,
        existing: &Node,
        existing_target: &Target,
    ) -> Result<(), ReplicationError> {
        self.write_password(cluster, joining, joining_target).await?;
        self.write_password(cluster, existing, existing_target).await?;

        let existing_host = existing.domain_name();
        let joining_host = joining.domain_name();
        for base_dn in &cluster.base_dns {
            info!(
                log,
                "enabling replication";
                "base_dn" => base_dn,
                "existing" => &existing_host,
                "joining" => &joining_host,
            );
            self.executor
                .exec(
                    joining_target,
                    &enable_command(base_dn, &existing_host, &joining_host),
                )
                .await
                .map_err(|err| ReplicationError::Enable {
                    base_dn: base_dn.clone(),
                    existing: existing.name.clone(),
                    joining: joining.name.clone(),
                    err,
                })?;
            tokio::time::sleep(self.config.enable_settle()).await;

            info!(log, "initializing replicated data"; "base_dn" => base_dn);
            self.executor
                .exec(
                    joining_target,
                    &initialize_command(base_dn, &existing_host, &joining_host),
                )
                .await
                .map_err(|err| ReplicationError::Initialize {
                    base_dn: base_dn.clone(),
                    existing: existing.name.clone(),
                    joining: joining.name.clone(),
                    err,
                })?;
            tokio::time::sleep(self.config.initialize_settle()).await;
        }
        Ok(())
    }

    /// Removes `node` from every replication agreement it is part of.
    pub async fn disable_replication(
        &self,
        log: &Logger,
        cluster: &Cluster,
        node: &Node,
    ) -> Result<(), ReplicationError> {
        let log = log.new(o!("component" => "ReplicationCoordinator"));
        let target = self.topology.target_for(node).await?;
        self.mark_replicating(node.id, false).await?;

        let result = async {
            self.write_password(cluster, node, &target).await?;
            info!(log, "disabling replication"; "host" => node.domain_name());
            self.executor
                .exec(&target, &disable_command(&node.domain_name()))
                .await
                .map_err(|err| ReplicationError::Disable {
                    node: node.name.clone(),
                    err,
                })?;
            // The server finishes unwinding its agreements in the background.
            tokio::time::sleep(self.config.disable_settle()).await;
            Ok::<(), ReplicationError>(())
        }
        .await;

        self.remove_password(&log, node, &target).await;
        self.unmark_replicating(&log, node.id).await;
        result
    }
}

fn enable_command(base_dn: &str, existing: &str, joining: &str) -> String {
    let pw = opendj::password_file();
    [
        opendj::DSREPLICATION.to_string(),
        "enable".to_string(),
        format!("--host1 {existing}"),
        format!("--port1 {}", opendj::ADMIN_PORT),
        format!("--bindDN1 {}", shell_quote(opendj::BIND_DN)),
        format!("--bindPasswordFile1 {pw}"),
        format!("--replicationPort1 {}", opendj::REPLICATION_PORT),
        format!("--host2 {joining}"),
        format!("--port2 {}", opendj::ADMIN_PORT),
        format!("--bindDN2 {}", shell_quote(opendj::BIND_DN)),
        format!("--bindPasswordFile2 {pw}"),
        format!("--replicationPort2 {}", opendj::REPLICATION_PORT),
        format!("--adminUID {}", opendj::ADMIN_UID),
        format!("--adminPasswordFile {pw}"),
        format!("--baseDN {}", shell_quote(base_dn)),
        "--secureReplication1 --secureReplication2 -X -n -Q".to_string(),
    ]
    .join(" ")
}

fn initialize_command(base_dn: &str, existing: &str, joining: &str) -> String {
    let pw = opendj::password_file();
    [
        opendj::DSREPLICATION.to_string(),
        "initialize".to_string(),
        format!("--baseDN {}", shell_quote(base_dn)),
        format!("--adminUID {}", opendj::ADMIN_UID),
        format!("--adminPasswordFile {pw}"),
        format!("--hostSource {existing}"),
        format!("--portSource {}", opendj::ADMIN_PORT),
        format!("--hostDestination {joining}"),
        format!("--portDestination {}", opendj::ADMIN_PORT),
        "-X -n -Q".to_string(),
    ]
    .join(" ")
}

fn disable_command(host: &str) -> String {
    format!(
        "{} disable --hostname {host} --port {} --adminUID {} \
         --adminPasswordFile {} -X -n --disableAll",
        opendj::DSREPLICATION,
        opendj::ADMIN_PORT,
        opendj::ADMIN_UID,
        opendj::password_file(),
    )
}
