// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queries about which nodes make up a cluster

use gluu_common::api::{Node, NodeRole, NodeState};
use gluu_common::typed_uuid::{ClusterUuid, NodeUuid};
use gluu_datastore::DataStore;
use gluu_remote_exec::Target;

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("failed to list nodes of cluster {cluster_id}")]
    Store {
        cluster_id: ClusterUuid,
        #[source]
        err: gluu_datastore::Error,
    },

    #[error("no deployed host runs the containers of node {node}")]
    NoHost { node: String },

    #[error("node {node} has no container yet")]
    NoContainer { node: String },
}

/// Read-only view of cluster membership, backed by the state store.
#[derive(Clone)]
pub struct Topology {
    datastore: DataStore,
}

impl Topology {
    pub fn new(datastore: DataStore) -> Self {
        Topology { datastore }
    }

    async fn nodes_of_cluster<F>(
        &self,
        cluster_id: ClusterUuid,
        pred: F,
    ) -> Result<Vec<Node>, TopologyError>
    where
        F: Fn(&Node) -> bool,
    {
        let mut nodes = self
            .datastore
            .search(|n: &Node| n.cluster_id == cluster_id && pred(n))
            .await
            .map_err(|err| TopologyError::Store { cluster_id, err })?;
        nodes.sort_by(|a, b| {
            (a.time_created, a.id).cmp(&(b.time_created, b.id))
        });
        Ok(nodes)
    }

    /// Nodes of `role` in the cluster, oldest first, in any state.
    pub async fn peers_of_role(
        &self,
        cluster_id: ClusterUuid,
        role: NodeRole,
    ) -> Result<Vec<Node>, TopologyError> {
        self.nodes_of_cluster(cluster_id, |n| n.role == role).await
    }

    /// Fully deployed nodes of `role` in the cluster other than `exclude`,
    /// oldest first.
    pub async fn finished_peers(
        &self,
        cluster_id: ClusterUuid,
        role: NodeRole,
        exclude: Option<NodeUuid>,
    ) -> Result<Vec<Node>, TopologyError> {
        self.nodes_of_cluster(cluster_id, |n| {
            n.role == role
                && n.state == NodeState::SetupFinished
                && Some(n.id) != exclude
        })
        .await
    }

    /// The node a new member of `role` should copy its data from, if any.
    ///
    /// An error here means the answer is unknown, which is not the same as
    /// there being no peer.
    pub async fn first_peer_or_none(
        &self,
        cluster_id: ClusterUuid,
        role: NodeRole,
        exclude: NodeUuid,
    ) -> Result<Option<Node>, TopologyError> {
        Ok(self
            .finished_peers(cluster_id, role, Some(exclude))
            .await?
            .into_iter()
            .next())
    }

    /// The deployed host that runs the containers of `node`'s provider.
    ///
    /// Masters are preferred over workers.
    pub async fn host_for(
        &self,
        node: &Node,
    ) -> Result<Option<Node>, TopologyError> {
        let provider_id = node.provider_id;
        let mut hosts = self
            .nodes_of_cluster(node.cluster_id, |n| {
                n.provider_id == provider_id
                    && matches!(n.role, NodeRole::Master | NodeRole::Worker)
                    && n.state == NodeState::SetupFinished
            })
            .await?;
        // Stable, so creation order holds within each role.
        hosts.sort_by_key(|n| n.role != NodeRole::Master);
        Ok(hosts.into_iter().next())
    }

    /// Where commands for `node` run: the host itself for host roles, the
    /// node's container on its host otherwise.
    pub async fn target_for(
        &self,
        node: &Node,
    ) -> Result<Target, TopologyError> {
        if !node.role.is_container() {
            return Ok(Target::machine(node.name.clone()));
        }
        let container = node
            .container_id
            .clone()
            .ok_or_else(|| TopologyError::NoContainer {
                node: node.name.clone(),
            })?;
        let host = self.machine_for(node).await?;
        Ok(Target::container(host, container))
    }

    /// Name of the machine that runs (or will run) `node`'s container.
    pub async fn machine_for(
        &self,
        node: &Node,
    ) -> Result<String, TopologyError> {
        self.host_for(node)
            .await?
            .map(|host| host.name)
            .ok_or_else(|| TopologyError::NoHost { node: node.name.clone() })
    }

    pub fn recovery_priority(role: NodeRole) -> u32 {
        role.recovery_priority()
    }

    /// The cluster's containers in the order they should be brought back
    /// after an outage.
    pub async fn recovery_order(
        &self,
        cluster_id: ClusterUuid,
    ) -> Result<Vec<Node>, TopologyError> {
        let mut nodes =
            self.nodes_of_cluster(cluster_id, |n| n.role.is_container()).await?;
        nodes.sort_by_key(|n| Self::recovery_priority(n.role));
        Ok(nodes)
    }
}
