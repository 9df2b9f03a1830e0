// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Node records

use crate::steps::{NextStep, Step, StepFlags};
use crate::typed_uuid::{ClusterUuid, NodeUuid, ProviderUuid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// The kind of service a node provides.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Directory (LDAP) server replica.
    Directory,
    /// OpenID Connect / OAuth2 authorization server.
    AuthServer,
    /// Trust management web application.
    TrustServer,
    /// SAML federation identity provider.
    FederationProxy,
    /// Reverse proxy terminating TLS for the cluster hostname.
    WebFront,
    /// Host running the key/value service used for host discovery.
    Discovery,
    /// Overlay network seed host.
    Master,
    /// Additional container host.
    Worker,
}

impl NodeRole {
    /// Container roles run inside a container on a host; the rest are hosts.
    pub fn is_container(&self) -> bool {
        !matches!(
            self,
            NodeRole::Discovery | NodeRole::Master | NodeRole::Worker
        )
    }

    /// Static restart ordering used after an outage; lower runs first.
    ///
    /// Hosts carry everything else and come before any container. Among
    /// containers the directory is first because every other service binds to
    /// it, and the web front end is last because it proxies to the rest.
    pub fn recovery_priority(&self) -> u32 {
        match self {
            NodeRole::Discovery | NodeRole::Master | NodeRole::Worker => 0,
            NodeRole::Directory => 1,
            NodeRole::AuthServer => 2,
            NodeRole::TrustServer => 3,
            NodeRole::FederationProxy => 4,
            NodeRole::WebFront => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeRole::Directory => "directory",
            NodeRole::AuthServer => "auth-server",
            NodeRole::TrustServer => "trust-server",
            NodeRole::FederationProxy => "federation-proxy",
            NodeRole::WebFront => "web-front",
            NodeRole::Discovery => "discovery",
            NodeRole::Master => "master",
            NodeRole::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle of a node record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    SetupInProgress,
    SetupFinished,
    TeardownInProgress,
    TeardownFinished,
    Failed,
}

impl NodeState {
    /// Whether some run currently owns the node.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            NodeState::SetupInProgress | NodeState::TeardownInProgress
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::SetupInProgress => "setup_in_progress",
            NodeState::SetupFinished => "setup_finished",
            NodeState::TeardownInProgress => "teardown_in_progress",
            NodeState::TeardownFinished => "teardown_finished",
            NodeState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// An address on the cluster's overlay network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayAddress {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl fmt::Display for OverlayAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Parameters for creating a new node record.
#[derive(Clone, Debug)]
pub struct NodeCreate {
    pub name: String,
    pub cluster_id: ClusterUuid,
    pub provider_id: ProviderUuid,
    pub role: NodeRole,
}

/// One deployment unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeUuid,
    pub name: String,
    pub cluster_id: ClusterUuid,
    pub provider_id: ProviderUuid,
    pub role: NodeRole,
    /// Host network address, once known.
    pub address: Option<IpAddr>,
    /// Overlay network address (container roles), once attached.
    pub overlay: Option<OverlayAddress>,
    /// Container engine id (container roles), once created.
    pub container_id: Option<String>,
    pub steps: StepFlags,
    pub state: NodeState,
    pub recovery_priority: u32,
    /// Set while this node takes part in a replication setup.
    #[serde(default)]
    pub replicating: bool,
    pub time_created: DateTime<Utc>,
    pub time_modified: DateTime<Utc>,
}

impl Node {
    pub fn new(params: NodeCreate) -> Self {
        let now = Utc::now();
        Node {
            id: NodeUuid::new_v4(),
            name: params.name,
            cluster_id: params.cluster_id,
            provider_id: params.provider_id,
            role: params.role,
            address: None,
            overlay: None,
            container_id: None,
            steps: StepFlags::for_role(params.role),
            state: NodeState::Pending,
            recovery_priority: params.role.recovery_priority(),
            replicating: false,
            time_created: now,
            time_modified: now,
        }
    }

    pub fn next_step(&self) -> NextStep {
        self.steps.next_step(self.role)
    }

    pub fn is_complete(&self) -> bool {
        self.steps.is_complete(self.role)
    }

    pub fn last_completed_step(&self) -> Option<Step> {
        self.steps.last_completed(self.role)
    }

    /// The name other members of the cluster use to reach this node.
    ///
    /// Containers are addressed by overlay address, hosts by host address.
    /// Before either is known the node name is the best we have.
    pub fn domain_name(&self) -> String {
        if let Some(overlay) = self.overlay {
            return overlay.addr.to_string();
        }
        if let Some(address) = self.address {
            return address.to_string();
        }
        self.name.clone()
    }

    pub fn touch(&mut self) {
        self.time_modified = Utc::now();
    }
}
