// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records shared by the store, the orchestrator and its callers

pub mod cluster;
pub mod node;
pub mod provider;

pub use cluster::{Cluster, ClusterCreate, ClusterSecrets, IpPoolError};
pub use node::{Node, NodeCreate, NodeRole, NodeState, OverlayAddress};
pub use provider::{Provider, ProviderCreate};
