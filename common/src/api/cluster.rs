// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster records, shared secrets, and overlay address allocation

use crate::api::node::OverlayAddress;
use crate::typed_uuid::ClusterUuid;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IpPoolError {
    #[error("overlay network {network} has no free addresses")]
    Exhausted { network: Ipv4Net },

    #[error("address {addr} is not part of overlay network {network}")]
    OutsideNetwork { addr: Ipv4Addr, network: Ipv4Net },
}

/// Cryptographic material shared by every node of a cluster.
///
/// Generated exactly once, when the cluster is created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSecrets {
    pub admin_password: String,
    pub client_id: String,
    pub client_secret: String,
    pub inum_org: String,
    pub inum_appliance: String,
    pub scim_rs_client_id: String,
    pub scim_rp_client_id: String,
}

impl ClusterSecrets {
    pub fn generate() -> Self {
        let org_quad = format!("{}.{}", quad(), quad());
        ClusterSecrets {
            admin_password: random_chars(16),
            client_id: format!("@!{org_quad}!0008!{}.{}", quad(), quad()),
            client_secret: random_chars(24),
            inum_org: format!("@!{org_quad}!0001!{}.{}", quad(), quad()),
            inum_appliance: format!("@!{org_quad}!0002!{}.{}", quad(), quad()),
            scim_rs_client_id: format!(
                "@!{org_quad}!0008!{}.{}",
                quad(),
                quad()
            ),
            scim_rp_client_id: format!(
                "@!{org_quad}!0008!{}.{}",
                quad(),
                quad()
            ),
        }
    }
}

fn random_chars(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn quad() -> String {
    random_chars(4).to_uppercase()
}

/// Directory partitions replicated between directory nodes, in order.
pub const DEFAULT_BASE_DNS: [&str; 2] = ["o=gluu", "o=site"];

fn default_base_dns() -> Vec<String> {
    DEFAULT_BASE_DNS.iter().map(|dn| dn.to_string()).collect()
}

/// Parameters for creating a new cluster record.
#[derive(Clone, Debug)]
pub struct ClusterCreate {
    pub name: String,
    pub org_name: String,
    pub hostname: String,
    pub admin_email: String,
    pub overlay_network: Ipv4Net,
}

/// A logical grouping of nodes sharing secrets and an overlay network.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterUuid,
    pub name: String,
    pub org_name: String,
    /// Public hostname served by the web front end.
    pub hostname: String,
    pub admin_email: String,
    pub secrets: ClusterSecrets,
    #[serde(default = "default_base_dns")]
    pub base_dns: Vec<String>,
    pub overlay_network: Ipv4Net,
    #[serde(default)]
    pub reserved_addrs: BTreeSet<Ipv4Addr>,
    pub time_created: DateTime<Utc>,
}

impl Cluster {
    pub fn new(params: ClusterCreate) -> Self {
        Cluster {
            id: ClusterUuid::new_v4(),
            name: params.name,
            org_name: params.org_name,
            hostname: params.hostname,
            admin_email: params.admin_email,
            secrets: ClusterSecrets::generate(),
            base_dns: default_base_dns(),
            overlay_network: params.overlay_network,
            reserved_addrs: BTreeSet::new(),
            time_created: Utc::now(),
        }
    }

    /// Reserves the lowest free host address of the overlay network.
    ///
    /// The caller must persist the cluster for the reservation to stick.
    pub fn reserve_overlay_address(
        &mut self,
    ) -> Result<OverlayAddress, IpPoolError> {
        let addr = self
            .overlay_network
            .hosts()
            .find(|addr| !self.reserved_addrs.contains(addr))
            .ok_or(IpPoolError::Exhausted { network: self.overlay_network })?;
        self.reserved_addrs.insert(addr);
        Ok(OverlayAddress {
            addr,
            prefix_len: self.overlay_network.prefix_len(),
        })
    }

    /// Returns `addr` to the pool. Releasing a free address is a no-op.
    pub fn release_overlay_address(
        &mut self,
        addr: Ipv4Addr,
    ) -> Result<(), IpPoolError> {
        if !self.overlay_network.contains(&addr) {
            return Err(IpPoolError::OutsideNetwork {
                addr,
                network: self.overlay_network,
            });
        }
        self.reserved_addrs.remove(&addr);
        Ok(())
    }
}
