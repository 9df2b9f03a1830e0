// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Overlay address allocation across concurrent orchestrations

use gluu_common::api::{Cluster, IpPoolError, OverlayAddress};
use gluu_common::typed_uuid::ClusterUuid;
use gluu_datastore::DataStore;
use slog::{info, o, Logger};
use std::net::Ipv4Addr;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum OverlayPoolError {
    #[error("failed to update overlay reservations of cluster {cluster_id}")]
    Store {
        cluster_id: ClusterUuid,
        #[source]
        err: gluu_datastore::Error,
    },

    #[error(transparent)]
    Pool(#[from] IpPoolError),
}

/// Hands out overlay addresses from each cluster's network.
///
/// Every reservation reads the cluster record, reserves, and writes it back
/// under one lock, so two nodes never receive the same address.
pub struct OverlayPool {
    log: Logger,
    datastore: DataStore,
    lock: Mutex<()>,
}

impl OverlayPool {
    pub fn new(log: &Logger, datastore: DataStore) -> Self {
        OverlayPool {
            log: log.new(o!("component" => "OverlayPool")),
            datastore,
            lock: Mutex::new(()),
        }
    }

    async fn fetch(
        &self,
        cluster_id: ClusterUuid,
    ) -> Result<Cluster, OverlayPoolError> {
        self.datastore
            .get(cluster_id)
            .await
            .map_err(|err| OverlayPoolError::Store { cluster_id, err })
    }

    async fn store(&self, cluster: &Cluster) -> Result<(), OverlayPoolError> {
        self.datastore
            .update(cluster)
            .await
            .map_err(|err| OverlayPoolError::Store {
                cluster_id: cluster.id,
                err,
            })
    }

    pub async fn reserve(
        &self,
        cluster_id: ClusterUuid,
    ) -> Result<OverlayAddress, OverlayPoolError> {
        let _guard = self.lock.lock().await;
        let mut cluster = self.fetch(cluster_id).await?;
        let address = cluster.reserve_overlay_address()?;
        self.store(&cluster).await?;
        info!(
            self.log,
            "reserved overlay address";
            "cluster_id" => %cluster_id,
            "address" => %address,
        );
        Ok(address)
    }

    pub async fn release(
        &self,
        cluster_id: ClusterUuid,
        addr: Ipv4Addr,
    ) -> Result<(), OverlayPoolError> {
        let _guard = self.lock.lock().await;
        let mut cluster = self.fetch(cluster_id).await?;
        cluster.release_overlay_address(addr)?;
        self.store(&cluster).await?;
        info!(
            self.log,
            "released overlay address";
            "cluster_id" => %cluster_id,
            "address" => %addr,
        );
        Ok(())
    }
}
