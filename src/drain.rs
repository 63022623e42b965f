//! Drain coordinator client.
//!
//! The operator only creates, reads and deletes `NodeDrain` records. The
//! drain agent watching them does the cordon and eviction and reports the
//! outcome as a status condition.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Resource, ResourceExt};
use tracing::{debug, info};

use crate::crd::{ManagedCluster, NodeDrain, NodeDrainSpec};
use crate::error::Result;

/// Label carrying the owning cluster id on every drain record.
pub const CLUSTER_LABEL: &str = "sro.io/cluster";

#[async_trait]
pub trait DrainCoordinator: Send + Sync {
    /// All drain records of a cluster.
    async fn list(&self, cluster_id: &str) -> Result<Vec<NodeDrain>>;

    /// Request a drain. Succeeds if a record for the node already exists.
    async fn create(&self, cluster_id: &str, node_name: &str) -> Result<()>;

    /// Remove a drain record. Succeeds if it is already gone.
    async fn delete(&self, cluster_id: &str, node_name: &str) -> Result<()>;
}

/// Drain records stored next to the `ManagedCluster` that owns them.
pub struct KubeDrainCoordinator {
    api: Api<NodeDrain>,
    owner: Option<OwnerReference>,
}

impl KubeDrainCoordinator {
    pub fn for_cluster(client: kube::Client, cluster: &ManagedCluster) -> Self {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        Self {
            api: Api::namespaced(client, &namespace),
            owner: cluster.controller_owner_ref(&()),
        }
    }
}

fn new_record(cluster_id: &str, node_name: &str, owner: Option<&OwnerReference>) -> NodeDrain {
    let mut drain = NodeDrain::new(
        &NodeDrain::object_name(cluster_id, node_name),
        NodeDrainSpec {
            node_name: node_name.to_string(),
            cluster_id: cluster_id.to_string(),
        },
    );
    drain
        .labels_mut()
        .insert(CLUSTER_LABEL.to_string(), cluster_id.to_string());
    if let Some(owner) = owner {
        drain.owner_references_mut().push(owner.clone());
    }
    drain
}

#[async_trait]
impl DrainCoordinator for KubeDrainCoordinator {
    async fn list(&self, cluster_id: &str) -> Result<Vec<NodeDrain>> {
        let lp = ListParams::default().labels(&format!("{CLUSTER_LABEL}={cluster_id}"));
        let drains = self.api.list(&lp).await?;
        debug!(cluster = cluster_id, count = drains.items.len(), "Listed drain records");
        Ok(drains.items)
    }

    async fn create(&self, cluster_id: &str, node_name: &str) -> Result<()> {
        let record = new_record(cluster_id, node_name, self.owner.as_ref());
        match self.api.create(&PostParams::default(), &record).await {
            Ok(_) => {
                info!(cluster = cluster_id, node = node_name, "Created drain record");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(cluster = cluster_id, node = node_name, "Drain record already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, cluster_id: &str, node_name: &str) -> Result<()> {
        let name = NodeDrain::object_name(cluster_id, node_name);
        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(cluster = cluster_id, node = node_name, "Deleted drain record");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
