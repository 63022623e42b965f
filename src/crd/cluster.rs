//! `ManagedCluster` spec and status types.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DataDiskSpec, PoolRole};

/// `ManagedCluster` declares the desired compute fleet of one managed cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "sro.io",
    version = "v1alpha1",
    kind = "ManagedCluster",
    namespaced,
    status = "ManagedClusterStatus",
    printcolumn = r#"{"name":"CLUSTER","type":"string","jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"VERSION","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"STAGE","type":"string","jsonPath":".metadata.annotations.sro\\.io/rollout-stage"}"#,
    printcolumn = r#"{"name":"LAST ACTION","type":"string","jsonPath":".status.lastAction"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterSpec {
    /// Stable identifier of the cluster, used for drain records and naming.
    pub cluster_id: String,

    /// Azure subscription hosting the cluster. Defaults to the subscription
    /// returned by the credential provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,

    /// Resource group holding the scale sets.
    pub resource_group: String,

    /// Azure location (e.g., "westeurope").
    pub location: String,

    /// Desired node version token. Nodes labelled with a different version are
    /// drained and reimaged.
    pub version: String,

    /// Control plane pool.
    pub master_pool: PoolSpec,

    /// Compute pool.
    pub worker_pool: PoolSpec,

    /// Secret into which the bootstrap publisher writes per-pool blob URLs.
    pub bootstrap_secret_ref: String,

    /// Secret with `tenantId`, `clientId`, `clientSecret`, `subscriptionId`.
    /// When unset, the operator-wide static credentials are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_ref: Option<String>,

    /// Secret holding the guest cluster kubeconfig under key `value`.
    pub kubeconfig_secret_ref: String,
}

impl ManagedClusterSpec {
    pub const fn pool(&self, role: PoolRole) -> &PoolSpec {
        match role {
            PoolRole::Master => &self.master_pool,
            PoolRole::Worker => &self.worker_pool,
        }
    }
}

/// Declared shape of one scale-set pool.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Scale set name; also the node name prefix.
    pub name: String,

    /// VM size (e.g., "`Standard_D4s_v3`").
    pub vm_size: String,

    /// Number of instances.
    pub count: u32,

    /// Availability zones to spread instances across.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,

    /// Data disks attached to every instance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_disks: Vec<DataDiskSpec>,

    /// OS image.
    pub image: ImageReference,
}

/// Marketplace image reference.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

/// Outputs of the upstream network provisioner.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_backend_pool_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_backend_pool_id: Option<String>,
}

/// Condition on the `ManagedCluster` resource.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// Observed state of a `ManagedCluster`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterStatus {
    /// Written by the network provisioner, read by the template builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkOutputs>,

    /// Human-readable description of the last rollout action taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ClusterCondition>,

    #[serde(default)]
    pub observed_generation: i64,
}
