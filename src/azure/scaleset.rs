//! Virtual machine scale set instance operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, info};

use super::client::RateLimitedClient;
use crate::crd::{PoolRole, PoolSpec};
use crate::error::Result;

const COMPUTE_API_VERSION: &str = "2024-03-01";

/// Provisioning states after which the provider is no longer mutating a node.
const TERMINAL_PROVISIONING_STATES: [&str; 3] = ["Succeeded", "Failed", "Canceled"];

/// Snapshot of one scale-set instance, fetched fresh every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleSetInstance {
    pub instance_id: String,
    pub latest_model_applied: bool,
    pub provisioning_state: String,
    /// Disk role -> size in GiB.
    pub data_disk_sizes: BTreeMap<String, u32>,
    pub pool_role: PoolRole,
}

impl ScaleSetInstance {
    pub fn is_provisioning_terminal(&self) -> bool {
        TERMINAL_PROVISIONING_STATES
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&self.provisioning_state))
    }
}

/// A pool as addressed by the instance API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTarget {
    pub role: PoolRole,
    pub scale_set: String,
    /// LUN -> disk role, used to name data disks in snapshots.
    pub disk_roles: BTreeMap<i32, String>,
}

impl PoolTarget {
    pub fn new(role: PoolRole, spec: &PoolSpec) -> Self {
        Self {
            role,
            scale_set: spec.name.clone(),
            disk_roles: spec
                .data_disks
                .iter()
                .map(|d| (d.lun, d.role.clone()))
                .collect(),
        }
    }

    fn disk_role(&self, lun: i32) -> String {
        self.disk_roles
            .get(&lun)
            .cloned()
            .unwrap_or_else(|| format!("lun{lun}"))
    }
}

/// Scale-set instance API. All mutations address a single instance.
#[async_trait]
pub trait ScaleSetApi: Send + Sync {
    async fn list_instances(&self, pool: &PoolTarget) -> Result<Vec<ScaleSetInstance>>;

    /// Apply the latest scale-set model to an instance without reimaging it.
    async fn update_instance(&self, pool: &PoolTarget, instance_id: &str) -> Result<()>;

    /// Recreate the instance OS disk from the current model.
    async fn reimage_instance(&self, pool: &PoolTarget, instance_id: &str) -> Result<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmListPage {
    #[serde(default)]
    value: Vec<VmResource>,
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VmResource {
    instance_id: String,
    #[serde(default)]
    properties: VmProperties,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct VmProperties {
    #[serde(default)]
    latest_model_applied: bool,
    #[serde(default)]
    provisioning_state: String,
    #[serde(default)]
    storage_profile: StorageProfile,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StorageProfile {
    #[serde(default)]
    data_disks: Vec<DataDisk>,
}

#[derive(Deserialize)]
struct DataDisk {
    lun: i32,
    #[serde(rename = "diskSizeGB", default)]
    disk_size_gb: Option<u32>,
}

fn to_instance(pool: &PoolTarget, vm: VmResource) -> ScaleSetInstance {
    let data_disk_sizes = vm
        .properties
        .storage_profile
        .data_disks
        .iter()
        .filter_map(|d| d.disk_size_gb.map(|size| (pool.disk_role(d.lun), size)))
        .collect();

    ScaleSetInstance {
        instance_id: vm.instance_id,
        latest_model_applied: vm.properties.latest_model_applied,
        provisioning_state: vm.properties.provisioning_state,
        data_disk_sizes,
        pool_role: pool.role,
    }
}

/// ARM implementation bound to one subscription and resource group.
pub struct ArmScaleSetApi {
    client: Arc<RateLimitedClient>,
    subscription_id: String,
    resource_group: String,
}

impl ArmScaleSetApi {
    pub const fn new(client: Arc<RateLimitedClient>, subscription_id: String, resource_group: String) -> Self {
        Self {
            client,
            subscription_id,
            resource_group,
        }
    }

    fn scale_set_path(&self, scale_set: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.Compute/virtualMachineScaleSets/{}",
            self.subscription_id, self.resource_group, scale_set
        )
    }

    async fn post_instance_action(
        &self,
        operation: &'static str,
        pool: &PoolTarget,
        action: &str,
        instance_id: &str,
    ) -> Result<()> {
        let path = format!(
            "{}/{}?api-version={}",
            self.scale_set_path(&pool.scale_set),
            action,
            COMPUTE_API_VERSION
        );
        let body = serde_json::json!({ "instanceIds": [instance_id] });
        self.client
            .send(operation, Method::POST, &path, Some(&body))
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl ScaleSetApi for ArmScaleSetApi {
    async fn list_instances(&self, pool: &PoolTarget) -> Result<Vec<ScaleSetInstance>> {
        debug!(scale_set = %pool.scale_set, "Listing scale set instances");

        let mut next = Some(format!(
            "{}/virtualMachines?api-version={}",
            self.scale_set_path(&pool.scale_set),
            COMPUTE_API_VERSION
        ));
        let mut instances = Vec::new();

        while let Some(path) = next.take() {
            let page: VmListPage = self
                .client
                .send("scaleset::list", Method::GET, &path, None)
                .await?
                .error_for_status()?
                .json()?;
            instances.extend(page.value.into_iter().map(|vm| to_instance(pool, vm)));
            next = page.next_link.filter(|l| !l.is_empty());
        }

        debug!(
            scale_set = %pool.scale_set,
            count = instances.len(),
            "Listed scale set instances"
        );
        Ok(instances)
    }

    async fn update_instance(&self, pool: &PoolTarget, instance_id: &str) -> Result<()> {
        info!(scale_set = %pool.scale_set, instance_id, "Applying latest model to instance");
        self.post_instance_action("scaleset::update", pool, "manualupgrade", instance_id)
            .await
    }

    async fn reimage_instance(&self, pool: &PoolTarget, instance_id: &str) -> Result<()> {
        info!(scale_set = %pool.scale_set, instance_id, "Reimaging instance");
        self.post_instance_action("scaleset::reimage", pool, "reimage", instance_id)
            .await
    }
}
