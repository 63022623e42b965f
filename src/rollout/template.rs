//! Deployment template builder.
//!
//! One scale-set resource per pool, parameterised by the per-pool bootstrap
//! envelope. Templates are content-addressed: identical inputs always produce
//! the same deployment name.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, ResourceExt};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::crd::{ManagedCluster, NetworkOutputs, PoolRole, PoolSpec};
use crate::error::{Result, SroError};

const TEMPLATE_SCHEMA: &str =
    "https://schema.management.azure.com/schemas/2019-04-01/deploymentTemplate.json#";
const SCALE_SET_API_VERSION: &str = "2024-03-01";
const HASH_PREFIX_LEN: usize = 12;

/// A fully built template ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentTemplate {
    pub name: String,
    pub template: Value,
    pub parameters: Value,
    /// Hex SHA-256 of template and parameters.
    pub content_hash: String,
    /// Where the template is published, when templates are served by URL.
    pub template_link: Option<String>,
}

/// Source of per-pool bootstrap blob references.
#[async_trait]
pub trait BootstrapStore: Send + Sync {
    /// Blob URL for `pool_name`. `BlobNotReady` until it is published.
    async fn blob_url(&self, cluster: &ManagedCluster, pool_name: &str) -> Result<String>;
}

/// Reads blob URLs from the cluster's bootstrap Secret, one key per pool.
pub struct SecretBootstrapStore {
    client: kube::Client,
}

impl SecretBootstrapStore {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BootstrapStore for SecretBootstrapStore {
    async fn blob_url(&self, cluster: &ManagedCluster, pool_name: &str) -> Result<String> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let secret_name = &cluster.spec.bootstrap_secret_ref;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        let secret = secrets.get_opt(secret_name).await?.ok_or_else(|| {
            SroError::BlobNotReady(format!("bootstrap secret {namespace}/{secret_name} not found"))
        })?;
        secret
            .data
            .as_ref()
            .and_then(|d| d.get(pool_name))
            .map(|v| String::from_utf8_lossy(&v.0).trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                SroError::BlobNotReady(format!(
                    "bootstrap blob for pool {pool_name} not published in {secret_name}"
                ))
            })
    }
}

/// Builds deployment templates from the cluster spec and upstream outputs.
#[derive(Debug, Clone, Default)]
pub struct TemplateBuilder {
    base_url: Option<String>,
}

impl TemplateBuilder {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    /// Build the template for the current desired state.
    ///
    /// `blob_urls` must hold a URL for every pool role.
    pub fn build(
        &self,
        cluster: &ManagedCluster,
        blob_urls: &BTreeMap<PoolRole, String>,
    ) -> Result<DeploymentTemplate> {
        let spec = &cluster.spec;
        let network = cluster
            .status
            .as_ref()
            .and_then(|s| s.network.as_ref())
            .ok_or_else(|| SroError::MissingContext("network outputs not published".to_string()))?;
        let subnet_id = required(network.subnet_id.as_ref(), "subnetId")?;

        let mut resources = Vec::new();
        let mut template_params = serde_json::Map::new();
        let mut parameters = serde_json::Map::new();

        for role in PoolRole::ROLLOUT_ORDER {
            let pool = spec.pool(role);
            let blob_url = blob_urls.get(&role).ok_or_else(|| {
                SroError::BlobNotReady(format!("bootstrap blob for pool {} missing", pool.name))
            })?;
            let param = custom_data_param(role);

            template_params.insert(param.clone(), json!({ "type": "securestring" }));
            parameters.insert(
                param.clone(),
                json!({ "value": custom_data(pool, &spec.version, blob_url)? }),
            );
            resources.push(scale_set_resource(
                pool,
                &spec.location,
                subnet_id,
                backend_pool(network, role)?,
                &param,
            ));
        }

        let template = json!({
            "$schema": TEMPLATE_SCHEMA,
            "contentVersion": "1.0.0.0",
            "parameters": template_params,
            "resources": resources,
        });
        let parameters = Value::Object(parameters);
        let content_hash = content_hash(&template, &parameters)?;

        let name = format!(
            "sro-{}-{}",
            spec.cluster_id.to_lowercase(),
            &content_hash[..HASH_PREFIX_LEN]
        );
        let template_link = self
            .base_url
            .as_ref()
            .map(|base| format!("{base}/{content_hash}.json"));

        debug!(deployment = %name, content_hash = %content_hash, "Built deployment template");
        Ok(DeploymentTemplate {
            name,
            template,
            parameters,
            content_hash,
            template_link,
        })
    }
}

fn required<'a>(value: Option<&'a String>, field: &str) -> Result<&'a str> {
    value
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SroError::MissingContext(format!("network output {field} not published")))
}

fn backend_pool(network: &NetworkOutputs, role: PoolRole) -> Result<&str> {
    match role {
        PoolRole::Master => required(network.master_backend_pool_id.as_ref(), "masterBackendPoolId"),
        PoolRole::Worker => required(network.worker_backend_pool_id.as_ref(), "workerBackendPoolId"),
    }
}

fn custom_data_param(role: PoolRole) -> String {
    format!("{role}CustomData")
}

/// Base64 bootstrap envelope handed to every instance of a pool.
fn custom_data(pool: &PoolSpec, version: &str, blob_url: &str) -> Result<String> {
    let envelope = json!({
        "pool": pool.name,
        "nodeVersion": version,
        "bootstrapBlobUrl": blob_url,
    });
    let raw = serde_json::to_vec(&envelope)
        .map_err(|e| SroError::Config(format!("failed to encode bootstrap envelope: {e}")))?;
    Ok(STANDARD.encode(raw))
}

fn scale_set_resource(
    pool: &PoolSpec,
    location: &str,
    subnet_id: &str,
    backend_pool_id: &str,
    custom_data_param: &str,
) -> Value {
    let data_disks: Vec<Value> = pool
        .data_disks
        .iter()
        .map(|d| {
            json!({
                "lun": d.lun,
                "diskSizeGB": d.size_gb,
                "createOption": "Empty",
                "managedDisk": { "storageAccountType": "Premium_LRS" },
            })
        })
        .collect();

    let mut resource = json!({
        "type": "Microsoft.Compute/virtualMachineScaleSets",
        "apiVersion": SCALE_SET_API_VERSION,
        "name": pool.name,
        "location": location,
        "sku": {
            "name": pool.vm_size,
            "tier": "Standard",
            "capacity": pool.count,
        },
        "properties": {
            "overprovision": false,
            "upgradePolicy": { "mode": "Manual" },
            "virtualMachineProfile": {
                "osProfile": {
                    "computerNamePrefix": format!("{}-", pool.name),
                    "adminUsername": "cloud-user",
                    "customData": format!("[parameters('{custom_data_param}')]"),
                },
                "storageProfile": {
                    "imageReference": {
                        "publisher": pool.image.publisher,
                        "offer": pool.image.offer,
                        "sku": pool.image.sku,
                        "version": pool.image.version,
                    },
                    "osDisk": {
                        "createOption": "FromImage",
                        "managedDisk": { "storageAccountType": "Premium_LRS" },
                    },
                    "dataDisks": data_disks,
                },
                "networkProfile": {
                    "networkInterfaceConfigurations": [{
                        "name": format!("{}-nic", pool.name),
                        "properties": {
                            "primary": true,
                            "ipConfigurations": [{
                                "name": "ipconfig",
                                "properties": {
                                    "subnet": { "id": subnet_id },
                                    "loadBalancerBackendAddressPools": [{ "id": backend_pool_id }],
                                },
                            }],
                        },
                    }],
                },
            },
        },
    });
    if !pool.zones.is_empty() {
        resource["zones"] = json!(pool.zones);
    }
    resource
}

/// Hex SHA-256 over the canonical JSON of template and parameters.
///
/// `serde_json` maps are key-sorted, so serialization is canonical.
fn content_hash(template: &Value, parameters: &Value) -> Result<String> {
    let canonical = serde_json::to_vec(&json!({
        "template": template,
        "parameters": parameters,
    }))
    .map_err(|e| SroError::Config(format!("failed to encode template: {e}")))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}
