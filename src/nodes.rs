//! Guest cluster nodes: naming and tracked versions.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::crd::ManagedCluster;
use crate::error::{Result, SroError};

/// Node label written by the node bootstrap with the version it booted.
pub const NODE_VERSION_LABEL: &str = "sro.io/node-version";

/// Secret key holding the guest kubeconfig.
const KUBECONFIG_KEY: &str = "value";

const NODE_SUFFIX_WIDTH: usize = 6;

/// Node name of a scale-set instance: `<pool>-<base36(instance id)>`, the
/// suffix left-padded with zeros to six characters.
pub fn node_name(pool_name: &str, instance_id: &str) -> String {
    let suffix = instance_id
        .parse::<u64>()
        .map_or_else(|_| instance_id.to_lowercase(), to_base36);
    format!(
        "{}-{:0>width$}",
        pool_name.to_lowercase(),
        suffix,
        width = NODE_SUFFIX_WIDTH
    )
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Source of the version each guest node is running.
#[async_trait]
pub trait NodeVersionSource: Send + Sync {
    /// Node name -> tracked version. Untracked nodes are absent.
    async fn versions(&self, cluster: &ManagedCluster) -> Result<BTreeMap<String, String>>;
}

/// Reads node labels from the guest cluster through its kubeconfig Secret.
pub struct KubeNodeVersionSource {
    client: kube::Client,
}

impl KubeNodeVersionSource {
    pub const fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn guest_client(&self, cluster: &ManagedCluster) -> Result<kube::Client> {
        let namespace = cluster.namespace().unwrap_or_else(|| "default".to_string());
        let secret_name = &cluster.spec.kubeconfig_secret_ref;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        let secret = secrets.get_opt(secret_name).await?.ok_or_else(|| {
            SroError::MissingContext(format!("kubeconfig secret {namespace}/{secret_name} not found"))
        })?;
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_KEY))
            .ok_or_else(|| {
                SroError::MissingContext(format!(
                    "kubeconfig secret {secret_name} has no key {KUBECONFIG_KEY}"
                ))
            })?;

        let kubeconfig = Kubeconfig::from_yaml(&String::from_utf8_lossy(&raw.0))
            .map_err(|e| SroError::KubernetesApi(format!("invalid guest kubeconfig: {e}")))?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| SroError::KubernetesApi(format!("invalid guest kubeconfig: {e}")))?;
        kube::Client::try_from(config)
            .map_err(|e| SroError::KubernetesApi(format!("failed to build guest client: {e}")))
    }
}

/// Collect tracked versions from node labels.
pub fn versions_from_nodes(nodes: &[Node]) -> BTreeMap<String, String> {
    nodes
        .iter()
        .filter_map(|n| {
            n.labels()
                .get(NODE_VERSION_LABEL)
                .map(|v| (n.name_any(), v.clone()))
        })
        .collect()
}

#[async_trait]
impl NodeVersionSource for KubeNodeVersionSource {
    async fn versions(&self, cluster: &ManagedCluster) -> Result<BTreeMap<String, String>> {
        let guest = self.guest_client(cluster).await?;
        let nodes: Api<Node> = Api::all(guest);
        let list = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| SroError::GuestUnreachable(format!("failed to list guest nodes: {e}")))?;
        let versions = versions_from_nodes(&list.items);
        debug!(
            cluster = %cluster.spec.cluster_id,
            nodes = list.items.len(),
            tracked = versions.len(),
            "Read node versions"
        );
        Ok(versions)
    }
}
