//! Azure Resource Manager access.
//!
//! Clients are assembled per cluster from its credentials and cached. All
//! clients sharing a subscription and principal share one backpressure gate.

pub mod backpressure;
pub mod cache;
pub mod client;
pub mod credentials;
pub mod deployment;
pub mod retry_after;
pub mod scaleset;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use backpressure::GateRegistry;
use cache::{ClientCache, ClientKind};
use client::{BackpressureInterceptor, Interceptor, MetricsInterceptor, RateLimitedClient};
use credentials::CredentialProvider;
use deployment::ArmTemplateApi;
use scaleset::ArmScaleSetApi;

use crate::crd::ManagedCluster;
use crate::error::Result;
use crate::telemetry::metrics::Metrics;

/// An assembled client and the subscription it was built for.
#[derive(Clone)]
struct BoundClient {
    client: Arc<RateLimitedClient>,
    subscription_id: String,
}

/// Azure APIs bound to one cluster's subscription and resource group.
pub struct ClusterClients {
    pub scale_sets: ArmScaleSetApi,
    pub templates: ArmTemplateApi,
}

/// Builds and caches per-cluster Azure clients.
pub struct AzureFactory {
    credentials: Arc<dyn CredentialProvider>,
    gates: GateRegistry,
    clients: ClientCache<(String, ClientKind), BoundClient>,
    metrics: Option<Arc<Metrics>>,
    endpoint: String,
    timeout: Duration,
}

impl AzureFactory {
    pub fn new(
        credentials: Arc<dyn CredentialProvider>,
        metrics: Option<Arc<Metrics>>,
        endpoint: &str,
        timeout: Duration,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            credentials,
            gates: GateRegistry::new(),
            clients: ClientCache::new(cache_ttl),
            metrics,
            endpoint: endpoint.to_string(),
            timeout,
        }
    }

    /// Clients for `cluster`, reusing cached ones within the TTL.
    pub async fn for_cluster(&self, cluster: &ManagedCluster) -> Result<ClusterClients> {
        let compute = self.client(cluster, ClientKind::Compute).await?;
        let resources = self.client(cluster, ClientKind::Resources).await?;
        let resource_group = cluster.spec.resource_group.clone();

        Ok(ClusterClients {
            scale_sets: ArmScaleSetApi::new(
                compute.client,
                compute.subscription_id,
                resource_group.clone(),
            ),
            templates: ArmTemplateApi::new(
                resources.client,
                resources.subscription_id,
                resource_group,
            ),
        })
    }

    /// Drop cached clients of a cluster, forcing a credential refetch.
    pub fn invalidate(&self, cluster_id: &str) {
        for kind in [ClientKind::Compute, ClientKind::Resources] {
            self.clients.invalidate(&(cluster_id.to_string(), kind));
        }
    }

    async fn client(&self, cluster: &ManagedCluster, kind: ClientKind) -> Result<BoundClient> {
        let key = (cluster.spec.cluster_id.clone(), kind);
        self.clients
            .get_or_try_init(&key, || self.build(cluster, kind))
            .await
    }

    async fn build(&self, cluster: &ManagedCluster, kind: ClientKind) -> Result<BoundClient> {
        let creds = self.credentials.get_credentials(cluster).await?;
        self.gates.prune();
        let gate = self.gates.gate(&creds.gate_key());

        let mut interceptors: Vec<Arc<dyn Interceptor>> =
            vec![Arc::new(BackpressureInterceptor::new(gate))];
        if let Some(metrics) = &self.metrics {
            interceptors.push(Arc::new(MetricsInterceptor::new(metrics.clone())));
        }

        debug!(
            cluster = %cluster.spec.cluster_id,
            kind = %kind,
            subscription = %creds.subscription_id,
            gates = self.gates.count(),
            "Assembled Azure client"
        );
        let client = RateLimitedClient::new(&self.endpoint, self.timeout, creds.authorizer, interceptors)?;
        Ok(BoundClient {
            client: Arc::new(client),
            subscription_id: creds.subscription_id,
        })
    }
}
