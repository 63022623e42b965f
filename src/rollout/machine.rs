//! Rollout stage machine.
//!
//! Each pass loads the persisted stage, takes at most one step and returns the
//! stage to persist. Masters are fully converged before any worker is touched.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::selector::{DesiredNodeSpec, WorkingSet, select};
use super::template::{BootstrapStore, TemplateBuilder};
use crate::azure::deployment::{DeploymentState, TemplateApi};
use crate::azure::scaleset::{PoolTarget, ScaleSetApi};
use crate::crd::{DrainConditionType, ManagedCluster, NodeDrain, PoolRole};
use crate::drain::DrainCoordinator;
use crate::error::{Result, SroError};
use crate::nodes::{NodeVersionSource, node_name};
use crate::stage::{PersistedStage, RolloutStage};

/// What a pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassEvent {
    /// Stage is `Unset` and the current generation has been rolled out.
    Idle,
    /// Nothing could be done this pass; retried on the next one.
    Waiting(String),
    TemplateSubmitted { deployment: String },
    ProvisioningSucceeded { deployment: String },
    ProvisioningFailed { deployment: String, message: String },
    UpgradeStarted,
    ModelUpdated { pool: PoolRole, instance_id: String },
    DrainRequested { pool: PoolRole, node: String },
    Reimaged { pool: PoolRole, node: String },
    CycleCompleted,
}

impl PassEvent {
    /// Event reason, `None` for passes that changed nothing.
    pub const fn reason(&self) -> Option<&'static str> {
        match self {
            Self::Idle | Self::Waiting(_) => None,
            Self::TemplateSubmitted { .. } => Some("TemplateSubmitted"),
            Self::ProvisioningSucceeded { .. } => Some("ProvisioningSucceeded"),
            Self::ProvisioningFailed { .. } => Some("ProvisioningFailed"),
            Self::UpgradeStarted => Some("UpgradeStarted"),
            Self::ModelUpdated { .. } => Some("ModelUpdated"),
            Self::DrainRequested { .. } => Some("DrainRequested"),
            Self::Reimaged { .. } => Some("Reimaged"),
            Self::CycleCompleted => Some("CycleCompleted"),
        }
    }

    /// Pool and action label for instance-level actions.
    pub const fn pool_action(&self) -> Option<(PoolRole, &'static str)> {
        match self {
            Self::ModelUpdated { pool, .. } => Some((*pool, "update")),
            Self::DrainRequested { pool, .. } => Some((*pool, "drain")),
            Self::Reimaged { pool, .. } => Some((*pool, "reimage")),
            _ => None,
        }
    }

    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::ProvisioningFailed { .. })
    }
}

impl std::fmt::Display for PassEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Waiting(reason) => write!(f, "Waiting: {reason}"),
            Self::TemplateSubmitted { deployment } => write!(f, "Submitted deployment {deployment}"),
            Self::ProvisioningSucceeded { deployment } => {
                write!(f, "Deployment {deployment} succeeded")
            }
            Self::ProvisioningFailed { deployment, message } => {
                write!(f, "Deployment {deployment} failed: {message}")
            }
            Self::UpgradeStarted => write!(f, "Started instance upgrades"),
            Self::ModelUpdated { pool, instance_id } => {
                write!(f, "Applied latest model to {pool} instance {instance_id}")
            }
            Self::DrainRequested { pool, node } => write!(f, "Requested drain of {pool} node {node}"),
            Self::Reimaged { pool, node } => write!(f, "Reimaged {pool} node {node}"),
            Self::CycleCompleted => write!(f, "All pools converged"),
        }
    }
}

/// Result of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    /// Stage to persist; `None` leaves the persisted stage untouched.
    pub next: Option<PersistedStage>,
    pub event: PassEvent,
}

impl PassOutcome {
    fn stay(event: PassEvent) -> Self {
        Self { next: None, event }
    }

    fn waiting(reason: impl Into<String>) -> Self {
        Self::stay(PassEvent::Waiting(reason.into()))
    }

    /// The stage in effect after this pass.
    pub fn stage_after(&self, current: &PersistedStage) -> RolloutStage {
        self.next.as_ref().map_or(current.stage, |n| n.stage)
    }
}

/// Collaborators the machine drives.
pub struct StageMachine<'a> {
    pub templates: &'a dyn TemplateApi,
    pub scale_sets: &'a dyn ScaleSetApi,
    pub drains: &'a dyn DrainCoordinator,
    pub versions: &'a dyn NodeVersionSource,
    pub bootstrap: &'a dyn BootstrapStore,
    pub builder: &'a TemplateBuilder,
}

impl StageMachine<'_> {
    /// Run one pass for `cluster` from the persisted stage `current`.
    ///
    /// Blob-not-ready and missing upstream context end the pass as a wait.
    /// Every other error is returned without touching the stage.
    pub async fn run_pass(&self, cluster: &ManagedCluster, current: &PersistedStage) -> Result<PassOutcome> {
        let result = match current.stage {
            RolloutStage::Unset => self.initialize(cluster, current).await,
            RolloutStage::DeploymentInitialized => self.await_provisioning(current).await,
            RolloutStage::ProvisioningSuccessful => Ok(PassOutcome {
                next: Some(PersistedStage {
                    stage: RolloutStage::InstancesUpgrading,
                    deployment: None,
                    applied_generation: current.applied_generation,
                }),
                event: PassEvent::UpgradeStarted,
            }),
            RolloutStage::InstancesUpgrading => self.upgrade_instances(cluster, current).await,
        };

        let outcome = match result {
            Err(e) if e.is_recoverable_wait() => {
                debug!(cluster = %cluster.spec.cluster_id, stage = %current.stage, "Waiting: {}", e);
                return Ok(PassOutcome::waiting(e.to_string()));
            }
            other => other?,
        };

        if let Some(next) = &outcome.next
            && next.stage != current.stage
            && !current.stage.can_transition_to(next.stage)
        {
            return Err(SroError::InvalidStage(format!(
                "{} -> {}",
                current.stage, next.stage
            )));
        }
        Ok(outcome)
    }

    async fn initialize(&self, cluster: &ManagedCluster, current: &PersistedStage) -> Result<PassOutcome> {
        let generation = cluster.metadata.generation;
        if generation.is_some() && current.applied_generation == generation {
            return Ok(PassOutcome::stay(PassEvent::Idle));
        }

        let mut blob_urls = BTreeMap::new();
        for role in PoolRole::ROLLOUT_ORDER {
            let pool = cluster.spec.pool(role);
            blob_urls.insert(role, self.bootstrap.blob_url(cluster, &pool.name).await?);
        }
        let template = self.builder.build(cluster, &blob_urls)?;
        let deployment = self.templates.submit(&template).await?;

        info!(
            cluster = %cluster.spec.cluster_id,
            deployment = %deployment,
            "Deployment submitted"
        );
        Ok(PassOutcome {
            next: Some(PersistedStage {
                stage: RolloutStage::DeploymentInitialized,
                deployment: Some(deployment.clone()),
                applied_generation: generation,
            }),
            event: PassEvent::TemplateSubmitted { deployment },
        })
    }

    async fn await_provisioning(&self, current: &PersistedStage) -> Result<PassOutcome> {
        let reset = PersistedStage {
            stage: RolloutStage::Unset,
            deployment: None,
            applied_generation: None,
        };

        let Some(deployment) = current.deployment.clone() else {
            warn!("No deployment reference recorded, resubmitting template");
            return Ok(PassOutcome {
                next: Some(reset),
                event: PassEvent::ProvisioningFailed {
                    deployment: String::new(),
                    message: "deployment reference lost".to_string(),
                },
            });
        };

        match self.templates.get_status(&deployment).await? {
            DeploymentState::NotFound => Ok(PassOutcome::waiting(format!(
                "deployment {deployment} not found yet"
            ))),
            DeploymentState::InProgress(state) => Ok(PassOutcome::waiting(format!(
                "deployment {deployment} is {state}"
            ))),
            DeploymentState::Succeeded => {
                info!(deployment = %deployment, "Deployment succeeded");
                Ok(PassOutcome {
                    next: Some(PersistedStage {
                        stage: RolloutStage::ProvisioningSuccessful,
                        deployment: Some(deployment.clone()),
                        applied_generation: current.applied_generation,
                    }),
                    event: PassEvent::ProvisioningSucceeded { deployment },
                })
            }
            DeploymentState::Failed(message) => {
                warn!(deployment = %deployment, "Deployment failed: {}", message);
                Ok(PassOutcome {
                    next: Some(reset),
                    event: PassEvent::ProvisioningFailed { deployment, message },
                })
            }
        }
    }

    async fn upgrade_instances(&self, cluster: &ManagedCluster, current: &PersistedStage) -> Result<PassOutcome> {
        let spec = &cluster.spec;
        let cluster_id = spec.cluster_id.as_str();
        let drains = self.drains.list(cluster_id).await?;
        let untracked = BTreeMap::new();
        let mut versions = None;

        for role in PoolRole::ROLLOUT_ORDER {
            let target = PoolTarget::new(role, spec.pool(role));
            let desired = DesiredNodeSpec::for_pool(spec, role);
            let instances = self.scale_sets.list_instances(&target).await?;

            // Tracked versions live in the guest cluster, which may be down while
            // an instance is mid-update. Only the drain/reimage step reads them.
            let settled = instances
                .iter()
                .all(|i| i.is_provisioning_terminal() && i.latest_model_applied);
            if settled && versions.is_none() {
                versions = Some(self.versions.versions(cluster).await?);
            }

            let working_set = select(
                &instances,
                &drains,
                &desired,
                versions.as_ref().unwrap_or(&untracked),
            );
            if working_set.is_empty() {
                debug!(cluster = cluster_id, pool = %role, "Pool converged");
                continue;
            }
            let Some(instance) = working_set.instance() else {
                continue;
            };
            let instance_id = instance.instance_id.clone();
            let node = node_name(&desired.pool_name, &instance_id);

            let event = match &working_set {
                WorkingSet::Converged => continue,
                WorkingSet::InProgress(_) => {
                    return Ok(PassOutcome::waiting(format!(
                        "{role} instance {instance_id} is {}",
                        instance.provisioning_state
                    )));
                }
                WorkingSet::Update(_) => {
                    self.scale_sets.update_instance(&target, &instance_id).await?;
                    PassEvent::ModelUpdated { pool: role, instance_id }
                }
                WorkingSet::Drain(_) => {
                    if drains.iter().any(|d| d.spec.node_name == node) {
                        return Ok(PassOutcome::waiting(format!("drain of {role} node {node} in progress")));
                    }
                    self.drains.create(cluster_id, &node).await?;
                    PassEvent::DrainRequested { pool: role, node }
                }
                WorkingSet::Reimage(_) => {
                    let outcome = drains
                        .iter()
                        .find(|d| d.spec.node_name == node)
                        .and_then(NodeDrain::outcome);
                    if outcome == Some(DrainConditionType::TimedOut) {
                        warn!(cluster = cluster_id, node = %node, "Drain timed out, reimaging anyway");
                    }
                    self.scale_sets.reimage_instance(&target, &instance_id).await?;
                    self.drains.delete(cluster_id, &node).await?;
                    PassEvent::Reimaged { pool: role, node }
                }
            };

            info!(
                cluster = cluster_id,
                pool = %instance.pool_role,
                instance_id = %instance.instance_id,
                "{}",
                event
            );
            return Ok(PassOutcome::stay(event));
        }

        for record in &drains {
            let node = &record.spec.node_name;
            info!(cluster = cluster_id, node = %node, "Removing drain record of converged node");
            self.drains.delete(cluster_id, node).await?;
        }

        info!(cluster = cluster_id, "Rollout cycle complete");
        Ok(PassOutcome {
            next: Some(PersistedStage {
                stage: RolloutStage::Unset,
                deployment: None,
                applied_generation: current.applied_generation,
            }),
            event: PassEvent::CycleCompleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::azure::scaleset::ScaleSetInstance;
    use crate::crd::drain::{DrainCondition, NodeDrainStatus};
    use crate::crd::{ManagedClusterSpec, ManagedClusterStatus, NetworkOutputs, NodeDrainSpec};
    use crate::rollout::template::DeploymentTemplate;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl Calls {
        fn push(&self, call: String) {
            self.0.lock().unwrap().push(call);
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct FakeTemplates {
        state: Mutex<DeploymentState>,
        calls: Calls,
    }

    #[async_trait]
    impl TemplateApi for FakeTemplates {
        async fn submit(&self, template: &DeploymentTemplate) -> Result<String> {
            self.calls.push(format!("submit {}", template.name));
            Ok(template.name.clone())
        }

        async fn get_status(&self, operation_ref: &str) -> Result<DeploymentState> {
            self.calls.push(format!("status {operation_ref}"));
            Ok(self.state.lock().unwrap().clone())
        }
    }

    struct FakeScaleSets {
        pools: Mutex<BTreeMap<PoolRole, Vec<ScaleSetInstance>>>,
        limited_until: Mutex<Option<DateTime<Utc>>>,
        calls: Calls,
    }

    #[async_trait]
    impl ScaleSetApi for FakeScaleSets {
        async fn list_instances(&self, pool: &PoolTarget) -> Result<Vec<ScaleSetInstance>> {
            if let Some(retry_at) = *self.limited_until.lock().unwrap() {
                return Err(SroError::TooManyRequests {
                    operation: "scaleset::list".to_string(),
                    retry_at,
                });
            }
            Ok(self.pools.lock().unwrap().get(&pool.role).cloned().unwrap_or_default())
        }

        async fn update_instance(&self, pool: &PoolTarget, instance_id: &str) -> Result<()> {
            self.calls.push(format!("update {} {instance_id}", pool.role));
            Ok(())
        }

        async fn reimage_instance(&self, pool: &PoolTarget, instance_id: &str) -> Result<()> {
            self.calls.push(format!("reimage {} {instance_id}", pool.role));
            Ok(())
        }
    }

    struct FakeDrains {
        records: Mutex<Vec<NodeDrain>>,
        calls: Calls,
    }

    #[async_trait]
    impl DrainCoordinator for FakeDrains {
        async fn list(&self, _cluster_id: &str) -> Result<Vec<NodeDrain>> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn create(&self, cluster_id: &str, node_name: &str) -> Result<()> {
            self.calls.push(format!("create {node_name}"));
            self.records.lock().unwrap().push(NodeDrain::new(
                &NodeDrain::object_name(cluster_id, node_name),
                NodeDrainSpec {
                    node_name: node_name.to_string(),
                    cluster_id: cluster_id.to_string(),
                },
            ));
            Ok(())
        }

        async fn delete(&self, _cluster_id: &str, node_name: &str) -> Result<()> {
            self.calls.push(format!("delete {node_name}"));
            self.records.lock().unwrap().retain(|d| d.spec.node_name != node_name);
            Ok(())
        }
    }

    struct FakeVersions(BTreeMap<String, String>);

    #[async_trait]
    impl NodeVersionSource for FakeVersions {
        async fn versions(&self, _cluster: &ManagedCluster) -> Result<BTreeMap<String, String>> {
            Ok(self.0.clone())
        }
    }

    struct UnreachableGuest;

    #[async_trait]
    impl NodeVersionSource for UnreachableGuest {
        async fn versions(&self, _cluster: &ManagedCluster) -> Result<BTreeMap<String, String>> {
            Err(SroError::GuestUnreachable("connection refused".to_string()))
        }
    }

    struct FakeBootstrap {
        published: bool,
    }

    #[async_trait]
    impl BootstrapStore for FakeBootstrap {
        async fn blob_url(&self, _cluster: &ManagedCluster, pool_name: &str) -> Result<String> {
            if self.published {
                Ok(format!("https://blob/{pool_name}"))
            } else {
                Err(SroError::BlobNotReady(pool_name.to_string()))
            }
        }
    }

    struct Harness {
        templates: FakeTemplates,
        scale_sets: FakeScaleSets,
        drains: FakeDrains,
        versions: FakeVersions,
        bootstrap: FakeBootstrap,
        builder: TemplateBuilder,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                templates: FakeTemplates {
                    state: Mutex::new(DeploymentState::InProgress("Running".to_string())),
                    calls: Calls::default(),
                },
                scale_sets: FakeScaleSets {
                    pools: Mutex::new(BTreeMap::new()),
                    limited_until: Mutex::new(None),
                    calls: Calls::default(),
                },
                drains: FakeDrains {
                    records: Mutex::new(Vec::new()),
                    calls: Calls::default(),
                },
                versions: FakeVersions(BTreeMap::new()),
                bootstrap: FakeBootstrap { published: true },
                builder: TemplateBuilder::default(),
            }
        }

        fn machine(&self) -> StageMachine<'_> {
            StageMachine {
                templates: &self.templates,
                scale_sets: &self.scale_sets,
                drains: &self.drains,
                versions: &self.versions,
                bootstrap: &self.bootstrap,
                builder: &self.builder,
            }
        }

        fn machine_without_guest(&self) -> StageMachine<'_> {
            StageMachine {
                versions: &UnreachableGuest,
                ..self.machine()
            }
        }

        fn set_pool(&self, role: PoolRole, instances: Vec<ScaleSetInstance>) {
            self.scale_sets.pools.lock().unwrap().insert(role, instances);
        }

        fn mutations(&self) -> Vec<String> {
            let mut all = self.scale_sets.calls.take();
            all.extend(self.drains.calls.take());
            all.extend(
                self.templates
                    .calls
                    .take()
                    .into_iter()
                    .filter(|c| c.starts_with("submit")),
            );
            all
        }
    }

    fn cluster(generation: i64) -> ManagedCluster {
        let spec: ManagedClusterSpec = serde_json::from_value(serde_json::json!({
            "clusterId": "c1",
            "resourceGroup": "rg-c1",
            "location": "westeurope",
            "version": "2",
            "masterPool": {
                "name": "master",
                "vmSize": "Standard_D4s_v3",
                "count": 1,
                "image": {"publisher": "p", "offer": "o", "sku": "s", "version": "1"}
            },
            "workerPool": {
                "name": "worker",
                "vmSize": "Standard_D8s_v3",
                "count": 1,
                "image": {"publisher": "p", "offer": "o", "sku": "s", "version": "1"}
            },
            "bootstrapSecretRef": "c1-bootstrap",
            "kubeconfigSecretRef": "c1-kubeconfig"
        }))
        .unwrap();
        let mut c = ManagedCluster::new("c1", spec);
        c.metadata.generation = Some(generation);
        c.status = Some(ManagedClusterStatus {
            network: Some(NetworkOutputs {
                subnet_id: Some("/subnets/nodes".to_string()),
                master_backend_pool_id: Some("/pools/master".to_string()),
                worker_backend_pool_id: Some("/pools/worker".to_string()),
            }),
            ..Default::default()
        });
        c
    }

    fn instance(role: PoolRole, id: &str, model: bool, state: &str) -> ScaleSetInstance {
        ScaleSetInstance {
            instance_id: id.to_string(),
            latest_model_applied: model,
            provisioning_state: state.to_string(),
            data_disk_sizes: BTreeMap::new(),
            pool_role: role,
        }
    }

    fn stage(stage: RolloutStage, deployment: Option<&str>, generation: Option<i64>) -> PersistedStage {
        PersistedStage {
            stage,
            deployment: deployment.map(str::to_string),
            applied_generation: generation,
        }
    }

    fn mark_drained(h: &Harness, node: &str) {
        for d in h.drains.records.lock().unwrap().iter_mut() {
            if d.spec.node_name == node {
                d.status = Some(NodeDrainStatus {
                    conditions: vec![DrainCondition {
                        r#type: DrainConditionType::Drained,
                        status: "True".to_string(),
                        last_transition_time: None,
                    }],
                });
            }
        }
    }

    #[tokio::test]
    async fn test_unset_submits_template() {
        let h = Harness::new();
        let out = h.machine().run_pass(&cluster(1), &PersistedStage::default()).await.unwrap();

        let next = out.next.unwrap();
        assert_eq!(next.stage, RolloutStage::DeploymentInitialized);
        assert!(next.deployment.as_deref().unwrap().starts_with("sro-c1-"));
        assert_eq!(next.applied_generation, Some(1));
        assert!(matches!(out.event, PassEvent::TemplateSubmitted { .. }));
        assert_eq!(h.mutations().len(), 1);
    }

    #[tokio::test]
    async fn test_blob_not_ready_waits() {
        let mut h = Harness::new();
        h.bootstrap.published = false;
        let out = h.machine().run_pass(&cluster(1), &PersistedStage::default()).await.unwrap();
        assert!(out.next.is_none());
        assert!(matches!(out.event, PassEvent::Waiting(_)));
        assert!(h.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_missing_network_waits() {
        let h = Harness::new();
        let mut c = cluster(1);
        c.status = None;
        let out = h.machine().run_pass(&c, &PersistedStage::default()).await.unwrap();
        assert!(out.next.is_none());
        assert!(matches!(out.event, PassEvent::Waiting(_)));
    }

    #[tokio::test]
    async fn test_unset_idle_when_generation_applied() {
        let h = Harness::new();
        let out = h
            .machine()
            .run_pass(&cluster(3), &stage(RolloutStage::Unset, None, Some(3)))
            .await
            .unwrap();
        assert_eq!(out, PassOutcome::stay(PassEvent::Idle));
        assert!(h.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_provisioning_waits_while_running() {
        let h = Harness::new();
        let current = stage(RolloutStage::DeploymentInitialized, Some("sro-c1-abc"), Some(1));
        for state in [
            DeploymentState::NotFound,
            DeploymentState::InProgress("Accepted".to_string()),
        ] {
            *h.templates.state.lock().unwrap() = state;
            let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
            assert!(out.next.is_none());
            assert!(matches!(out.event, PassEvent::Waiting(_)));
        }
        assert!(h.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_provisioning_success_advances() {
        let h = Harness::new();
        *h.templates.state.lock().unwrap() = DeploymentState::Succeeded;
        let current = stage(RolloutStage::DeploymentInitialized, Some("sro-c1-abc"), Some(1));
        let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
        assert_eq!(
            out.next,
            Some(stage(RolloutStage::ProvisioningSuccessful, Some("sro-c1-abc"), Some(1)))
        );
    }

    #[tokio::test]
    async fn test_provisioning_failure_reverts_to_unset() {
        let h = Harness::new();
        *h.templates.state.lock().unwrap() = DeploymentState::Failed("InvalidTemplate: bad".to_string());
        let current = stage(RolloutStage::DeploymentInitialized, Some("sro-c1-abc"), Some(1));
        let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
        assert_eq!(out.next, Some(PersistedStage::default()));
        assert!(out.event.is_failure());

        // The reverted stage resubmits on the next pass.
        let again = h.machine().run_pass(&cluster(1), &PersistedStage::default()).await.unwrap();
        assert!(matches!(again.event, PassEvent::TemplateSubmitted { .. }));
    }

    #[tokio::test]
    async fn test_provisioning_successful_moves_to_upgrading() {
        let h = Harness::new();
        let current = stage(RolloutStage::ProvisioningSuccessful, Some("sro-c1-abc"), Some(1));
        let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
        assert_eq!(out.next, Some(stage(RolloutStage::InstancesUpgrading, None, Some(1))));
        assert_eq!(out.event, PassEvent::UpgradeStarted);
        assert!(h.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_master_action_blocks_workers() {
        let mut h = Harness::new();
        h.versions = FakeVersions(BTreeMap::from([
            ("master-000000".to_string(), "1".to_string()),
            ("worker-000000".to_string(), "1".to_string()),
        ]));
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", true, "Succeeded")]);
        h.set_pool(PoolRole::Worker, vec![instance(PoolRole::Worker, "0", false, "Succeeded")]);

        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));
        let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
        assert!(out.next.is_none());
        assert_eq!(
            out.event,
            PassEvent::DrainRequested {
                pool: PoolRole::Master,
                node: "master-000000".to_string()
            }
        );
        assert_eq!(h.mutations(), vec!["create master-000000".to_string()]);
    }

    #[tokio::test]
    async fn test_master_in_progress_blocks_workers() {
        let h = Harness::new();
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", true, "Updating")]);
        h.set_pool(PoolRole::Worker, vec![instance(PoolRole::Worker, "0", false, "Succeeded")]);

        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));
        let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
        assert!(matches!(out.event, PassEvent::Waiting(_)));
        assert!(h.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_workers_after_masters_converge() {
        let h = Harness::new();
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", true, "Succeeded")]);
        h.set_pool(PoolRole::Worker, vec![instance(PoolRole::Worker, "0", false, "Succeeded")]);

        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));
        let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
        assert_eq!(
            out.event,
            PassEvent::ModelUpdated {
                pool: PoolRole::Worker,
                instance_id: "0".to_string()
            }
        );
        assert_eq!(h.mutations(), vec!["update worker 0".to_string()]);
    }

    #[tokio::test]
    async fn test_full_drain_reimage_cycle() {
        let mut h = Harness::new();
        h.versions = FakeVersions(BTreeMap::from([
            ("master-000000".to_string(), "2".to_string()),
            ("worker-000001".to_string(), "1".to_string()),
        ]));
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", true, "Succeeded")]);
        h.set_pool(PoolRole::Worker, vec![instance(PoolRole::Worker, "1", true, "Succeeded")]);
        let c = cluster(1);
        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));

        // Pass 1: drain requested.
        let out = h.machine().run_pass(&c, &current).await.unwrap();
        assert!(matches!(out.event, PassEvent::DrainRequested { .. }));
        assert_eq!(h.mutations(), vec!["create worker-000001".to_string()]);

        // Pass 2: drain still running, nothing issued.
        let out = h.machine().run_pass(&c, &current).await.unwrap();
        assert!(matches!(out.event, PassEvent::Waiting(_)));
        assert!(h.mutations().is_empty());

        // Pass 3: drain finished, reimage then delete the record.
        mark_drained(&h, "worker-000001");
        let out = h.machine().run_pass(&c, &current).await.unwrap();
        assert_eq!(
            out.event,
            PassEvent::Reimaged {
                pool: PoolRole::Worker,
                node: "worker-000001".to_string()
            }
        );
        assert_eq!(
            h.mutations(),
            vec!["reimage worker 1".to_string(), "delete worker-000001".to_string()]
        );
        assert!(h.drains.records.lock().unwrap().is_empty());

        // Pass 4: node came back on the desired version.
        h.versions.0.insert("worker-000001".to_string(), "2".to_string());
        let out = h.machine().run_pass(&c, &current).await.unwrap();
        assert_eq!(out.event, PassEvent::CycleCompleted);
        assert_eq!(out.next, Some(stage(RolloutStage::Unset, None, Some(1))));
        assert!(h.mutations().is_empty());

        // Pass 5: idle until the generation changes.
        let out = h.machine().run_pass(&c, &out.next.unwrap()).await.unwrap();
        assert_eq!(out.event, PassEvent::Idle);
        let out = h
            .machine()
            .run_pass(&cluster(2), &stage(RolloutStage::Unset, None, Some(1)))
            .await
            .unwrap();
        assert!(matches!(out.event, PassEvent::TemplateSubmitted { .. }));
    }

    #[tokio::test]
    async fn test_existing_terminal_drain_reimages_immediately() {
        let mut h = Harness::new();
        h.versions = FakeVersions(BTreeMap::from([("master-000000".to_string(), "1".to_string())]));
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", true, "Succeeded")]);
        h.drains.records.lock().unwrap().push(NodeDrain::new(
            "c1-master-000000",
            NodeDrainSpec {
                node_name: "master-000000".to_string(),
                cluster_id: "c1".to_string(),
            },
        ));
        mark_drained(&h, "master-000000");

        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));
        let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
        assert!(matches!(out.event, PassEvent::Reimaged { pool: PoolRole::Master, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_guest_during_master_update_waits() {
        let h = Harness::new();
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", true, "Updating")]);
        h.set_pool(PoolRole::Worker, vec![instance(PoolRole::Worker, "0", true, "Succeeded")]);

        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));
        let out = h.machine_without_guest().run_pass(&cluster(1), &current).await.unwrap();
        assert!(out.next.is_none());
        assert!(matches!(out.event, PassEvent::Waiting(ref r) if r.contains("Updating")));
        assert!(h.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_guest_when_versions_needed_waits() {
        let h = Harness::new();
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", true, "Succeeded")]);

        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));
        let out = h.machine_without_guest().run_pass(&cluster(1), &current).await.unwrap();
        assert!(out.next.is_none());
        assert!(matches!(out.event, PassEvent::Waiting(_)));
        assert!(h.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_model_update_does_not_need_guest() {
        let h = Harness::new();
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", false, "Succeeded")]);

        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));
        let out = h.machine_without_guest().run_pass(&cluster(1), &current).await.unwrap();
        assert!(matches!(out.event, PassEvent::ModelUpdated { pool: PoolRole::Master, .. }));
        assert_eq!(h.mutations(), vec!["update master 0".to_string()]);
    }

    #[tokio::test]
    async fn test_cycle_completion_removes_leftover_drain_records() {
        let mut h = Harness::new();
        h.versions = FakeVersions(BTreeMap::from([
            ("master-000000".to_string(), "2".to_string()),
            ("worker-000000".to_string(), "2".to_string()),
        ]));
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", true, "Succeeded")]);
        h.set_pool(PoolRole::Worker, vec![instance(PoolRole::Worker, "0", true, "Succeeded")]);
        h.drains.records.lock().unwrap().push(NodeDrain::new(
            "c1-worker-000000",
            NodeDrainSpec {
                node_name: "worker-000000".to_string(),
                cluster_id: "c1".to_string(),
            },
        ));
        mark_drained(&h, "worker-000000");

        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));
        let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
        assert_eq!(out.event, PassEvent::CycleCompleted);
        assert_eq!(h.mutations(), vec!["delete worker-000000".to_string()]);
        assert!(h.drains.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_listing_is_returned() {
        let h = Harness::new();
        h.set_pool(PoolRole::Master, vec![instance(PoolRole::Master, "0", false, "Succeeded")]);
        let retry_at = Utc::now() + chrono::Duration::seconds(120);
        *h.scale_sets.limited_until.lock().unwrap() = Some(retry_at);

        let current = stage(RolloutStage::InstancesUpgrading, None, Some(1));
        let err = h.machine().run_pass(&cluster(1), &current).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert!(!err.is_recoverable_wait());
        assert_eq!(err.retry_at(), Some(retry_at));
        assert!(h.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_lost_deployment_reference_resubmits() {
        let h = Harness::new();
        let current = stage(RolloutStage::DeploymentInitialized, None, Some(1));
        let out = h.machine().run_pass(&cluster(1), &current).await.unwrap();
        assert_eq!(out.next, Some(PersistedStage::default()));
    }

    #[test]
    fn test_event_labels() {
        let e = PassEvent::Reimaged {
            pool: PoolRole::Worker,
            node: "worker-000001".to_string(),
        };
        assert_eq!(e.reason(), Some("Reimaged"));
        assert_eq!(e.pool_action(), Some((PoolRole::Worker, "reimage")));
        assert_eq!(e.to_string(), "Reimaged worker node worker-000001");
        assert_eq!(PassEvent::Idle.reason(), None);
        assert!(PassEvent::Waiting("x".to_string()).pool_action().is_none());
    }
}
