//! Working-set selection: the single next action for one pool.
//!
//! Pure decision logic over a fresh snapshot of instances, drain records and
//! tracked node versions. Ties are always broken by list order.

use std::collections::BTreeMap;

use crate::azure::scaleset::ScaleSetInstance;
use crate::crd::{ManagedClusterSpec, NodeDrain, PoolRole};
use crate::nodes::node_name;

/// Desired state of one pool, derived from the cluster spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredNodeSpec {
    pub pool_role: PoolRole,
    pub pool_name: String,
    pub vm_size: String,
    pub zones: Vec<String>,
    /// Disk role -> size in GiB.
    pub disk_sizes: BTreeMap<String, u32>,
    /// Secret the bootstrap blob reference is published to.
    pub bootstrap_ref: String,
    /// Desired-version token compared against each node's tracked version.
    pub version: String,
}

impl DesiredNodeSpec {
    pub fn for_pool(spec: &ManagedClusterSpec, role: PoolRole) -> Self {
        let pool = spec.pool(role);
        Self {
            pool_role: role,
            pool_name: pool.name.clone(),
            vm_size: pool.vm_size.clone(),
            zones: pool.zones.clone(),
            disk_sizes: pool
                .data_disks
                .iter()
                .map(|d| (d.role.clone(), d.size_gb))
                .collect(),
            bootstrap_ref: spec.bootstrap_secret_ref.clone(),
            version: spec.version.clone(),
        }
    }

    /// True if any disk role present on both sides differs in size.
    fn disk_mismatch(&self, instance: &ScaleSetInstance) -> bool {
        instance.data_disk_sizes.iter().any(|(role, size)| {
            self.disk_sizes
                .get(role)
                .is_some_and(|desired| desired != size)
        })
    }
}

/// The one action chosen for a pool in this pass.
///
/// Variants are exclusive, so at most one instance is ever acted on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WorkingSet {
    /// Nothing to do: the pool has converged.
    #[default]
    Converged,
    /// The provider is already mutating this instance.
    InProgress(ScaleSetInstance),
    /// Apply the latest scale-set model without touching the OS disk.
    Update(ScaleSetInstance),
    /// Request a drain before reimaging.
    Drain(ScaleSetInstance),
    /// Drain has finished; reimage now.
    Reimage(ScaleSetInstance),
}

impl WorkingSet {
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub const fn instance(&self) -> Option<&ScaleSetInstance> {
        match self {
            Self::Converged => None,
            Self::InProgress(i) | Self::Update(i) | Self::Drain(i) | Self::Reimage(i) => Some(i),
        }
    }
}

/// Choose the next action for a pool. First match wins:
///
/// 1. any instance with a non-terminal provisioning state;
/// 2. any instance not running the latest model;
/// 3. the first instance whose tracked version or disk sizes differ from
///    `desired`, reimaged if its drain finished and drained otherwise.
///
/// If any instance has no tracked version yet the pool is treated as freshly
/// created and converged.
pub fn select(
    instances: &[ScaleSetInstance],
    drains: &[NodeDrain],
    desired: &DesiredNodeSpec,
    version_by_node: &BTreeMap<String, String>,
) -> WorkingSet {
    if let Some(busy) = instances.iter().find(|i| !i.is_provisioning_terminal()) {
        return WorkingSet::InProgress(busy.clone());
    }

    if let Some(stale) = instances.iter().find(|i| !i.latest_model_applied) {
        return WorkingSet::Update(stale.clone());
    }

    let mut mismatched = None;
    for instance in instances {
        let name = node_name(&desired.pool_name, &instance.instance_id);
        let Some(tracked) = version_by_node.get(&name) else {
            return WorkingSet::Converged;
        };
        if mismatched.is_none() && (*tracked != desired.version || desired.disk_mismatch(instance)) {
            mismatched = Some((instance, name));
        }
    }

    let Some((instance, name)) = mismatched else {
        return WorkingSet::Converged;
    };

    let drained = drains
        .iter()
        .any(|d| d.spec.node_name == name && d.is_terminal());
    if drained {
        WorkingSet::Reimage(instance.clone())
    } else {
        WorkingSet::Drain(instance.clone())
    }
}
