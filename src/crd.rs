//! `ManagedCluster` and `NodeDrain` CRD type definitions.

pub mod cluster;
pub mod drain;
pub mod types;

pub use cluster::{
    ClusterCondition, ManagedCluster, ManagedClusterSpec, ManagedClusterStatus, NetworkOutputs,
    PoolSpec,
};
pub use drain::{DrainConditionType, NodeDrain, NodeDrainSpec};
pub use types::PoolRole;
